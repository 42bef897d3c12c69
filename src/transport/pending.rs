//! Request/response correlation.
//!
//! Each request expecting a response gets a fresh [`MessageId`] and a
//! oneshot slot in the [`PendingRequestTable`]. The receive loop resolves the
//! slot when a message with that id arrives.
//!
//! A slot is removed exactly once: by the response, by an explicit failure,
//! by [`PendingRequestTable::dispose`], or when its [`PendingRequest`] is
//! dropped (timeout or cancellation).

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, MessageId};

// ============================================================================
// Types
// ============================================================================

struct Slot<M> {
    connection: ConnectionId,
    tx: oneshot::Sender<Result<M>>,
}

// ============================================================================
// PendingRequestTable
// ============================================================================

/// Outstanding requests keyed by message id.
pub struct PendingRequestTable<M> {
    slots: Mutex<FxHashMap<MessageId, Slot<M>>>,
}

impl<M> Default for PendingRequestTable<M> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<M> fmt::Debug for PendingRequestTable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequestTable")
            .field("pending", &self.len())
            .finish()
    }
}

impl<M> PendingRequestTable<M> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns `true` if nothing is outstanding.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Returns `true` if `id` is outstanding.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.slots.lock().contains_key(&id)
    }

    /// Creates a slot for a request sent on `connection`.
    pub fn register(self: &Arc<Self>, connection: ConnectionId) -> PendingRequest<M> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();

        let mut id = MessageId::generate();
        while slots.contains_key(&id) {
            id = MessageId::generate();
        }
        slots.insert(id, Slot { connection, tx });

        trace!(message_id = %id, pending = slots.len(), "Pending request registered");

        PendingRequest {
            id,
            rx,
            table: Arc::downgrade(self),
        }
    }

    /// Delivers a response.
    ///
    /// Hands the message back if no request is waiting for `id`.
    pub fn resolve(&self, id: MessageId, message: M) -> std::result::Result<(), M> {
        match self.slots.lock().remove(&id) {
            Some(slot) => {
                // A dropped receiver means the caller gave up already.
                let _ = slot.tx.send(Ok(message));
                Ok(())
            }
            None => Err(message),
        }
    }

    /// Removes the slot of a request sent on `connection` and returns its sender.
    ///
    /// A slot registered for another connection is left in place.
    pub(crate) fn take(
        &self,
        id: MessageId,
        connection: ConnectionId,
    ) -> Option<oneshot::Sender<Result<M>>> {
        let mut slots = self.slots.lock();
        match slots.get(&id) {
            Some(slot) if slot.connection == connection => slots.remove(&id).map(|slot| slot.tx),
            Some(slot) => {
                trace!(
                    message_id = %id,
                    expected = %slot.connection,
                    received = %connection,
                    "Response arrived on another connection"
                );
                None
            }
            None => None,
        }
    }

    /// Fails one request.
    ///
    /// Returns `false` if no request is waiting for `id`.
    pub fn fail(&self, id: MessageId, error: Error) -> bool {
        match self.slots.lock().remove(&id) {
            Some(slot) => {
                let _ = slot.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every request sent on `connection`.
    pub fn fail_connection(&self, connection: ConnectionId, error: impl Fn() -> Error) -> usize {
        let failed: Vec<_> = {
            let mut slots = self.slots.lock();
            let ids: Vec<_> = slots
                .iter()
                .filter(|(_, slot)| slot.connection == connection)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| slots.remove(&id)).collect()
        };

        let count = failed.len();
        for slot in failed {
            let _ = slot.tx.send(Err(error()));
        }

        if count > 0 {
            debug!(connection = %connection, count, "Pending requests failed");
        }
        count
    }

    /// Releases every outstanding request with [`Error::RequestsFlushed`].
    pub fn dispose(&self) -> usize {
        let drained: Vec<_> = self.slots.lock().drain().collect();

        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.tx.send(Err(Error::RequestsFlushed));
        }

        if count > 0 {
            debug!(count, "Pending requests flushed");
        }
        count
    }

    fn remove(&self, id: MessageId) {
        if self.slots.lock().remove(&id).is_some() {
            trace!(message_id = %id, "Pending request abandoned");
        }
    }
}

// ============================================================================
// PendingRequest
// ============================================================================

/// Waiting side of one pending request.
///
/// Dropping it removes the slot from the table.
pub struct PendingRequest<M> {
    id: MessageId,
    rx: oneshot::Receiver<Result<M>>,
    table: Weak<PendingRequestTable<M>>,
}

impl<M> fmt::Debug for PendingRequest<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest").field("id", &self.id).finish()
    }
}

impl<M> PendingRequest<M> {
    /// Id the request must be sent with.
    #[inline]
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Waits for the response.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if `wait_timeout` elapses
    /// - [`Error::Cancelled`] if the slot was dropped without an answer
    /// - Any error the slot was failed with
    pub async fn wait(&mut self, wait_timeout: Option<Duration>) -> Result<M> {
        let received = match wait_timeout {
            Some(duration) => match timeout(duration, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(Error::request_timeout(
                        self.id,
                        duration.as_millis() as u64,
                    ));
                }
            },
            None => (&mut self.rx).await,
        };

        received.map_err(|_| Error::Cancelled)?
    }
}

impl<M> Drop for PendingRequest<M> {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<PendingRequestTable<u32>> {
        Arc::new(PendingRequestTable::new())
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let table = table();
        let mut pending = table.register(ConnectionId::next());
        assert!(table.contains(pending.id()));

        assert!(table.resolve(pending.id(), 42).is_ok());
        assert_eq!(pending.wait(None).await.unwrap(), 42);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_returns_message() {
        let table = table();
        assert_eq!(table.resolve(MessageId::generate(), 7), Err(7));
    }

    #[tokio::test]
    async fn test_timeout_removes_slot() {
        let table = table();
        let mut pending = table.register(ConnectionId::next());
        let id = pending.id();

        let err = pending
            .wait(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        drop(pending);
        assert!(!table.contains(id));
        assert!(table.resolve(id, 1).is_err());
    }

    #[tokio::test]
    async fn test_dispose_releases_all() {
        let table = table();
        let mut first = table.register(ConnectionId::next());
        let mut second = table.register(ConnectionId::next());

        assert_eq!(table.dispose(), 2);
        assert!(matches!(first.wait(None).await, Err(Error::RequestsFlushed)));
        assert!(matches!(second.wait(None).await, Err(Error::RequestsFlushed)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_connection_is_scoped() {
        let table = table();
        let closed = ConnectionId::next();
        let alive = ConnectionId::next();
        let mut lost = table.register(closed);
        let kept = table.register(alive);

        assert_eq!(table.fail_connection(closed, || Error::ConnectionClosed), 1);
        assert!(matches!(lost.wait(None).await, Err(Error::ConnectionClosed)));
        assert!(table.contains(kept.id()));
    }

    #[tokio::test]
    async fn test_fail_one() {
        let table = table();
        let mut pending = table.register(ConnectionId::next());

        assert!(table.fail(pending.id(), Error::HeaderIncomplete));
        assert!(matches!(
            pending.wait(None).await,
            Err(Error::HeaderIncomplete)
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_resolution() {
        let table = table();
        let mut requests: Vec<_> = (0..8).map(|_| table.register(ConnectionId::next())).collect();

        for (value, pending) in requests.iter().enumerate().rev() {
            assert!(table.resolve(pending.id(), value as u32).is_ok());
        }

        for (value, pending) in requests.iter_mut().enumerate() {
            assert_eq!(pending.wait(None).await.unwrap(), value as u32);
        }
    }

    #[tokio::test]
    async fn test_take_is_scoped_to_connection() {
        let table = table();
        let owner = ConnectionId::next();
        let pending = table.register(owner);

        assert!(table.take(pending.id(), ConnectionId::next()).is_none());
        assert!(table.contains(pending.id()));

        assert!(table.take(pending.id(), owner).is_some());
        assert!(!table.contains(pending.id()));
    }

    #[tokio::test]
    async fn test_dropped_sender_cancels_waiter() {
        let table = table();
        let owner = ConnectionId::next();
        let mut pending = table.register(owner);

        drop(table.take(pending.id(), owner));
        assert!(matches!(pending.wait(None).await, Err(Error::Cancelled)));
    }

    #[test]
    fn test_unique_ids() {
        tokio_test::block_on(async {
            let table = table();
            let a = table.register(ConnectionId::next());
            let b = table.register(ConnectionId::next());
            assert_ne!(a.id(), b.id());
            assert_eq!(table.len(), 2);
        });
    }
}
