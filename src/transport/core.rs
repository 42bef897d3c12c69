//! Transport core shared by clients and servers.
//!
//! [`Transport`] owns the codec, the session registry and the pending request
//! table, and runs one receive loop per connection.
//!
//! # Receive Loop
//!
//! Each decoded frame goes to exactly one place:
//!
//! | Frame | Destination |
//! |-------|-------------|
//! | Message answering a pending request | That request's caller |
//! | Error-typed message with nil id | Flushes every pending request |
//! | Any other message | [`Handler::on_message`], spawned |
//! | Decode error answering a pending request | That request's caller |
//! | Other decode error | [`Handler::on_receive_error`], spawned |
//! | Close frame | Ends the loop |
//!
//! Handlers run on their own tasks, so a slow handler never stalls reads.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{MessageId, TypeId};
use crate::protocol::{BincodePayload, DecodeOutcome, Incoming, MessageSet, PayloadCodec, WoofCodec};
use crate::session::{Session, SessionRegistry};

use super::connection::ConnectionHandle;
use super::options::TransportOptions;
use super::pending::PendingRequestTable;

// ============================================================================
// Constants
// ============================================================================

/// Close reason used when a peer exceeds the receive limit.
const LENGTH_EXCEEDED_REASON: &str = "MESSAGE TOO BIG";

// ============================================================================
// ServiceState
// ============================================================================

/// Lifecycle state of a client or server.
///
/// `Stopped → Starting → Started → Stopping → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Not running.
    Stopped,
    /// Connecting or binding.
    Starting,
    /// Running.
    Started,
    /// Shutting down.
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Started => f.write_str("started"),
            Self::Stopping => f.write_str("stopping"),
        }
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Cancellation signal for all loops of one service.
#[derive(Debug)]
pub(crate) struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is triggered.
    pub(crate) async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Observer of transport events.
///
/// Every method has a no-op default. Calls are spawned on their own tasks.
#[async_trait]
pub trait Handler<M, P = BincodePayload>: Send + Sync + 'static
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// A message arrived that no pending request was waiting for.
    async fn on_message(&self, _peer: Peer<M, P>, _incoming: Incoming<M>) {}

    /// A frame could not be decoded.
    async fn on_receive_error(&self, _peer: Peer<M, P>, _error: Error) {}

    /// An incoming connection failed before it was established.
    async fn on_connect_error(&self, _error: Error) {}

    /// The service changed state.
    async fn on_state_changed(&self, _state: ServiceState) {}

    /// A connection was established.
    async fn on_connection_opened(&self, _peer: Peer<M, P>) {}

    /// A connection is about to be closed and its session discarded.
    async fn on_connection_closing(&self, _peer: Peer<M, P>) {}
}

/// Handler that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl<M: MessageSet, P: PayloadCodec> Handler<M, P> for NoopHandler {}

// ============================================================================
// Peer
// ============================================================================

/// One connection as seen by a handler.
pub struct Peer<M, P = BincodePayload> {
    transport: Transport<M, P>,
    connection: ConnectionHandle,
}

impl<M, P> Clone for Peer<M, P> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl<M, P> fmt::Debug for Peer<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("connection", &self.connection)
            .finish()
    }
}

impl<M, P> Peer<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Connection of the peer.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Transport the peer belongs to.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &Transport<M, P> {
        &self.transport
    }

    /// Session of the peer.
    ///
    /// Detached and empty once the connection was cleaned up.
    pub fn session(&self) -> Arc<Session> {
        self.transport.sessions().get(&self.connection)
    }

    /// Sends a message with a fresh id.
    pub async fn send(&self, message: impl Into<M>) -> Result<MessageId> {
        self.transport
            .send(&self.connection, &message.into(), None)
            .await
    }

    /// Replies to the message `to`, echoing its id.
    pub async fn respond(&self, to: MessageId, message: impl Into<M>) -> Result<()> {
        self.transport
            .send(&self.connection, &message.into(), Some(to))
            .await?;
        Ok(())
    }

    /// Sends a request and waits for the response.
    ///
    /// Uses the transport's default request timeout.
    pub async fn send_and_receive<R>(&self, request: impl Into<M>) -> Result<R>
    where
        R: TryFrom<M, Error = M>,
    {
        let timeout = self.transport.options().request_timeout;
        self.transport
            .send_and_receive(&self.connection, request.into(), timeout)
            .await
    }

    /// Closes the connection.
    pub async fn close(&self, reason: &str) {
        self.connection.close_output(reason).await;
    }
}

// ============================================================================
// Transport
// ============================================================================

struct TransportInner<M, P> {
    codec: WoofCodec<M, P>,
    sessions: SessionRegistry,
    pending: Arc<PendingRequestTable<M>>,
    handler: Arc<dyn Handler<M, P>>,
    options: TransportOptions,
    state: Mutex<ServiceState>,
    shutdown: Shutdown,
}

/// Codec, sessions and correlation for one client or server.
///
/// Cheap to clone; clones share all state.
pub struct Transport<M, P = BincodePayload> {
    inner: Arc<TransportInner<M, P>>,
}

impl<M, P> Clone for Transport<M, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, P> fmt::Debug for Transport<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("state", &*self.inner.state.lock())
            .field("sessions", &self.inner.sessions)
            .field("pending", &self.inner.pending)
            .finish()
    }
}

// ============================================================================
// Transport - Constructor & Accessors
// ============================================================================

impl<M, P> Transport<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Creates a stopped transport.
    pub fn new(
        codec: WoofCodec<M, P>,
        handler: Arc<dyn Handler<M, P>>,
        options: TransportOptions,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                codec,
                sessions: SessionRegistry::new(),
                pending: Arc::new(PendingRequestTable::new()),
                handler,
                options,
                state: Mutex::new(ServiceState::Stopped),
                shutdown: Shutdown::new(),
            }),
        }
    }

    /// Frame codec.
    #[inline]
    #[must_use]
    pub fn codec(&self) -> &WoofCodec<M, P> {
        &self.inner.codec
    }

    /// Session registry.
    #[inline]
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Outstanding requests.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> &Arc<PendingRequestTable<M>> {
        &self.inner.pending
    }

    /// Options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock()
    }

    /// Wraps a connection for handler calls.
    #[must_use]
    pub fn peer(&self, connection: ConnectionHandle) -> Peer<M, P> {
        Peer {
            transport: self.clone(),
            connection,
        }
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler<M, P>> {
        &self.inner.handler
    }

    pub(crate) fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }
}

// ============================================================================
// Transport - Lifecycle
// ============================================================================

impl<M, P> Transport<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Moves `Stopped → Starting`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] from any other state.
    pub(crate) fn begin_start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ServiceState::Stopped {
                return Err(Error::invalid_state("start", *state));
            }
            *state = ServiceState::Starting;
        }
        self.inner.shutdown.reset();
        self.notify_state(ServiceState::Starting);
        Ok(())
    }

    /// Moves `Starting | Started → Stopping`.
    ///
    /// Returns `false` if already stopping or stopped.
    pub(crate) fn begin_stop(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ServiceState::Starting | ServiceState::Started => *state = ServiceState::Stopping,
                ServiceState::Stopping | ServiceState::Stopped => return false,
            }
        }
        self.notify_state(ServiceState::Stopping);
        true
    }

    /// Moves `Starting → state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if a stop moved the service out of
    /// `Starting` in the meantime.
    pub(crate) fn finish_start(&self, state: ServiceState) -> Result<()> {
        {
            let mut current = self.inner.state.lock();
            if *current != ServiceState::Starting {
                return Err(Error::invalid_state("start", *current));
            }
            *current = state;
        }
        self.notify_state(state);
        Ok(())
    }

    pub(crate) fn set_state(&self, state: ServiceState) {
        {
            let mut current = self.inner.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.notify_state(state);
    }

    fn notify_state(&self, state: ServiceState) {
        debug!(%state, "Service state changed");
        let handler = Arc::clone(&self.inner.handler);
        tokio::spawn(async move { handler.on_state_changed(state).await });
    }
}

// ============================================================================
// Transport - Send
// ============================================================================

impl<M, P> Transport<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Sends a message on `connection`.
    ///
    /// A `None` id generates a fresh one. Sending on a closed connection is a
    /// silent no-op.
    ///
    /// # Returns
    ///
    /// The id the message was sent with.
    pub async fn send(
        &self,
        connection: &ConnectionHandle,
        message: &M,
        id: Option<MessageId>,
    ) -> Result<MessageId> {
        self.inner
            .codec
            .send_encoded(connection, &self.inner.sessions, message, id)
            .await
    }

    /// Sends an unsigned frame with an arbitrary type id and raw payload.
    pub async fn send_raw(
        &self,
        connection: &ConnectionHandle,
        type_id: TypeId,
        payload: Vec<u8>,
        id: Option<MessageId>,
    ) -> Result<MessageId> {
        let frame = self.inner.codec.encode_raw(type_id, payload, id, None)?;
        self.inner.codec.send_frame(connection, &frame).await?;
        Ok(frame.id)
    }

    /// Sends a request and waits for its response.
    ///
    /// # Arguments
    ///
    /// * `connection` - Connection to send on
    /// * `request` - Request message
    /// * `timeout` - Maximum wait, `None` waits until the connection closes
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is or becomes closed
    /// - [`Error::RequestTimeout`] if no response arrives in time
    /// - [`Error::UnexpectedMessage`] if the response is not an `R`
    /// - [`Error::RequestsFlushed`] if an unmatched error message arrived
    pub async fn send_and_receive<R>(
        &self,
        connection: &ConnectionHandle,
        request: M,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        R: TryFrom<M, Error = M>,
    {
        let mut pending = self.inner.pending.register(connection.id());

        // Registered after the loop exited: nobody would fail this slot.
        if !connection.is_open() {
            return Err(Error::ConnectionClosed);
        }

        self.send(connection, &request, Some(pending.id())).await?;
        let response = pending.wait(timeout).await?;

        R::try_from(response).map_err(Error::unexpected_message)
    }
}

// ============================================================================
// Transport - Receive Loop
// ============================================================================

impl<M, P> Transport<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Runs the receive loop of `connection` until it closes or the
    /// transport shuts down.
    ///
    /// Requests still pending on the connection fail with
    /// [`Error::ConnectionClosed`] on exit.
    pub async fn run(&self, connection: ConnectionHandle) {
        let peer = self.peer(connection.clone());
        let limit = self.inner.options.max_receive_size;

        debug!(connection = %connection.id(), "Receive loop started");

        loop {
            if self.inner.shutdown.is_triggered() || connection.is_closed() {
                break;
            }

            let outcome = tokio::select! {
                biased;
                () = self.inner.shutdown.triggered() => break,
                outcome = self.inner.codec.decode(&connection, &self.inner.sessions, limit) => outcome,
            };

            match outcome {
                Ok(DecodeOutcome::Message(incoming)) => self.dispatch(&peer, incoming),
                Ok(DecodeOutcome::Close(status)) => {
                    debug!(connection = %connection.id(), ?status, "Peer closed connection");
                    break;
                }
                Ok(DecodeOutcome::Error { message_id, error }) => {
                    let fatal = matches!(error, Error::LengthExceeded { .. });
                    self.report(&peer, message_id, error);
                    if fatal {
                        connection.close_output(LENGTH_EXCEEDED_REASON).await;
                        break;
                    }
                }
                Err(error) if error.is_closed() => break,
                Err(error) => self.report(&peer, None, error),
            }
        }

        let failed = self
            .inner
            .pending
            .fail_connection(connection.id(), || Error::ConnectionClosed);

        debug!(connection = %connection.id(), failed, "Receive loop ended");
    }

    fn dispatch(&self, peer: &Peer<M, P>, incoming: Incoming<M>) {
        let id = incoming.message_id;

        if let Some(tx) = self.inner.pending.take(id, peer.connection().id()) {
            trace!(message_id = %id, "Response matched pending request");
            let _ = tx.send(Ok(incoming.message));
            return;
        }

        if incoming.is_error && id.is_nil() {
            let flushed = self.inner.pending.dispose();
            warn!(
                connection = %peer.connection().id(),
                type_id = %incoming.type_id,
                flushed,
                "Unmatched error message, pending requests released"
            );
            return;
        }

        let handler = Arc::clone(&self.inner.handler);
        let peer = peer.clone();
        tokio::spawn(async move { handler.on_message(peer, incoming).await });
    }

    fn report(&self, peer: &Peer<M, P>, message_id: Option<MessageId>, error: Error) {
        if let Some(id) = message_id
            && let Some(tx) = self.inner.pending.take(id, peer.connection().id())
        {
            debug!(message_id = %id, error = %error, "Decode error routed to pending request");
            let _ = tx.send(Err(error));
            return;
        }

        warn!(connection = %peer.connection().id(), error = %error, "Receive error");

        let handler = Arc::clone(&self.inner.handler);
        let peer = peer.clone();
        tokio::spawn(async move { handler.on_receive_error(peer, error).await });
    }
}

// ============================================================================
// Tests
// ============================================================================
