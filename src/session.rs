//! Per-connection session state.
//!
//! A [`Session`] holds the signing key of a peer plus typed values the
//! application attaches to it. Sessions are keyed by [`ConnectionId`], never
//! by anything the peer sends.
//!
//! # Modes
//!
//! | Mode | Used by | Sessions |
//! |------|---------|----------|
//! | Single | Client | One session, created on first use |
//! | Multi | Server | One session per open connection |
//!
//! The registry starts in single mode and switches to multi mode on the first
//! [`SessionRegistry::open`]. The switch is permanent.

// ============================================================================
// Imports
// ============================================================================

use std::any::{Any, TypeId as AnyTypeId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::identifiers::ConnectionId;
use crate::protocol::SigningKey;
use crate::transport::ConnectionHandle;

// ============================================================================
// Session
// ============================================================================

/// State attached to one peer.
pub struct Session {
    connection: Option<ConnectionHandle>,
    key: RwLock<Option<SigningKey>>,
    values: Mutex<FxHashMap<AnyTypeId, Box<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection.as_ref().map(ConnectionHandle::id))
            .field("authenticated", &self.is_authenticated())
            .field("values", &self.values.lock().len())
            .finish()
    }
}

impl Session {
    fn new(connection: Option<ConnectionHandle>) -> Self {
        Self {
            connection,
            key: RwLock::new(None),
            values: Mutex::new(FxHashMap::default()),
        }
    }

    /// Connection owning this session; `None` in single mode.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    /// Signing key, once authenticated.
    #[must_use]
    pub fn key(&self) -> Option<SigningKey> {
        self.key.read().clone()
    }

    /// Sets or clears the signing key.
    pub fn set_key(&self, key: impl Into<Option<SigningKey>>) {
        *self.key.write() = key.into();
    }

    /// Clears the signing key.
    pub fn clear_key(&self) {
        self.key.write().take();
    }

    /// Returns `true` if a signing key is set.
    #[inline]
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.key.read().is_some()
    }

    /// Stores a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        self.values.lock().insert(AnyTypeId::of::<T>(), Box::new(value));
    }

    /// Returns a clone of the stored value of type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.values
            .lock()
            .get(&AnyTypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Runs `f` on the value of type `T`, inserting the default first.
    pub fn with<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Send + Sync + Default,
    {
        let mut values = self.values.lock();
        let entry = values
            .entry(AnyTypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()));
        match entry.downcast_mut::<T>() {
            Some(value) => f(value),
            // Keys are derived from the stored type, so this arm is unreachable.
            None => f(&mut T::default()),
        }
    }

    /// Removes and returns the value of type `T`.
    pub fn remove<T: Any + Send + Sync>(&self) -> Option<T> {
        self.values
            .lock()
            .remove(&AnyTypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Maps connections to their sessions.
#[derive(Default)]
pub struct SessionRegistry {
    multi: AtomicBool,
    single: Mutex<Option<Arc<Session>>>,
    sessions: DashMap<ConnectionId, Arc<Session>>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("multi", &self.is_multi_session())
            .field("sessions", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Creates an empty registry in single-session mode.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once any connection was opened.
    #[inline]
    #[must_use]
    pub fn is_multi_session(&self) -> bool {
        self.multi.load(Ordering::Acquire)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.is_multi_session() {
            self.sessions.len()
        } else {
            usize::from(self.single.lock().is_some())
        }
    }

    /// Returns `true` if no session exists.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a connection with a fresh empty session.
    ///
    /// Switches the registry to multi-session mode.
    pub fn open(&self, connection: &ConnectionHandle) -> Arc<Session> {
        if !self.multi.swap(true, Ordering::AcqRel) {
            debug!("Session registry switched to multi-session mode");
        }

        let session = Arc::new(Session::new(Some(connection.clone())));
        self.sessions.insert(connection.id(), Arc::clone(&session));
        trace!(connection = %connection.id(), "Session opened");
        session
    }

    /// Discards the session of a connection.
    ///
    /// In single mode this discards the single session.
    pub fn close(&self, id: ConnectionId) -> Option<Arc<Session>> {
        let removed = if self.is_multi_session() {
            self.sessions.remove(&id).map(|(_, session)| session)
        } else {
            self.single.lock().take()
        };

        if removed.is_some() {
            trace!(connection = %id, "Session closed");
        }
        removed
    }

    /// Returns the session of a connection.
    ///
    /// In single mode every id maps to the single session. In multi mode only
    /// [`open`](Self::open) registers sessions: a connection that was never
    /// opened, or was already closed, gets a detached empty session that is
    /// not stored.
    pub fn get(&self, connection: &ConnectionHandle) -> Arc<Session> {
        if !self.is_multi_session() {
            return self.single();
        }

        if let Some(session) = self.find(connection.id()) {
            return session;
        }

        trace!(connection = %connection.id(), "Detached session for unregistered connection");
        Arc::new(Session::new(Some(connection.clone())))
    }

    /// Returns the session of a connection without creating one.
    #[must_use]
    pub fn find(&self, id: ConnectionId) -> Option<Arc<Session>> {
        if self.is_multi_session() {
            self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
        } else {
            self.single.lock().clone()
        }
    }

    /// Returns the single session, creating it if absent.
    pub fn single(&self) -> Arc<Session> {
        let mut single = self.single.lock();
        Arc::clone(single.get_or_insert_with(|| Arc::new(Session::new(None))))
    }

    /// Signing key of a connection's session.
    #[must_use]
    pub fn key(&self, id: ConnectionId) -> Option<SigningKey> {
        self.find(id).and_then(|session| session.key())
    }

    /// Discards every session.
    pub fn close_all(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        self.single.lock().take();
        if count > 0 {
            debug!(count, "Sessions closed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
