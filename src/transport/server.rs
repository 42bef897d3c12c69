//! WOOF WebSocket server.
//!
//! Accepts any number of connections on one listener. Every connection gets
//! its own session and receive loop; all of them share one [`Transport`].
//!
//! # Connection Flow
//!
//! 1. TCP connection accepted
//! 2. WebSocket upgrade, echoing the `WOOF` subprotocol when offered
//! 3. Session opened, [`Handler::on_connection_opened`] notified
//! 4. Receive loop runs until the peer closes or the server stops
//! 5. [`Handler::on_connection_closing`] notified, session discarded
//!
//! # Example
//!
//! ```no_run
//! use woof_websocket::{Message, Server, TypeId, message_set};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Clone, Serialize, Deserialize)]
//! struct Ping;
//!
//! impl Message for Ping {
//!     const TYPE_ID: TypeId = TypeId::new(1);
//! }
//!
//! message_set! {
//!     #[derive(Debug, Clone)]
//!     pub enum Api {
//!         Ping(Ping),
//!     }
//! }
//!
//! # async fn example() -> woof_websocket::Result<()> {
//! let server = Server::<Api>::builder().bind("127.0.0.1:9000").build()?;
//! let addr = server.start().await?;
//! println!("Listening on ws://{addr}");
//!
//! let delivered = server.broadcast(Ping).await;
//! server.stop().await;
//! # let _ = delivered;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, MessageId};
use crate::protocol::{BincodePayload, MessageSet, PayloadCodec, SUBPROTOCOL};
use crate::session::{Session, SessionRegistry};

use super::builder::ServerBuilder;
use super::connection::ConnectionHandle;
use super::core::{ServiceState, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Close reason sent to every peer on [`Server::stop`].
const SHUTDOWN_REASON: &str = "SERVER SHUTDOWN";

// ============================================================================
// Server
// ============================================================================

struct ServerInner<M, P> {
    transport: Transport<M, P>,
    bind_addr: SocketAddr,
    local_addr: RwLock<Option<SocketAddr>>,
    connections: RwLock<FxHashMap<ConnectionId, ConnectionHandle>>,
    tasks: Mutex<JoinSet<()>>,
}

/// WOOF server accepting many concurrent connections.
///
/// Cheap to clone; clones control the same server.
pub struct Server<M, P = BincodePayload> {
    inner: Arc<ServerInner<M, P>>,
}

impl<M, P> Clone for Server<M, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, P> fmt::Debug for Server<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("bind_addr", &self.inner.bind_addr)
            .field("local_addr", &*self.inner.local_addr.read())
            .field("connections", &self.inner.connections.read().len())
            .finish()
    }
}

// ============================================================================
// Server - Constructor
// ============================================================================

impl<M: MessageSet> Server<M, BincodePayload> {
    /// Creates a builder using the bincode payload codec.
    #[inline]
    #[must_use]
    pub fn builder() -> ServerBuilder<M, BincodePayload> {
        ServerBuilder::new()
    }
}

impl<M, P> Server<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    pub(crate) fn new(transport: Transport<M, P>, bind_addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                transport,
                bind_addr,
                local_addr: RwLock::new(None),
                connections: RwLock::new(FxHashMap::default()),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }
}

// ============================================================================
// Server - Accessors
// ============================================================================

impl<M, P> Server<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.inner.transport.state()
    }

    /// Shared transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &Transport<M, P> {
        &self.inner.transport
    }

    /// Session registry.
    #[inline]
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        self.inner.transport.sessions()
    }

    /// Configured bind address.
    #[inline]
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.inner.bind_addr
    }

    /// Address actually bound while started.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// Number of open connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Snapshot of the open connections.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.inner.connections.read().values().cloned().collect()
    }

    /// Looks up an open connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.connections.read().get(&id).cloned()
    }

    /// Session of an open connection.
    #[must_use]
    pub fn session(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions().find(id)
    }
}

// ============================================================================
// Server - Lifecycle
// ============================================================================

impl<M, P> Server<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Binds the listener and starts accepting connections.
    ///
    /// # Returns
    ///
    /// The bound address, useful with port `0`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if not stopped
    /// - [`Error::Io`] if binding fails
    pub async fn start(&self) -> Result<SocketAddr> {
        let transport = &self.inner.transport;
        transport.begin_start()?;

        let bound = match TcpListener::bind(self.inner.bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                let _ = transport.finish_start(ServiceState::Stopped);
                return Err(e.into());
            }
        };

        // Held until the accept loop is spawned so a concurrent stop drains it.
        let mut tasks = self.inner.tasks.lock();
        if let Err(e) = transport.finish_start(ServiceState::Started) {
            warn!(%local_addr, error = %e, "Stopped while binding");
            return Err(e);
        }
        *self.inner.local_addr.write() = Some(local_addr);
        let server = self.clone();
        tasks.spawn(async move { server.accept_loop(listener).await });
        drop(tasks);

        info!(%local_addr, "Server started");
        Ok(local_addr)
    }

    /// Closes every connection and stops accepting.
    ///
    /// Idempotent. Close handshakes and connection teardown share one
    /// deadline of [`TransportOptions::shutdown_grace`](super::TransportOptions).
    pub async fn stop(&self) {
        let transport = &self.inner.transport;
        if !transport.begin_stop() {
            return;
        }

        info!("Server stopping");
        let deadline = Instant::now() + transport.options().shutdown_grace;

        let closes = self
            .connections()
            .into_iter()
            .map(|connection| async move { connection.close(SHUTDOWN_REASON).await });
        if timeout_at(deadline, join_all(closes)).await.is_err() {
            warn!("Close handshakes did not finish within grace period");
        }

        transport.shutdown().trigger();

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let drained = timeout_at(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Connection tasks aborted");
            tasks.abort_all();
        }

        self.inner.connections.write().clear();
        transport.sessions().close_all();
        transport.pending().dispose();
        *self.inner.local_addr.write() = None;

        transport.set_state(ServiceState::Stopped);
        info!("Server stopped");
    }
}

// ============================================================================
// Server - Send
// ============================================================================

impl<M, P> Server<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Sends a message to one connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if `id` is not an open connection.
    pub async fn send(&self, id: ConnectionId, message: impl Into<M>) -> Result<MessageId> {
        let connection = self.connection(id).ok_or(Error::ConnectionClosed)?;
        self.inner
            .transport
            .send(&connection, &message.into(), None)
            .await
    }

    /// Sends a request to one connection and waits for the response.
    ///
    /// Uses the default request timeout.
    pub async fn send_and_receive<R>(&self, id: ConnectionId, request: impl Into<M>) -> Result<R>
    where
        R: TryFrom<M, Error = M>,
    {
        let connection = self.connection(id).ok_or(Error::ConnectionClosed)?;
        let transport = &self.inner.transport;
        transport
            .send_and_receive(&connection, request.into(), transport.options().request_timeout)
            .await
    }

    /// Sends a message to every open connection concurrently.
    ///
    /// Each copy is signed with the recipient's session key.
    ///
    /// # Returns
    ///
    /// Number of connections the message was handed to.
    pub async fn broadcast(&self, message: impl Into<M>) -> usize {
        let message = message.into();
        let transport = &self.inner.transport;
        let connections = self.connections();

        let sends = connections.iter().map(|connection| {
            let message = &message;
            async move { transport.send(connection, message, None).await }
        });

        let results = join_all(sends).await;
        let delivered = results.iter().filter(|result| result.is_ok()).count();

        debug!(
            recipients = connections.len(),
            delivered, "Broadcast finished"
        );
        delivered
    }
}

// ============================================================================
// Server - Accept Loop
// ============================================================================

impl<M, P> Server<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    async fn accept_loop(self, listener: TcpListener) {
        let transport = self.inner.transport.clone();
        debug!("Accept loop started");

        loop {
            let accepted = tokio::select! {
                biased;
                () = transport.shutdown().triggered() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    let mut tasks = self.inner.tasks.lock();
                    while tasks.try_join_next().is_some() {}
                    tasks.spawn(async move { server.handle_connection(stream, addr).await });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    self.notify_connect_error(e.into());
                }
            }
        }

        debug!("Accept loop ended");
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) {
        let local_addr = stream.local_addr().ok();

        let ws = match accept_hdr_async(stream, negotiate).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(?addr, error = %e, "WebSocket upgrade failed");
                self.notify_connect_error(Error::connection(format!(
                    "WebSocket upgrade from {addr} failed: {e}"
                )));
                return;
            }
        };

        let transport = self.inner.transport.clone();
        let connection = ConnectionHandle::new(ws, local_addr, Some(addr));
        let id = connection.id();

        transport.sessions().open(&connection);
        self.inner
            .connections
            .write()
            .insert(id, connection.clone());
        info!(connection = %id, %addr, "Client connected");

        let handler = Arc::clone(transport.handler());
        let peer = transport.peer(connection.clone());
        tokio::spawn(async move { handler.on_connection_opened(peer).await });

        transport.run(connection.clone()).await;

        self.cleanup(connection).await;
    }

    /// Tears a connection down once its receive loop ended.
    async fn cleanup(&self, connection: ConnectionHandle) {
        let id = connection.id();
        if self.inner.connections.write().remove(&id).is_none() {
            return;
        }

        let transport = &self.inner.transport;
        let handler = Arc::clone(transport.handler());
        let peer = transport.peer(connection.clone());
        if let Err(e) = tokio::spawn(async move { handler.on_connection_closing(peer).await }).await
        {
            warn!(connection = %id, error = %e, "Closing handler failed");
        }

        transport.sessions().close(id);

        let grace = transport.options().shutdown_grace;
        if timeout(grace, connection.close("")).await.is_err() {
            debug!(connection = %id, "Close handshake timed out");
        }

        transport
            .pending()
            .fail_connection(id, || Error::ConnectionClosed);

        info!(connection = %id, "Client disconnected");
    }

    fn notify_connect_error(&self, error: Error) {
        let handler = Arc::clone(self.inner.transport.handler());
        tokio::spawn(async move { handler.on_connect_error(error).await });
    }
}

// ============================================================================
// Subprotocol Negotiation
// ============================================================================

/// Echoes `WOOF` when the client offers it.
///
/// Clients that offer no subprotocol are accepted as well.
fn negotiate(request: &Request, mut response: Response) -> std::result::Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == SUBPROTOCOL);

    if offered {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    } else {
        debug!(uri = %request.uri(), "Client did not offer WOOF subprotocol");
    }

    Ok(response)
}

// ============================================================================
// Tests
// ============================================================================
