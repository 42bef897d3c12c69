//! WOOF WebSocket client.
//!
//! Holds one connection and a single session. When the connection drops,
//! the client stops itself and fails every outstanding request.
//!
//! # Example
//!
//! ```no_run
//! use woof_websocket::{Client, Message, TypeId, message_set};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Clone, Serialize, Deserialize)]
//! struct Ping;
//!
//! impl Message for Ping {
//!     const TYPE_ID: TypeId = TypeId::new(1);
//! }
//!
//! #[derive(Debug, Default, Clone, Serialize, Deserialize)]
//! struct Pong;
//!
//! impl Message for Pong {
//!     const TYPE_ID: TypeId = TypeId::new(2);
//! }
//!
//! message_set! {
//!     #[derive(Debug, Clone)]
//!     pub enum Api {
//!         Ping(Ping),
//!         Pong(Pong),
//!     }
//! }
//!
//! # async fn example() -> woof_websocket::Result<()> {
//! let client = Client::<Api>::builder()
//!     .url("ws://127.0.0.1:9000")
//!     .build()?;
//!
//! client.start().await?;
//! let _pong: Pong = client.send_and_receive(Ping).await?;
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::{MessageId, TypeId};
use crate::protocol::{BincodePayload, MessageSet, PayloadCodec, SUBPROTOCOL};
use crate::session::Session;

use super::builder::ClientBuilder;
use super::connection::ConnectionHandle;
use super::core::{ServiceState, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Close reason sent on [`Client::stop`].
const SHUTDOWN_REASON: &str = "CLIENT SHUTDOWN";

// ============================================================================
// Client
// ============================================================================

struct ClientInner<M, P> {
    transport: Transport<M, P>,
    url: Url,
    connect_timeout: Duration,
    connection: RwLock<Option<ConnectionHandle>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

/// WOOF client with a single connection.
///
/// Cheap to clone; clones control the same connection.
pub struct Client<M, P = BincodePayload> {
    inner: Arc<ClientInner<M, P>>,
}

impl<M, P> Clone for Client<M, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, P> fmt::Debug for Client<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.url.as_str())
            .field("connection", &*self.inner.connection.read())
            .finish()
    }
}

// ============================================================================
// Client - Constructor
// ============================================================================

impl<M: MessageSet> Client<M, BincodePayload> {
    /// Creates a builder using the bincode payload codec.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder<M, BincodePayload> {
        ClientBuilder::new()
    }
}

impl<M, P> Client<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    pub(crate) fn new(transport: Transport<M, P>, url: Url, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                url,
                connect_timeout,
                connection: RwLock::new(None),
                receive_task: Mutex::new(None),
            }),
        }
    }
}

// ============================================================================
// Client - Accessors
// ============================================================================

impl<M, P> Client<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Server URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

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

    /// Current connection, while started.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.inner.connection.read().clone()
    }

    /// The client's session.
    ///
    /// Store the signing key here after signing in.
    pub fn session(&self) -> Arc<Session> {
        self.inner.transport.sessions().single()
    }

    fn require_connection(&self) -> Result<ConnectionHandle> {
        self.connection().ok_or(Error::NotStarted)
    }
}

// ============================================================================
// Client - Lifecycle
// ============================================================================

impl<M, P> Client<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Connects to the server and starts the receive loop.
    ///
    /// Offers the `WOOF` subprotocol during the handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if not stopped, or stopped while connecting
    /// - [`Error::ConnectionTimeout`] if the handshake takes too long
    /// - [`Error::WebSocket`] if the handshake fails
    pub async fn start(&self) -> Result<()> {
        let transport = &self.inner.transport;
        transport.begin_start()?;

        let connection = match self.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(url = %self.inner.url, error = %e, "Connect failed");
                let _ = transport.finish_start(ServiceState::Stopped);
                return Err(e);
            }
        };

        *self.inner.connection.write() = Some(connection.clone());

        // Held until the loop is spawned so a concurrent stop sees the task.
        let started = {
            let mut receive_task = self.inner.receive_task.lock();
            transport.finish_start(ServiceState::Started).map(|()| {
                let client = self.clone();
                let connection = connection.clone();
                *receive_task = Some(tokio::spawn(async move {
                    client.inner.transport.run(connection).await;
                    client.on_disconnected().await;
                }));
            })
        };

        if let Err(e) = started {
            warn!(url = %self.inner.url, error = %e, "Stopped while connecting");
            self.discard(connection).await;
            return Err(e);
        }

        info!(url = %self.inner.url, connection = %connection.id(), "Client connected");
        Ok(())
    }

    /// Closes a connection a concurrent stop raced past.
    async fn discard(&self, connection: ConnectionHandle) {
        {
            let mut current = self.inner.connection.write();
            if current.as_ref().map(ConnectionHandle::id) == Some(connection.id()) {
                current.take();
            }
        }

        let grace = self.inner.transport.options().shutdown_grace;
        if timeout(grace, connection.close(SHUTDOWN_REASON))
            .await
            .is_err()
        {
            debug!(connection = %connection.id(), "Close handshake timed out");
        }
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        let mut request = self.inner.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let connect_timeout = self.inner.connect_timeout;
        let (stream, response) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| Error::connection_timeout(connect_timeout.as_millis() as u64))??;

        debug!(status = %response.status(), "WebSocket handshake completed");

        let (local_addr, remote_addr) = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => (tcp.local_addr().ok(), tcp.peer_addr().ok()),
            _ => (None, None),
        };

        Ok(ConnectionHandle::new(stream, local_addr, remote_addr))
    }

    /// Closes the connection and stops the receive loop.
    ///
    /// Idempotent. Outstanding requests fail and the session is discarded.
    pub async fn stop(&self) {
        if !self.inner.transport.begin_stop() {
            return;
        }

        self.teardown().await;

        let task = self.inner.receive_task.lock().take();
        if let Some(mut task) = task
            && timeout(self.inner.transport.options().shutdown_grace, &mut task)
                .await
                .is_err()
        {
            warn!("Receive loop did not finish, aborting");
            task.abort();
        }

        self.inner.transport.set_state(ServiceState::Stopped);
        info!(url = %self.inner.url, "Client stopped");
    }

    /// Runs when the receive loop ends on its own.
    async fn on_disconnected(&self) {
        if !self.inner.transport.begin_stop() {
            return;
        }

        info!(url = %self.inner.url, "Connection lost");
        self.teardown().await;
        self.inner.transport.set_state(ServiceState::Stopped);
    }

    async fn teardown(&self) {
        let transport = &self.inner.transport;
        let connection = self.inner.connection.write().take();

        if let Some(connection) = connection {
            let grace = transport.options().shutdown_grace;
            if timeout(grace, connection.close(SHUTDOWN_REASON))
                .await
                .is_err()
            {
                debug!(connection = %connection.id(), "Close handshake timed out");
            }
            transport
                .pending()
                .fail_connection(connection.id(), || Error::ConnectionClosed);
        }

        transport.shutdown().trigger();
        transport.pending().dispose();
        transport.sessions().close_all();
    }
}

// ============================================================================
// Client - Send
// ============================================================================

impl<M, P> Client<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Sends a message with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] without a connection.
    pub async fn send(&self, message: impl Into<M>) -> Result<MessageId> {
        let connection = self.require_connection()?;
        self.inner
            .transport
            .send(&connection, &message.into(), None)
            .await
    }

    /// Sends a message with a caller-chosen id.
    pub async fn send_with_id(&self, message: impl Into<M>, id: MessageId) -> Result<MessageId> {
        let connection = self.require_connection()?;
        self.inner
            .transport
            .send(&connection, &message.into(), Some(id))
            .await
    }

    /// Sends an unsigned frame with an arbitrary type id.
    pub async fn send_raw(&self, type_id: TypeId, payload: Vec<u8>) -> Result<MessageId> {
        let connection = self.require_connection()?;
        self.inner
            .transport
            .send_raw(&connection, type_id, payload, None)
            .await
    }

    /// Sends a request and waits for the response with the default timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::NotStarted`] without a connection
    /// - [`Error::RequestTimeout`] if no response arrives in time
    /// - [`Error::UnexpectedMessage`] if the response is not an `R`
    pub async fn send_and_receive<R>(&self, request: impl Into<M>) -> Result<R>
    where
        R: TryFrom<M, Error = M>,
    {
        let request_timeout = self.inner.transport.options().request_timeout;
        self.send_and_receive_with_timeout(request, request_timeout)
            .await
    }

    /// Sends a request and waits at most `request_timeout` for the response.
    ///
    /// `None` waits until the connection closes.
    pub async fn send_and_receive_with_timeout<R>(
        &self,
        request: impl Into<M>,
        request_timeout: Option<Duration>,
    ) -> Result<R>
    where
        R: TryFrom<M, Error = M>,
    {
        let connection = self.require_connection()?;
        self.inner
            .transport
            .send_and_receive(&connection, request.into(), request_timeout)
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::codec::tests::{Blob, Sample};

    fn client(url: &str) -> Client<Sample> {
        Client::<Sample>::builder()
            .url(url)
            .connect_timeout(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_before_start() {
        let client = client("ws://127.0.0.1:1");

        let err = client.send(Blob::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotStarted));

        let err = client
            .send_and_receive::<Blob>(Blob::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotStarted));
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_stopped() {
        // Bind and drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = client(&format!("ws://127.0.0.1:{port}"));
        assert!(client.start().await.is_err());
        assert_eq!(client.state(), ServiceState::Stopped);
        assert!(client.connection().is_none());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let client = client("ws://127.0.0.1:1");
        client.stop().await;
        assert_eq!(client.state(), ServiceState::Stopped);
    }
}
