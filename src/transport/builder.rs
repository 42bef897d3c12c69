//! Builders for [`Client`] and [`Server`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use woof_websocket::{JsonPayload, Message, Server, ServerBuilder, TypeId, message_set};
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
//! # fn example() -> woof_websocket::Result<()> {
//! let server: Server<Api, JsonPayload> = ServerBuilder::with_payload(JsonPayload)
//!     .bind("0.0.0.0:9000")
//!     .build()?;
//! # let _ = server;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::auth::AuthenticationProvider;
use crate::error::{Error, Result};
use crate::protocol::{BincodePayload, MessageSet, PayloadCodec, WoofCodec};

use super::client::Client;
use super::core::{Handler, NoopHandler, Transport};
use super::options::TransportOptions;
use super::server::Server;

// ============================================================================
// Constants
// ============================================================================

/// Default handshake timeout for clients.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default server bind address (loopback, random port).
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:0";

// ============================================================================
// Shared Parts
// ============================================================================

struct Common<M, P> {
    handler: Option<Arc<dyn Handler<M, P>>>,
    auth: Option<Arc<dyn AuthenticationProvider>>,
    payload: P,
    options: TransportOptions,
}

impl<M, P> Common<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    fn new(payload: P) -> Self {
        Self {
            handler: None,
            auth: None,
            payload,
            options: TransportOptions::default(),
        }
    }

    fn into_transport(self) -> Result<Transport<M, P>> {
        let codec = WoofCodec::new(self.payload, self.auth)?;
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(NoopHandler) as Arc<dyn Handler<M, P>>);
        Ok(Transport::new(codec, handler, self.options))
    }
}

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for a [`Client`].
///
/// Use [`Client::builder()`] for the bincode payload codec, or
/// [`ClientBuilder::with_payload`] for another one.
pub struct ClientBuilder<M, P = BincodePayload> {
    url: Option<String>,
    connect_timeout: Duration,
    common: Common<M, P>,
}

impl<M, P> fmt::Debug for ClientBuilder<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .field("options", &self.common.options)
            .finish()
    }
}

impl<M: MessageSet> ClientBuilder<M, BincodePayload> {
    /// Creates a builder using the bincode payload codec.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_payload(BincodePayload)
    }
}

impl<M: MessageSet> Default for ClientBuilder<M, BincodePayload> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, P> ClientBuilder<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Creates a builder using `payload` to serialize message bodies.
    #[must_use]
    pub fn with_payload(payload: P) -> Self {
        Self {
            url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            common: Common::new(payload),
        }
    }

    /// Sets the server URL (`ws://` or `wss://`).
    #[inline]
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the event handler.
    #[inline]
    #[must_use]
    pub fn handler(mut self, handler: impl Handler<M, P>) -> Self {
        self.common.handler = Some(Arc::new(handler));
        self
    }

    /// Sets a shared event handler.
    #[inline]
    #[must_use]
    pub fn handler_arc(mut self, handler: Arc<dyn Handler<M, P>>) -> Self {
        self.common.handler = Some(handler);
        self
    }

    /// Sets the provider resolving sign-in keys.
    #[inline]
    #[must_use]
    pub fn auth(mut self, provider: impl AuthenticationProvider + 'static) -> Self {
        self.common.auth = Some(Arc::new(provider));
        self
    }

    /// Sets transport options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: TransportOptions) -> Self {
        self.common.options = options;
        self
    }

    /// Builds the client with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL is missing, malformed or not `ws`/`wss`
    /// - [`Error::DuplicateTypeId`] if two messages share a type id
    pub fn build(self) -> Result<Client<M, P>> {
        let url = self.validate_url()?;
        let connect_timeout = self.connect_timeout;
        let transport = self.common.into_transport()?;
        Ok(Client::new(transport, url, connect_timeout))
    }

    fn validate_url(&self) -> Result<Url> {
        let raw = self.url.as_deref().ok_or_else(|| {
            Error::config(
                "Server URL is required. Use .url() to set it.\n\
                 Example: Client::builder().url(\"ws://127.0.0.1:9000\")",
            )
        })?;

        let url = Url::parse(raw).map_err(|e| Error::config(format!("Invalid URL '{raw}': {e}")))?;

        match url.scheme() {
            "ws" | "wss" => Ok(url),
            scheme => Err(Error::config(format!(
                "Unsupported URL scheme '{scheme}', expected ws or wss"
            ))),
        }
    }
}

// ============================================================================
// ServerBuilder
// ============================================================================

/// Builder for a [`Server`].
///
/// Use [`Server::builder()`] for the bincode payload codec, or
/// [`ServerBuilder::with_payload`] for another one.
pub struct ServerBuilder<M, P = BincodePayload> {
    bind: String,
    common: Common<M, P>,
}

impl<M, P> fmt::Debug for ServerBuilder<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("bind", &self.bind)
            .field("options", &self.common.options)
            .finish()
    }
}

impl<M: MessageSet> ServerBuilder<M, BincodePayload> {
    /// Creates a builder using the bincode payload codec.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_payload(BincodePayload)
    }
}

impl<M: MessageSet> Default for ServerBuilder<M, BincodePayload> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, P> ServerBuilder<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Creates a builder using `payload` to serialize message bodies.
    #[must_use]
    pub fn with_payload(payload: P) -> Self {
        Self {
            bind: DEFAULT_BIND_ADDR.to_owned(),
            common: Common::new(payload),
        }
    }

    /// Sets the listen address, e.g. `0.0.0.0:9000`.
    #[inline]
    #[must_use]
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind = addr.into();
        self
    }

    /// Sets the event handler.
    #[inline]
    #[must_use]
    pub fn handler(mut self, handler: impl Handler<M, P>) -> Self {
        self.common.handler = Some(Arc::new(handler));
        self
    }

    /// Sets a shared event handler.
    #[inline]
    #[must_use]
    pub fn handler_arc(mut self, handler: Arc<dyn Handler<M, P>>) -> Self {
        self.common.handler = Some(handler);
        self
    }

    /// Sets the provider resolving sign-in keys.
    #[inline]
    #[must_use]
    pub fn auth(mut self, provider: impl AuthenticationProvider + 'static) -> Self {
        self.common.auth = Some(Arc::new(provider));
        self
    }

    /// Sets transport options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: TransportOptions) -> Self {
        self.common.options = options;
        self
    }

    /// Builds the server with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the bind address is not `ip:port`
    /// - [`Error::DuplicateTypeId`] if two messages share a type id
    pub fn build(self) -> Result<Server<M, P>> {
        let bind_addr: SocketAddr = self
            .bind
            .parse()
            .map_err(|e| Error::config(format!("Invalid bind address '{}': {e}", self.bind)))?;
        let transport = self.common.into_transport()?;
        Ok(Server::new(transport, bind_addr))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::JsonPayload;
    use crate::protocol::codec::tests::Sample;

    #[test]
    fn test_client_requires_url() {
        let err = ClientBuilder::<Sample>::new().build().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_client_rejects_http_scheme() {
        let err = ClientBuilder::<Sample>::new()
            .url("http://localhost:9000")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported URL scheme 'http'"));
    }

    #[test]
    fn test_client_rejects_garbage_url() {
        let err = ClientBuilder::<Sample>::new()
            .url("not a url")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_client_defaults() {
        let builder = ClientBuilder::<Sample>::new().url("ws://localhost:9000/woof");
        assert_eq!(builder.connect_timeout, DEFAULT_CONNECT_TIMEOUT);

        let client = builder.build().unwrap();
        assert_eq!(client.url().path(), "/woof");
        assert_eq!(
            client.transport().options(),
            &TransportOptions::default()
        );
    }

    #[test]
    fn test_server_default_bind() {
        let server = ServerBuilder::<Sample>::new().build().unwrap();
        assert_eq!(server.bind_addr().to_string(), "127.0.0.1:0");
    }

    #[test]
    fn test_server_rejects_bad_bind() {
        let err = ServerBuilder::<Sample>::new()
            .bind("localhost")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_json_payload_builder() {
        let server: Server<Sample, JsonPayload> = ServerBuilder::with_payload(JsonPayload)
            .options(TransportOptions::new().with_max_receive_size(None))
            .build()
            .unwrap();
        assert_eq!(server.transport().options().max_receive_size, None);
    }
}
