//! WOOF - Binary request/response subprotocol over WebSocket.
//!
//! This library provides framing, HMAC signing and request/response
//! correlation for typed messages exchanged over WebSocket connections.
//!
//! # Architecture
//!
//! Both ends share the same machinery:
//!
//! - **Codec**: one binary WebSocket message per WOOF message, carrying a
//!   message id, a type id, the payload length and an optional signature
//! - **Sessions**: per-connection state holding the signing key
//! - **Correlation**: responses echo the request id and wake the waiting caller
//!
//! Key design principles:
//!
//! - Messages are plain serde types bound to a numeric [`TypeId`]
//! - A [`message_set!`] enum lists every message an application speaks
//! - Signed messages are verified against the session key, never a
//!   peer-supplied identity
//! - Handlers run on their own tasks, the receive loop never blocks on them
//!
//! # Quick Start
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use woof_websocket::{Client, Message, Result, TypeId, message_set};
//!
//! #[derive(Debug, Default, Clone, Serialize, Deserialize)]
//! struct Ping;
//!
//! impl Message for Ping {
//!     const TYPE_ID: TypeId = TypeId::new(7);
//! }
//!
//! #[derive(Debug, Default, Clone, Serialize, Deserialize)]
//! struct Pong;
//!
//! impl Message for Pong {
//!     const TYPE_ID: TypeId = TypeId::new(8);
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
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::<Api>::builder()
//!         .url("ws://127.0.0.1:9000")
//!         .build()?;
//!
//!     client.start().await?;
//!     let _pong: Pong = client.send_and_receive(Ping).await?;
//!     client.stop().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`auth`] | Sign-in key resolution |
//! | [`buffer`] | Growable receive buffer |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Message, type and connection ids |
//! | [`protocol`] | Wire format, codec and signing |
//! | [`session`] | Per-connection session state |
//! | [`transport`] | Client, server and receive loop |

// ============================================================================
// Modules
// ============================================================================

/// Sign-in key resolution.
pub mod auth;

/// Growable receive buffer.
pub mod buffer;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Message, type and connection identifiers.
pub mod identifiers;

/// Wire format, codec and signing.
pub mod protocol;

/// Per-connection session state.
pub mod session;

/// Client, server and receive loop.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Auth types
pub use auth::{AuthenticationProvider, StaticAuthenticationProvider};

// Buffer
pub use buffer::GrowableBuffer;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, MessageId, TypeId};

// Protocol types
pub use protocol::{
    BincodePayload, DecodeOutcome, Incoming, JsonPayload, Message, MessageSet, PayloadCodec,
    SUBPROTOCOL, SigningKey, WoofCodec,
};

// Session types
pub use session::{Session, SessionRegistry};

// Transport types
pub use transport::{
    Client, ClientBuilder, ConnectionHandle, Handler, NoopHandler, Peer, Server, ServerBuilder,
    ServiceState, Transport, TransportOptions,
};
