//! Error types for the WOOF transport.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use woof_websocket::{Error, Result};
//!
//! async fn ping(client: &Client<Api>) -> Result<()> {
//!     let _: PingResponse = client.send_and_receive(PingRequest).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Lifecycle | [`Error::InvalidState`], [`Error::NotStarted`], [`Error::Cancelled`] |
//! | Framing | [`Error::HeaderIncomplete`], [`Error::UnexpectedFrameKind`], [`Error::InvalidMetadata`], [`Error::MetadataTooLong`], [`Error::UnknownType`], [`Error::LengthExceeded`], [`Error::MessageIncomplete`], [`Error::BufferOverflow`] |
//! | Registry | [`Error::UnregisteredType`], [`Error::DuplicateTypeId`] |
//! | Signing | [`Error::InvalidKey`] |
//! | Correlation | [`Error::RequestTimeout`], [`Error::UnexpectedMessage`], [`Error::RequestsFlushed`] |
//! | External | [`Error::Io`], [`Error::WebSocket`], [`Error::Bincode`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{MessageId, TypeId};
use crate::protocol::MessageSet;
use crate::transport::{FrameKind, ServiceState};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// UnexpectedPayload
// ============================================================================

/// Type-erased message carried by [`Error::UnexpectedMessage`].
///
/// Use [`Error::into_unexpected`] to get the concrete message back.
pub struct UnexpectedPayload(Box<dyn Any + Send + Sync>);

impl fmt::Debug for UnexpectedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnexpectedPayload(..)")
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned by the builders when required settings are missing or invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection attempt timed out.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// WebSocket connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Operation not allowed in the current service state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// State the service was in.
        state: ServiceState,
    },

    /// Client is not connected.
    #[error("Not started")]
    NotStarted,

    /// Request abandoned before a response or a failure was delivered.
    #[error("Operation cancelled")]
    Cancelled,

    // ========================================================================
    // Framing Errors
    // ========================================================================
    /// Frame ended before the metadata could be read.
    #[error("Header incomplete")]
    HeaderIncomplete,

    /// A non-binary WebSocket message was received.
    #[error("Invalid message type, binary expected, got {kind}")]
    UnexpectedFrameKind {
        /// Kind of the received frame.
        kind: FrameKind,
    },

    /// Metadata block could not be parsed.
    #[error("Invalid metadata: {message}")]
    InvalidMetadata {
        /// Description of the defect.
        message: String,
    },

    /// Encoded metadata does not fit the 1-byte length prefix.
    #[error("Metadata length {length} exceeds 255 bytes")]
    MetadataTooLong {
        /// Encoded metadata length.
        length: usize,
    },

    /// Metadata names a type id that is not registered.
    ///
    /// The payload has been drained; `raw` holds it for diagnostics.
    #[error("Unknown message type {type_id}")]
    UnknownType {
        /// The unknown type id.
        type_id: TypeId,
        /// Drained payload bytes.
        raw: Vec<u8>,
    },

    /// Declared payload length exceeds the receive limit.
    #[error("Message length {length} exceeds limit {limit}")]
    LengthExceeded {
        /// Declared payload length.
        length: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Payload ended before the declared length was read.
    #[error("Message data incomplete: {received} of {expected} bytes")]
    MessageIncomplete {
        /// Declared payload length.
        expected: usize,
        /// Bytes actually read.
        received: usize,
    },

    /// Growable buffer cannot grow any further.
    #[error("Buffer overflow at capacity {capacity}")]
    BufferOverflow {
        /// Capacity when the grow was attempted.
        capacity: usize,
        /// Configured hard limit, if any.
        limit: Option<usize>,
    },

    // ========================================================================
    // Registry Errors
    // ========================================================================
    /// A message variant has no registered descriptor.
    #[error("Message type {type_id} is not registered")]
    UnregisteredType {
        /// The missing type id.
        type_id: TypeId,
    },

    /// Two message types share a type id.
    #[error("Type id {type_id} registered twice ({first} and {second})")]
    DuplicateTypeId {
        /// The duplicated type id.
        type_id: TypeId,
        /// Name of the type registered first.
        first: &'static str,
        /// Name of the type registered second.
        second: &'static str,
    },

    // ========================================================================
    // Signing Errors
    // ========================================================================
    /// Signing key could not be parsed or used.
    #[error("Invalid key: {message}")]
    InvalidKey {
        /// Description of the defect.
        message: String,
    },

    // ========================================================================
    // Correlation Errors
    // ========================================================================
    /// No response arrived within the timeout.
    #[error("Request {message_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request id that timed out.
        message_id: MessageId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// A response arrived, but of a different type than expected.
    #[error("Unexpected message: {type_name} received")]
    UnexpectedMessage {
        /// Type name of the received message.
        type_name: &'static str,
        /// The received message.
        message: UnexpectedPayload,
    },

    /// Pending request released by an unmatched error message.
    #[error("Pending requests released by an unmatched error message")]
    RequestsFlushed,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Bincode serialization error.
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(operation: &'static str, state: ServiceState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Creates an invalid metadata error.
    #[inline]
    pub fn invalid_metadata(message: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            message: message.into(),
        }
    }

    /// Creates an invalid key error.
    #[inline]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(message_id: MessageId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            message_id,
            timeout_ms,
        }
    }

    /// Wraps a message of the wrong type into an error.
    pub fn unexpected_message<M: MessageSet>(message: M) -> Self {
        Self::UnexpectedMessage {
            type_name: message.type_name(),
            message: UnexpectedPayload(Box::new(message)),
        }
    }
}

// ============================================================================
// Error Accessors
// ============================================================================

impl Error {
    /// Recovers the message carried by [`Error::UnexpectedMessage`].
    ///
    /// Returns `None` for other variants or when `M` is not the message set
    /// the error was created with.
    pub fn into_unexpected<M: MessageSet>(self) -> Option<M> {
        match self {
            Self::UnexpectedMessage { message, .. } => {
                message.0.downcast::<M>().ok().map(|boxed| *boxed)
            }
            _ => None,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the underlying socket is gone.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed)
        )
    }

    /// Returns `true` if this error describes a malformed frame.
    ///
    /// Framing errors are reported and the connection keeps running.
    #[inline]
    #[must_use]
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            Self::HeaderIncomplete
                | Self::UnexpectedFrameKind { .. }
                | Self::InvalidMetadata { .. }
                | Self::UnknownType { .. }
                | Self::LengthExceeded { .. }
                | Self::MessageIncomplete { .. }
                | Self::BufferOverflow { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. } | Self::RequestsFlushed
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
