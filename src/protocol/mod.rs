//! WOOF wire protocol.
//!
//! Every WOOF message is one binary WebSocket message:
//!
//! ```text
//! ┌──────────┬──────────────────────────────┬───────────────────┐
//! │ 1 byte   │ metadata (≤ 255 bytes)       │ payload           │
//! │ length   │ id · type · length · sig     │ payload_length B  │
//! └──────────┴──────────────────────────────┴───────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | [`Message`] and [`MessageSet`] traits, `message_set!` |
//! | `registry` | Type id to message type lookup |
//! | `payload` | Payload serializers (bincode, JSON) |
//! | `metadata` | Metadata block layout |
//! | `signing` | HMAC-SHA256 signing keys |
//! | `outcome` | Decode results |
//! | `codec` | Frame encoder and decoder |

// ============================================================================
// Submodules
// ============================================================================

/// Frame encoder and decoder.
pub mod codec;

/// Message traits and the `message_set!` macro.
pub mod message;

/// Metadata block layout.
pub mod metadata;

/// Decode results.
pub mod outcome;

/// Payload serializers.
pub mod payload;

/// Type id registry.
pub mod registry;

/// Signing keys and HMAC helpers.
pub mod signing;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{EncodedFrame, SUBPROTOCOL, WoofCodec};
pub use message::{Message, MessageSet};
pub use metadata::{FIXED_METADATA_LEN, MAX_METADATA_LEN, Metadata};
pub use outcome::{DecodeOutcome, Incoming};
pub use payload::{BincodePayload, JsonPayload, PayloadCodec};
pub use registry::{MessageTypeDescriptor, MessageTypes};
pub use signing::{KEY_LEN, SIGNATURE_LEN, SigningKey, api_key_hash};
