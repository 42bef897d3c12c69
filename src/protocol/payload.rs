//! Payload serialization.
//!
//! The codec treats payloads as opaque bytes; a [`PayloadCodec`] turns
//! message structs into those bytes and back. Signatures are computed over
//! the codec output, so it must be deterministic for a given value.
//!
//! | Codec | Format | Empty struct |
//! |-------|--------|--------------|
//! | [`BincodePayload`] | bincode (default) | 0 bytes |
//! | [`JsonPayload`] | JSON | `{}` |

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

// ============================================================================
// PayloadCodec
// ============================================================================

/// Byte-level payload encoder/decoder.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Serializes a value into payload bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserializes payload bytes into a value.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

// ============================================================================
// BincodePayload
// ============================================================================

/// Compact binary payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodePayload;

impl PayloadCodec for BincodePayload {
    #[inline]
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    #[inline]
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ============================================================================
// JsonPayload
// ============================================================================

/// Human-readable payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayload;

impl PayloadCodec for JsonPayload {
    #[inline]
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    #[inline]
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
