//! Frame metadata block.
//!
//! A frame is `[1 byte meta length][metadata][payload]`. The metadata block
//! is fixed-order big-endian:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 16 | Message id |
//! | 16 | 4 | Type id |
//! | 20 | 4 | Payload length |
//! | 24 | 1 | Signature length (0 = absent) |
//! | 25 | n | Signature |

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};
use crate::identifiers::{MessageId, TypeId};

// ============================================================================
// Constants
// ============================================================================

/// Size of the metadata block without a signature.
pub const FIXED_METADATA_LEN: usize = 25;

/// Largest metadata block expressible by the 1-byte length prefix.
pub const MAX_METADATA_LEN: usize = u8::MAX as usize;

// ============================================================================
// Metadata
// ============================================================================

/// Decoded metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Correlation id.
    pub id: MessageId,
    /// Registered type id.
    pub type_id: TypeId,
    /// Number of payload bytes following the metadata.
    pub payload_length: usize,
    /// HMAC over the payload, if signed.
    pub signature: Option<Vec<u8>>,
}

impl Metadata {
    /// Encodes the block, without the length prefix.
    ///
    /// # Errors
    ///
    /// - [`Error::MetadataTooLong`] if the block exceeds 255 bytes
    /// - [`Error::InvalidMetadata`] if the payload length exceeds `u32`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let signature = self.signature.as_deref().unwrap_or_default();
        let length = FIXED_METADATA_LEN + signature.len();
        if length > MAX_METADATA_LEN {
            return Err(Error::MetadataTooLong { length });
        }

        let payload_length = u32::try_from(self.payload_length).map_err(|_| {
            Error::invalid_metadata(format!(
                "payload length {} does not fit 32 bits",
                self.payload_length
            ))
        })?;

        let mut out = Vec::with_capacity(length);
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&self.type_id.get().to_be_bytes());
        out.extend_from_slice(&payload_length.to_be_bytes());
        // length <= 255 bounds the signature below 255 bytes
        out.push(signature.len() as u8);
        out.extend_from_slice(signature);
        Ok(out)
    }

    /// Encodes the block with its 1-byte length prefix.
    pub fn encode_prefixed(&self) -> Result<Vec<u8>> {
        let block = self.encode()?;
        let mut out = Vec::with_capacity(block.len() + 1);
        out.push(block.len() as u8);
        out.extend_from_slice(&block);
        Ok(out)
    }

    /// Decodes a block read after the length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMetadata`] if the block is truncated or has
    /// trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_METADATA_LEN {
            return Err(Error::invalid_metadata(format!(
                "{} bytes, at least {FIXED_METADATA_LEN} expected",
                bytes.len()
            )));
        }

        let signature_len = bytes[24] as usize;
        if bytes.len() != FIXED_METADATA_LEN + signature_len {
            return Err(Error::invalid_metadata(format!(
                "signature length {signature_len} does not match block length {}",
                bytes.len()
            )));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[..16]);
        let type_id = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let payload_length = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);

        let signature = (signature_len > 0).then(|| bytes[FIXED_METADATA_LEN..].to_vec());

        Ok(Self {
            id: MessageId::from_bytes(id),
            type_id: TypeId::new(type_id),
            payload_length: payload_length as usize,
            signature,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(signature: Option<Vec<u8>>) -> Metadata {
        Metadata {
            id: MessageId::generate(),
            type_id: TypeId::new(0x0102_0304),
            payload_length: 513,
            signature,
        }
    }

    #[test]
    fn test_layout_is_big_endian() {
        let metadata = sample(None);
        let bytes = metadata.encode().unwrap();

        assert_eq!(bytes.len(), FIXED_METADATA_LEN);
        assert_eq!(&bytes[..16], metadata.id.as_bytes());
        assert_eq!(&bytes[16..20], &[1, 2, 3, 4]);
        assert_eq!(&bytes[20..24], &[0, 0, 2, 1]);
        assert_eq!(bytes[24], 0);
    }

    #[test]
    fn test_signed_roundtrip() {
        let metadata = sample(Some(vec![0xAB; 32]));
        let prefixed = metadata.encode_prefixed().unwrap();

        assert_eq!(prefixed[0] as usize, FIXED_METADATA_LEN + 32);
        assert_eq!(Metadata::decode(&prefixed[1..]).unwrap(), metadata);
    }

    #[test]
    fn test_empty_signature_is_absent() {
        let bytes = sample(Some(Vec::new())).encode().unwrap();
        assert_eq!(Metadata::decode(&bytes).unwrap().signature, None);
    }

    #[test]
    fn test_too_long_fails_fast() {
        let err = sample(Some(vec![0; 231])).encode().unwrap_err();
        assert!(matches!(err, Error::MetadataTooLong { length: 256 }));
        assert!(sample(Some(vec![0; 230])).encode().is_ok());
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = sample(Some(vec![1; 8])).encode().unwrap();
        assert!(Metadata::decode(&bytes[..20]).is_err());
        assert!(Metadata::decode(&bytes[..30]).is_err());
    }
}
