//! Payload signing.
//!
//! Signed message types carry an HMAC-SHA256 of their serialized payload in
//! the metadata block. Keys are 256-bit random values, provisioned out of
//! band as standard base64.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Length of generated keys in bytes.
pub const KEY_LEN: usize = 32;

/// Length of a signature in bytes (full HMAC-SHA256 digest).
pub const SIGNATURE_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// SigningKey
// ============================================================================

/// Secret key for signing payloads.
///
/// The key material is zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey(Vec<u8>);

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey([REDACTED])")
    }
}

impl SigningKey {
    /// Generates a fresh random 256-bit key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if `bytes` is empty.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::invalid_key("key is empty"));
        }
        Ok(Self(bytes))
    }

    /// Parses a base64-encoded key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the text is not valid base64 or empty.
    pub fn from_base64(text: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|e| Error::invalid_key(format!("invalid base64: {e}")))?;
        Self::from_bytes(bytes)
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Raw key bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Computes the signature of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the key is rejected by HMAC.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Checks `signature` against `payload` in constant time.
    #[must_use]
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        match self.mac() {
            Ok(mut mac) => {
                mac.update(payload);
                mac.verify_slice(signature).is_ok()
            }
            Err(_) => false,
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.0).map_err(|e| Error::invalid_key(e.to_string()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// SHA-256 of an API key, base64-encoded.
///
/// Lets authentication providers store key hashes instead of raw keys.
#[must_use]
pub fn api_key_hash(api_key: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(api_key))
}

// ============================================================================
// Tests
// ============================================================================
