//! Authentication providers.
//!
//! Sign-in requests are verified with a key resolved from the credential
//! they carry instead of the session key. An [`AuthenticationProvider`]
//! performs that lookup.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::protocol::SigningKey;

// ============================================================================
// AuthenticationProvider
// ============================================================================

/// Resolves the signing key belonging to a credential.
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    /// Returns the key for `credential`, or `None` if unknown.
    async fn resolve_key(&self, credential: &[u8]) -> Option<SigningKey>;
}

// ============================================================================
// StaticAuthenticationProvider
// ============================================================================

/// In-memory map from API keys to secrets.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticationProvider {
    keys: FxHashMap<Vec<u8>, SigningKey>,
}

impl StaticAuthenticationProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an API key and its secret.
    pub fn insert(&mut self, api_key: impl Into<Vec<u8>>, secret: SigningKey) {
        self.keys.insert(api_key.into(), secret);
    }

    /// Adds a base64-encoded API key and secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`](crate::Error::InvalidKey) if either
    /// value is not valid base64.
    pub fn insert_base64(&mut self, api_key: &str, secret: &str) -> Result<()> {
        let api_key = SigningKey::from_base64(api_key)?;
        let secret = SigningKey::from_base64(secret)?;
        self.keys.insert(api_key.as_bytes().to_vec(), secret);
        Ok(())
    }

    /// Builder-style [`StaticAuthenticationProvider::insert_base64`].
    pub fn with_base64(mut self, api_key: &str, secret: &str) -> Result<Self> {
        self.insert_base64(api_key, secret)?;
        Ok(self)
    }

    /// Number of known API keys.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if no API key is known.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl AuthenticationProvider for StaticAuthenticationProvider {
    async fn resolve_key(&self, credential: &[u8]) -> Option<SigningKey> {
        self.keys.get(credential).cloned()
    }
}

// ============================================================================
// Tests
// ============================================================================
