//! Transport tuning options.
//!
//! Plain serde struct, so applications can embed it in their own
//! configuration files.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use woof_websocket::TransportOptions;
//!
//! let options = TransportOptions::new()
//!     .with_max_receive_size(Some(64 * 1024))
//!     .with_request_timeout(Some(Duration::from_secs(5)));
//!
//! assert_eq!(options.max_receive_size, Some(65536));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default payload size limit (1 MiB).
pub const DEFAULT_MAX_RECEIVE_SIZE: usize = 0x0010_0000;

/// Default wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period for close handshakes during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// TransportOptions
// ============================================================================

/// Options shared by clients and servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Largest accepted payload; `None` accepts any size.
    pub max_receive_size: Option<usize>,

    /// Default wait for responses; `None` waits forever.
    pub request_timeout: Option<Duration>,

    /// How long `stop` waits for close handshakes.
    pub shutdown_grace: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl TransportOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_receive_size: Some(DEFAULT_MAX_RECEIVE_SIZE),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl TransportOptions {
    /// Sets the payload size limit.
    #[inline]
    #[must_use]
    pub fn with_max_receive_size(mut self, limit: Option<usize>) -> Self {
        self.max_receive_size = limit;
        self
    }

    /// Sets the default response timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    #[inline]
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
