//! WebSocket transport layer.
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Client         │         WebSocket            │  Server         │
//! │  (one session)  │◄────────────────────────────►│  (session per   │
//! │                 │      subprotocol WOOF        │   connection)   │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! Both sides share the same [`Transport`]: codec, sessions, pending
//! requests and one receive loop per connection.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | WebSocket connection handle |
//! | `pending` | Request/response correlation |
//! | `core` | Transport, handler and receive loop |
//! | `client` | Single-connection client |
//! | `server` | Multi-connection server |
//! | `builder` | Client and server builders |
//! | `options` | Tuning options |

// ============================================================================
// Submodules
// ============================================================================

/// Client and server builders.
pub mod builder;

/// Single-connection client.
pub mod client;

/// WebSocket connection handle.
pub mod connection;

/// Transport, handler and receive loop.
pub mod core;

/// Tuning options.
pub mod options;

/// Request/response correlation.
pub mod pending;

/// Multi-connection server.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::{ClientBuilder, ServerBuilder};
pub use client::Client;
pub use connection::{
    CloseStatus, ConnectionHandle, ConnectionState, FrameKind, FrameReader, ReceiveResult,
};
pub use core::{Handler, NoopHandler, Peer, ServiceState, Transport};
pub use options::TransportOptions;
pub use pending::{PendingRequest, PendingRequestTable};
pub use server::Server;
