//! WebSocket transport layer.
//!
//! This module handles communication between the pool (Rust) and remote
//! monitoring agents via WebSocket.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  ConnectionPool │         WebSocket            │  Agent          │
//! │                 │─────────────────────────────►│                 │
//! │  Bucket per key │  token, then JSON ⇄ JSON     │  ws://host:port │
//! │  → Connection   │◄─────────────────────────────│                 │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `ConnectionFactory::open` - Handshake and send the token
//! 2. `ConnectionPool::acquire` - Lease to one request
//! 3. `Connection::exchange` - One send, one receive, under exclusive access
//! 4. Release to the idle stack, or dispose after a transport failure
//! 5. `ConnectionPool::close_all` - Close everything on shutdown
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | One live socket, exclusive access, keepalive |
//! | `factory` | Handshake with retries and backoff |
//! | `pool` | Per-key buckets, acquire/release, request |

// ============================================================================
// Submodules
// ============================================================================

/// One live agent socket.
pub mod connection;

/// Connection creation with retries.
pub mod factory;

/// Keyed connection pool.
pub mod pool;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, WsStream};
pub use factory::ConnectionFactory;
pub use pool::{BucketStats, ConnectionPool, DEFAULT_REQUEST_RETRIES, DEFAULT_REQUEST_TIMEOUT};
