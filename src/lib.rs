//! Persistent WebSocket client pool for remote monitoring agents.
//!
//! Each monitored host runs an agent listening on `ws://host:port`. The
//! agent authenticates a socket by the token sent as its first text frame,
//! then answers each JSON request with one JSON reply.
//!
//! # Architecture
//!
//! Opening a socket per request is slow and breaks behind NAT and idle
//! firewalls, so the pool keeps sockets open:
//!
//! - Connections are pooled per `(host, port, token)` with a per-key cap
//! - One request in flight per socket (the protocol has no request ids)
//! - Idle sockets are reused newest-first and kept alive with pings
//! - Handshakes are retried with exponential backoff and jitter
//! - Callers blocked on a full bucket are served first come, first served
//!
//! # Quick Start
//!
//! ```no_run
//! use serde_json::json;
//! use ws_agent_pool::{ConnectionPool, PoolKey, PoolOptions, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = ConnectionPool::new(PoolOptions::default().with_max_per_key(4))?;
//!     let key = PoolKey::new("203.0.113.7", 8080, "agent-token");
//!
//!     // Never fails: errors come back as {"error": "<tag>"}
//!     let stats = pool.request(&key, &json!({ "action": "get_stats" })).await;
//!     println!("{stats}");
//!
//!     pool.close_all().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`backoff`] | [`BackoffPolicy`] for handshake retries |
//! | [`error`] | Error types, [`Result`] alias, reply tags |
//! | [`identifiers`] | [`PoolKey`] and [`ConnectionId`] |
//! | [`lifecycle`] | Shutdown guard and hooks |
//! | [`options`] | [`PoolOptions`] |
//! | [`protocol`] | Agent wire format helpers |
//! | [`transport`] | Connections, factory, and pool |

// ============================================================================
// Modules
// ============================================================================

/// Exponential backoff with jitter.
pub mod backoff;

/// Error types and result aliases.
///
/// Internal fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Shutdown guard, signal hook, and process-wide pool.
pub mod lifecycle;

/// Pool configuration.
pub mod options;

/// Agent wire protocol helpers.
pub mod protocol;

/// WebSocket transport layer.
///
/// Connection handling, handshake retries, and the keyed pool.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

pub use backoff::BackoffPolicy;
pub use error::{Error, Result};
pub use identifiers::{ConnectionId, PoolKey};
pub use lifecycle::{ShutdownGuard, close_on_ctrl_c};
pub use options::PoolOptions;
pub use protocol::reply_error;
pub use transport::{BucketStats, Connection, ConnectionFactory, ConnectionPool};
