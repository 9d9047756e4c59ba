//! Error types for the agent pool.
//!
//! This module defines all error types used throughout the crate, and the
//! short string tags that [`ConnectionPool::request`] reports to callers.
//!
//! [`ConnectionPool::request`]: crate::ConnectionPool::request
//!
//! # Usage
//!
//! Internal fallible operations return [`Result<T>`] which uses [`Error`].
//! The public request path never returns an error; it renders one with
//! [`Error::to_reply`]:
//!
//! ```
//! use ws_agent_pool::Error;
//!
//! let reply = Error::AcquireTimeout { timeout_ms: 500 }.to_reply();
//! assert_eq!(reply["error"], "acquire_timeout");
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Tag |
//! |----------|----------|-----|
//! | Configuration | [`Error::Config`] | `config_error: ..` |
//! | Transport | [`Error::ConnectionClosed`], [`Error::Io`], [`Error::WebSocket`], [`Error::OpenTimeout`] | `connection_closed: ..`, `os_error: ..`, `ws_error: ..` |
//! | Exchange | [`Error::RequestTimeout`] | `timeout` |
//! | Capacity | [`Error::AcquireTimeout`], [`Error::PoolClosed`] | `acquire_timeout`, `pool_closed` |
//! | Payload | [`Error::Json`] | `invalid_payload: ..` |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::{Value, json};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Tags
// ============================================================================

/// Tag for a receive that exceeded the per-request timeout.
pub const TAG_TIMEOUT: &str = "timeout";

/// Tag for a wait on a saturated bucket that exceeded `acquire_timeout`.
pub const TAG_ACQUIRE_TIMEOUT: &str = "acquire_timeout";

/// Tag for a reply body that was not valid JSON.
pub const TAG_INVALID_JSON: &str = "invalid_json";

/// Tag for a waiter cancelled by pool shutdown.
pub const TAG_POOL_CLOSED: &str = "pool_closed";

/// Tag used when every attempt failed without a captured cause.
pub const TAG_UNKNOWN: &str = "unknown";

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
    /// Returned when pool options or an agent address are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// The peer closed the socket, or the socket was already marked dead.
    #[error("Connection closed: {detail}")]
    ConnectionClosed {
        /// What was observed when the closure was detected.
        detail: String,
    },

    /// WebSocket handshake did not finish within `open_timeout`.
    #[error("Open timeout after {timeout_ms}ms")]
    OpenTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Exchange Errors
    // ========================================================================
    /// No reply arrived within the per-request timeout.
    #[error("Request timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Capacity Errors
    // ========================================================================
    /// No connection slot became free within `acquire_timeout`.
    #[error("Acquire timed out after {timeout_ms}ms")]
    AcquireTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The pool was closed while waiting for a connection.
    #[error("Pool closed")]
    PoolClosed,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
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

    /// Creates a connection closed error.
    #[inline]
    pub fn connection_closed(detail: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            detail: detail.into(),
        }
    }

    /// Creates an open timeout error.
    #[inline]
    pub fn open_timeout(timeout_ms: u64) -> Self {
        Self::OpenTimeout { timeout_ms }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(timeout_ms: u64) -> Self {
        Self::RequestTimeout { timeout_ms }
    }

    /// Creates an acquire timeout error.
    #[inline]
    pub fn acquire_timeout(timeout_ms: u64) -> Self {
        Self::AcquireTimeout { timeout_ms }
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
            Self::OpenTimeout { .. } | Self::RequestTimeout { .. } | Self::AcquireTimeout { .. }
        )
    }

    /// Returns `true` if this error means the socket is unusable.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed { .. }
                | Self::OpenTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::Io(_)
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the failure is about pool capacity, not transport.
    ///
    /// Capacity errors are reported to the caller without retry.
    #[inline]
    #[must_use]
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, Self::AcquireTimeout { .. } | Self::PoolClosed)
    }

    /// Returns `true` if another attempt may succeed.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
    }
}

// ============================================================================
// Reply Rendering
// ============================================================================

impl Error {
    /// Returns the short tag reported in the `error` field of a reply.
    #[must_use]
    pub fn tag(&self) -> String {
        match self {
            Self::Config { message } => format!("config_error: {message}"),
            Self::ConnectionClosed { detail } => format!("connection_closed: {detail}"),
            Self::OpenTimeout { timeout_ms } => {
                format!("ws_error: open timeout after {timeout_ms}ms")
            }
            Self::RequestTimeout { .. } => TAG_TIMEOUT.to_string(),
            Self::AcquireTimeout { .. } => TAG_ACQUIRE_TIMEOUT.to_string(),
            Self::PoolClosed => TAG_POOL_CLOSED.to_string(),
            Self::Io(e) => format!("os_error: {e}"),
            Self::Json(e) => format!("invalid_payload: {e}"),
            Self::WebSocket(e) => ws_tag(e),
        }
    }

    /// Renders this error as a JSON reply object: `{"error": <tag>}`.
    #[must_use]
    pub fn to_reply(&self) -> Value {
        json!({ "error": self.tag() })
    }
}

/// Classifies a tungstenite error into one of the transport tags.
fn ws_tag(e: &WsError) -> String {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => format!("connection_closed: {e}"),
        WsError::Io(io) => format!("os_error: {io}"),
        other => format!("ws_error: {other}"),
    }
}

// ============================================================================
// Tests
// ============================================================================
