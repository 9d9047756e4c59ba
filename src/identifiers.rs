//! Type-safe identifiers for pool partitions and connections.
//!
//! # Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PoolKey`] | `(host, port, token)` triple partitioning the pool |
//! | [`ConnectionId`] | Process-unique id of one socket, for logs and stats |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// PoolKey
// ============================================================================

/// Destination of a pooled connection.
///
/// Equality is exact on all three fields. Two callers using the same token
/// for the same agent share connections.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    host: String,
    port: u16,
    token: String,
}

impl PoolKey {
    /// Creates a key for the agent at `host:port` authenticated by `token`.
    #[inline]
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
        }
    }

    /// Returns the agent host.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the agent port.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the token sent as the first frame.
    #[inline]
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the agent URL, `ws://host:port`.
    ///
    /// IPv6 literals are bracketed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the host does not form a valid URL.
    pub fn ws_url(&self) -> Result<Url> {
        let raw = if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("ws://[{}]:{}", self.host, self.port)
        } else {
            format!("ws://{}:{}", self.host, self.port)
        };

        let url = Url::parse(&raw)
            .map_err(|e| Error::config(format!("Invalid agent address {raw}: {e}")))?;

        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::config(format!("Agent address has no host: {raw}")));
        }

        Ok(url)
    }
}

// The token is a credential; keep it out of logs.
impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolKey")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Global counter for connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one pooled socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
