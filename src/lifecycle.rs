//! Pool shutdown.
//!
//! The host owns its [`ConnectionPool`] and should call
//! [`ConnectionPool::close_all`] (or [`ShutdownGuard::shutdown`]) during an
//! orderly shutdown. The hooks here are best effort for the other cases.
//!
//! # Example
//!
//! ```no_run
//! use ws_agent_pool::{ConnectionPool, PoolOptions, ShutdownGuard};
//!
//! # async fn example() -> ws_agent_pool::Result<()> {
//! let pool = ConnectionPool::new(PoolOptions::default())?;
//! let guard = ShutdownGuard::new(pool.clone());
//!
//! // ... serve requests ...
//!
//! guard.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::OnceLock;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::options::PoolOptions;
use crate::transport::ConnectionPool;

// ============================================================================
// ShutdownGuard
// ============================================================================

/// Closes a pool when the guard goes away.
///
/// [`shutdown`](Self::shutdown) closes it and waits. Dropping the guard
/// instead schedules `close_all` on the current Tokio runtime if one is
/// still reachable, and silently gives up otherwise.
#[must_use = "dropping the guard immediately closes the pool"]
pub struct ShutdownGuard {
    pool: Option<ConnectionPool>,
}

impl ShutdownGuard {
    /// Guards `pool`.
    #[inline]
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool: Some(pool) }
    }

    /// Closes the pool and waits for every idle socket to close.
    pub async fn shutdown(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close_all().await;
        }
    }

    /// Releases the pool without closing it.
    #[inline]
    pub fn disarm(mut self) -> Option<ConnectionPool> {
        self.pool.take()
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                debug!("Scheduling pool close from guard drop");
                handle.spawn(async move { pool.close_all().await });
            }
            Err(_) => debug!("No runtime at guard drop; skipping pool close"),
        }
    }
}

// ============================================================================
// Signal Hook
// ============================================================================

/// Spawns a task that closes `pool` on Ctrl-C.
///
/// Must be called from within a Tokio runtime.
pub fn close_on_ctrl_c(pool: ConnectionPool) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, closing agent connections");
                pool.close_all().await;
            }
            Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
        }
    })
}

// ============================================================================
// Shared Pool
// ============================================================================

/// Process-wide pool, created on first use.
static SHARED: OnceLock<ConnectionPool> = OnceLock::new();

/// Returns the process-wide pool, creating it with default options.
///
/// Prefer an owned pool passed by reference; this exists for hosts that
/// cannot thread one through.
pub fn shared() -> &'static ConnectionPool {
    SHARED.get_or_init(|| ConnectionPool::from_valid(PoolOptions::default()))
}

// ============================================================================
// Tests
// ============================================================================
