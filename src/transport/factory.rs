//! Opens authenticated connections to agents.
//!
//! # Handshake
//!
//! 1. Build `ws://host:port` from the [`PoolKey`]
//! 2. WebSocket upgrade, bounded by `open_timeout`
//! 3. Send the token as a single text frame (no acknowledgement expected)
//!
//! Failed attempts are retried up to `connect_retries` times, sleeping
//! according to the configured [`BackoffPolicy`] between attempts.
//!
//! [`BackoffPolicy`]: crate::BackoffPolicy

// ============================================================================
// Imports
// ============================================================================

use futures_util::SinkExt;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::PoolKey;
use crate::options::PoolOptions;

use super::connection::{Connection, Keepalive};

// ============================================================================
// ConnectionFactory
// ============================================================================

/// Creates [`Connection`]s using a fixed set of [`PoolOptions`].
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    options: PoolOptions,
}

impl ConnectionFactory {
    /// Creates a factory. Options are copied and never re-read.
    #[inline]
    #[must_use]
    pub fn new(options: PoolOptions) -> Self {
        Self { options }
    }

    /// Returns the options this factory was built with.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Opens a connection, retrying failed handshakes with backoff.
    ///
    /// Makes at most `connect_retries + 1` attempts.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt:
    ///
    /// - [`Error::Config`] if the key does not form a valid URL (not retried)
    /// - [`Error::OpenTimeout`] if the handshake exceeds `open_timeout`
    /// - [`Error::WebSocket`] / [`Error::Io`] on connect or upgrade failure
    pub async fn open(&self, key: &PoolKey) -> Result<Connection> {
        let attempts = self.options.connect_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            match self.open_once(key).await {
                Ok(connection) => {
                    info!(
                        conn_id = %connection.id(),
                        host = key.host(),
                        port = key.port(),
                        attempt,
                        "Agent connection established"
                    );
                    return Ok(connection);
                }
                Err(e @ Error::Config { .. }) => return Err(e),
                Err(e) if attempt + 1 >= attempts => {
                    warn!(
                        host = key.host(),
                        port = key.port(),
                        attempts,
                        error = %e,
                        "Agent connection failed"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.options.backoff.delay(attempt);
                    debug!(
                        host = key.host(),
                        port = key.port(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Handshake failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Single handshake attempt.
    async fn open_once(&self, key: &PoolKey) -> Result<Connection> {
        let url = key.ws_url()?;
        let open_timeout = self.options.open_timeout;

        let (mut socket, _response) = timeout(
            open_timeout,
            connect_async_with_config(url.as_str(), Some(self.ws_config()), true),
        )
        .await
        .map_err(|_| Error::open_timeout(open_timeout.as_millis() as u64))??;

        let login = timeout(
            open_timeout,
            socket.send(Message::Text(key.token().to_owned().into())),
        )
        .await;

        let failure = match login {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(Error::from(e)),
            Err(_) => Some(Error::open_timeout(open_timeout.as_millis() as u64)),
        };

        if let Some(e) = failure {
            // Best effort; the attempt has already failed.
            let _ = timeout(self.options.close_timeout, socket.close(None)).await;
            return Err(e);
        }

        Ok(Connection::new(
            socket,
            key.clone(),
            self.options.close_timeout,
            self.keepalive(),
        ))
    }

    /// Socket limits derived from the options.
    fn ws_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(self.options.max_message_size)
            .max_frame_size(self.options.max_message_size)
    }

    /// Keepalive settings, if enabled.
    fn keepalive(&self) -> Option<Keepalive> {
        let interval = self.options.ping_interval?;
        Some(Keepalive {
            interval,
            timeout: self.options.ping_timeout.unwrap_or(interval),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
