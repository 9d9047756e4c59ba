//! Pool configuration.
//!
//! [`PoolOptions`] is read once when a [`ConnectionPool`] is constructed;
//! changing it afterwards does not affect live connections.
//!
//! [`ConnectionPool`]: crate::ConnectionPool
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use ws_agent_pool::PoolOptions;
//!
//! let options = PoolOptions::new()
//!     .with_max_per_key(4)
//!     .with_acquire_timeout(Duration::from_secs(3))
//!     .with_connect_retries(5);
//!
//! assert!(options.validate().is_ok());
//! ```
//!
//! The same options deserialize from the flat names hosts use in their
//! config files, with durations in fractional seconds:
//!
//! ```
//! use ws_agent_pool::PoolOptions;
//!
//! let options: PoolOptions = serde_json::from_str(
//!     r#"{ "max_per_key": 1, "acquire_timeout": 0.5, "backoff_jitter": 0 }"#,
//! ).unwrap();
//! assert_eq!(options.max_per_key, 1);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default inbound message cap (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 << 20;

// ============================================================================
// PoolOptions
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum connections per `(host, port, token)`.
    pub max_per_key: usize,

    /// WebSocket handshake deadline.
    #[serde(with = "secs")]
    pub open_timeout: Duration,

    /// Graceful close deadline.
    #[serde(with = "secs")]
    pub close_timeout: Duration,

    /// Keepalive ping period on idle sockets; `None` disables keepalive.
    #[serde(with = "opt_secs")]
    pub ping_interval: Option<Duration>,

    /// Maximum wait for a pong before the socket is declared dead.
    ///
    /// Ignored while `ping_interval` is `None`.
    #[serde(with = "opt_secs")]
    pub ping_timeout: Option<Duration>,

    /// Inbound message size cap; `None` for unlimited.
    pub max_message_size: Option<usize>,

    /// Maximum wait for a slot on a saturated bucket.
    #[serde(with = "secs")]
    pub acquire_timeout: Duration,

    /// Handshake retries above the first attempt.
    pub connect_retries: u32,

    /// Backoff between handshake attempts.
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl PoolOptions {
    /// Creates options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_per_key: 2,
            open_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            ping_interval: Some(Duration::from_secs(20)),
            ping_timeout: Some(Duration::from_secs(20)),
            max_message_size: Some(DEFAULT_MAX_MESSAGE_SIZE),
            acquire_timeout: Duration::from_secs(10),
            connect_retries: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl PoolOptions {
    /// Sets the per-key connection cap.
    #[inline]
    #[must_use]
    pub fn with_max_per_key(mut self, max_per_key: usize) -> Self {
        self.max_per_key = max_per_key;
        self
    }

    /// Sets the handshake deadline.
    #[inline]
    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Sets the graceful close deadline.
    #[inline]
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets keepalive ping period and pong deadline.
    #[inline]
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = Some(interval);
        self.ping_timeout = Some(timeout);
        self
    }

    /// Disables keepalive pings.
    #[inline]
    #[must_use]
    pub fn without_keepalive(mut self) -> Self {
        self.ping_interval = None;
        self.ping_timeout = None;
        self
    }

    /// Sets the inbound message size cap.
    #[inline]
    #[must_use]
    pub fn with_max_message_size(mut self, size: Option<usize>) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the wait limit on a saturated bucket.
    #[inline]
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the number of handshake retries above the first attempt.
    #[inline]
    #[must_use]
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Sets the handshake backoff curve.
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl PoolOptions {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_per_key == 0 {
            return Err(Error::config("max_per_key must be at least 1"));
        }

        for (name, value) in [
            ("open_timeout", self.open_timeout),
            ("close_timeout", self.close_timeout),
            ("acquire_timeout", self.acquire_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }

        match (self.ping_interval, self.ping_timeout) {
            (Some(interval), _) if interval.is_zero() => {
                return Err(Error::config("ping_interval must be greater than zero"));
            }
            (Some(_), Some(timeout)) if timeout.is_zero() => {
                return Err(Error::config("ping_timeout must be greater than zero"));
            }
            _ => {}
        }

        if self.max_message_size == Some(0) {
            return Err(Error::config("max_message_size must be greater than zero"));
        }

        if !self.backoff.is_well_formed() || self.backoff.cap < self.backoff.base {
            return Err(Error::config(format!(
                "Invalid backoff parameters: {:?}",
                self.backoff
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Serde Helpers
// ============================================================================

/// `Duration` as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(raw).map_err(de::Error::custom)
    }
}

/// `Option<Duration>` as fractional seconds or `null`.
mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|raw| Duration::try_from_secs_f64(raw).map_err(de::Error::custom))
            .transpose()
    }
}

// ============================================================================
// Tests
// ============================================================================
