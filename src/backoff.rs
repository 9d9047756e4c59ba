//! Exponential backoff with jitter.
//!
//! `delay = min(base * factor^attempt, cap)`, then scaled by a uniform
//! sample in `[1 - jitter, 1 + jitter]` and floored at zero.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use ws_agent_pool::BackoffPolicy;
//!
//! let policy = BackoffPolicy::new(0.1, 2.0, 1.0, 0.0);
//! assert_eq!(policy.delay(0), Duration::from_millis(100));
//! assert_eq!(policy.delay(2), Duration::from_millis(400));
//! assert_eq!(policy.delay(10), Duration::from_secs(1));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Delay returned when the policy parameters are unusable.
pub const FALLBACK_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// BackoffPolicy
// ============================================================================

/// Parameters of the reconnect backoff curve. All values in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(rename = "backoff_base")]
    pub base: f64,

    /// Growth factor per attempt.
    #[serde(rename = "backoff_factor")]
    pub factor: f64,

    /// Upper bound on the un-jittered delay.
    #[serde(rename = "backoff_cap")]
    pub cap: f64,

    /// Jitter fraction in `[0, 1]`.
    #[serde(rename = "backoff_jitter")]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: 0.5,
            factor: 2.0,
            cap: 5.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy from raw parameters.
    #[inline]
    #[must_use]
    pub const fn new(base: f64, factor: f64, cap: f64, jitter: f64) -> Self {
        Self {
            base,
            factor,
            cap,
            jitter,
        }
    }

    /// Returns the same curve without jitter.
    #[inline]
    #[must_use]
    pub const fn without_jitter(self) -> Self {
        Self {
            jitter: 0.0,
            ..self
        }
    }

    /// Returns `true` if every parameter is finite and in range.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.base.is_finite()
            && self.factor.is_finite()
            && self.cap.is_finite()
            && self.jitter.is_finite()
            && self.base > 0.0
            && self.factor > 0.0
            && self.cap >= 0.0
            && (0.0..=1.0).contains(&self.jitter)
    }

    /// Delay before retry number `attempt` (0-based), using the thread RNG.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay before retry number `attempt` using the given random source.
    ///
    /// Never panics; malformed parameters yield [`FALLBACK_DELAY`].
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        if !self.is_well_formed() {
            return FALLBACK_DELAY;
        }

        let raw = self.base * self.factor.powf(f64::from(attempt));
        let mut secs = if raw.is_nan() { self.cap } else { raw.clamp(0.0, self.cap) };

        if self.jitter > 0.0 {
            secs *= rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        }

        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(FALLBACK_DELAY)
    }
}

// ============================================================================
// Tests
// ============================================================================
