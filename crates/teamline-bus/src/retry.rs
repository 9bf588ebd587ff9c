//! # Retry Policy
//!
//! Exponential backoff shared by the connect and publish paths: up to
//! `max_attempts` tries, with a delay of `base_delay * 2^i` before retry
//! *i* (so with the defaults: 2s, 4s, 8s, 16s). Waits run on the tokio
//! timer, off the caller's main path.

use std::time::Duration;

/// Default number of attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff base; retry *i* waits `base * 2^i`.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Ceiling on a single backoff wait.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential-backoff schedule for transient broker faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff base.
    pub base_delay: Duration,
    /// Clamp applied to each computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy with a custom attempt count and the default delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Fast schedule for tests: millisecond-scale delays.
    #[must_use]
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
        }
    }

    /// Delay to wait before retry attempt `attempt` (1-based: the delay
    /// after the `attempt`-th failure).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// The full wait schedule: one delay per failed attempt that has a
    /// retry following it.
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts)
            .map(|attempt| self.delay_for(attempt))
            .collect()
    }

    /// Whether a failed `attempt` (1-based) has a retry following it.
    #[must_use]
    pub fn has_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
