//! Retry Policy with Exponential Backoff
//!
//! Governs how a worker handles a batch whose write failed for transient
//! reasons (connection drops, timeouts, pool exhaustion).
//!
//! ```text
//! failure 1 → wait 100ms → retry
//! failure 2 → wait 200ms → retry
//! failure 3 → wait 400ms → retry
//! failure 4 → wait 800ms → retry
//! failure 5 → wait 1.6s  → retry
//! failure 6 → retry budget spent → dead-letter
//! ```
//!
//! Failure counts are kept per entry in the append log's durable retry
//! table, not in memory, so a worker restart does not reset an entry's
//! budget.
//!
//! Permanent errors (malformed entries, invalid coordinates) skip this
//! policy entirely and are dead-lettered on first sight.

use std::time::Duration;

/// Exponential backoff configuration.
///
/// ```text
/// backoff(n) = min(initial_backoff * multiplier^n, max_backoff)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure (default: 5)
    pub max_retries: u32,

    /// Wait before the first retry (default: 100ms)
    pub initial_backoff: Duration,

    /// Upper bound for any single wait (default: 30s)
    pub max_backoff: Duration,

    /// Growth factor between consecutive waits (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Default backoff with a different retry budget.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !backoff_ms.is_finite() || backoff_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(backoff_ms as u64)
    }

    /// Wait after an entry has failed `failures` times in total.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        self.backoff(failures.saturating_sub(1))
    }

    /// Whether an entry that has failed `failures` times should be given up.
    ///
    /// The first failure is not a retry, so an entry gets
    /// `max_retries + 1` attempts in total.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }
}
