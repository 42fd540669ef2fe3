//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Per-key exponential backoff for failed work items.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Growth factor per consecutive failure.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay before the retry that follows the `failures`-th consecutive
    /// failure (1-indexed).
    ///
    /// `base_delay * multiplier^(failures - 1)`, capped at `max_delay`.
    ///
    /// With the default policy (5ms, x2, cap 1000s):
    /// - failure 1: 5ms
    /// - failure 2: 10ms
    /// - failure 3: 20ms
    /// - failure 19 onwards: 1000s
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1000),
        }
    }
}
