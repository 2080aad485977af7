//! Backoff policy for queue entries that failed with a transient error.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
///
/// Retries are not run in a loop here: the queue persists the next
/// attempt time and a later drain picks the entry up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_backoff: Duration,
    /// Failed attempts after which an entry becomes terminal-failed.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Create a new policy with default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            max_attempts,
        }
    }

    /// Set the base delay.
    pub fn with_base(mut self, delay: Duration) -> Self {
        self.base = delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Set the retry budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before the next try, given how many attempts already failed
    /// before the current one: `min(max_backoff, base * 2^attempt)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff)
    }

    /// Whether `attempts` failures use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delay_calculation() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = BackoffPolicy::new(10)
            .with_base(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(10));

        // 1 * 2^5 = 32 seconds, but should be capped at 10
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(10));
    }

    #[test]
    fn test_exhaustion() {
        let policy = BackoffPolicy::default();
        assert!(!policy.is_exhausted(7));
        assert!(policy.is_exhausted(8));
    }

    proptest! {
        #[test]
        fn delays_are_non_decreasing_and_capped(
            base_ms in 1u64..10_000,
            max_ms in 1u64..1_000_000,
            attempt in 0u32..64,
        ) {
            let policy = BackoffPolicy::default()
                .with_base(Duration::from_millis(base_ms))
                .with_max_backoff(Duration::from_millis(max_ms));

            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= policy.max_backoff);
        }
    }
}
