//! Retry policy with capped exponential backoff.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Retry limits for message delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-indexed; 0 means no delay).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        if !delay.is_finite() {
            return self.max_backoff_ms;
        }
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Whether a message with `attempt` failures may be retried again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Backoff as a chrono duration, for scheduling `retry_at`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::milliseconds(self.backoff_ms(attempt).min(i64::MAX as u64) as i64)
    }

    /// Check that the policy is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(format!(
                "max_backoff_ms ({}) is below initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    /// Default: 3 retries, 500ms initial backoff, 2x multiplier, 30s max.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ms(0), 0);
        assert_eq!(policy.backoff_ms(1), 500);
        assert_eq!(policy.backoff_ms(2), 1000);
        assert_eq!(policy.backoff_ms(3), 2000);
        assert_eq!(policy.backoff_ms(10), 30_000);
        assert_eq!(policy.backoff_ms(u32::MAX), 30_000);
    }

    #[test]
    fn test_should_retry_bound() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_backoff_duration() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(2), Duration::milliseconds(1000));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let inverted = RetryPolicy {
            initial_backoff_ms: 10_000,
            max_backoff_ms: 100,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
