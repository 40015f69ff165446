//! Activity retry policy.

use std::time::Duration;

/// Exponential backoff retry policy for activities.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_coefficient: f64,
    /// Upper bound on the delay between attempts.
    pub max_interval: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Policy for compensations: exactly one attempt, never retried.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait before the given retry (attempt numbers start at 1;
    /// the delay returned is the one *after* that attempt failed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let millis = self.initial_interval.as_millis() as f64
            * self.backoff_coefficient.powi(exponent as i32);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// True when another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
