//! Retry policy for external actions
//!
//! Each call site passes its own policy, so allocation and health checks can
//! differ in how long they keep trying.

use std::time::Duration;

/// Default start-to-close timeout applied to each action attempt
pub const DEFAULT_START_TO_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Exponential backoff retry policy
///
/// `maximum_attempts == None` retries until the action succeeds or reports a
/// non-retryable failure.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            maximum_attempts: Some(1),
            ..Self::default()
        }
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = Some(attempts);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Whether another attempt is allowed after `attempts_made` failures
    pub fn allows_attempt(&self, attempts_made: u32) -> bool {
        match self.maximum_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed)
    ///
    /// delay = initial_interval * coefficient^(attempt - 1), capped at maximum_interval
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_coefficient.max(1.0).powi(attempt as i32 - 1);
        let delay = self.initial_interval.as_secs_f64() * factor;
        let capped = delay.min(self.maximum_interval.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Options for one external action invocation
#[derive(Clone, Debug, PartialEq)]
pub struct ActionOptions {
    pub start_to_close_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: DEFAULT_START_TO_CLOSE_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ActionOptions {
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(20), Duration::from_secs(100));
    }

    #[test]
    fn test_attempt_budget() {
        let once = RetryPolicy::no_retry();
        assert!(once.allows_attempt(0));
        assert!(!once.allows_attempt(1));

        let unlimited = RetryPolicy::default();
        assert!(unlimited.allows_attempt(10_000));
    }
}
