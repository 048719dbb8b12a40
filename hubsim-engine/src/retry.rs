use std::time::Duration;

/// Exponential backoff applied to transient transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the wait between retries
    pub max_backoff: Duration,
    /// Consecutive failures after which the operation is abandoned
    pub max_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_failures: 5,
        }
    }
}

/// Tracks consecutive failures for a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: policy.initial_backoff,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial_backoff;
        self.failures = 0;
    }

    /// Record a failure and return the time to wait before retrying, or
    /// `None` if the failure limit was reached
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.policy.max_failures > 0 && self.failures >= self.policy.max_failures {
            return None;
        }
        let wait = self.current;
        self.current = std::cmp::min(self.current * 2, self.policy.max_backoff);
        Some(wait)
    }
}
