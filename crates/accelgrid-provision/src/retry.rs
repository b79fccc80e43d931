//! Bounded retry with exponential backoff for gateway calls.

use std::time::Duration;

use tracing::{debug, warn};

use accel_core::config::ProvisioningConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProvisioningConfig::default())
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Try again after this delay.
    RetryAfter(Duration),
    /// The retry cap is reached.
    Exhausted,
}

/// Tracks consecutive failures of one operation.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    failures: u32,
    current_backoff: Duration,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            current_backoff: policy.initial_backoff,
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self) -> RetryVerdict {
        self.failures += 1;
        if self.failures > self.policy.max_retries {
            warn!(
                failures = self.failures,
                max_retries = self.policy.max_retries,
                "retry cap reached"
            );
            return RetryVerdict::Exhausted;
        }
        let delay = self.current_backoff;
        // Exponential backoff: double the delay up to max.
        self.current_backoff = (self.current_backoff * 2).min(self.policy.max_backoff);
        debug!(failures = self.failures, ?delay, "scheduling retry");
        RetryVerdict::RetryAfter(delay)
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.current_backoff = self.policy.initial_backoff;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Attempts made so far, including the one in progress.
    pub fn attempt(&self) -> u32 {
        self.failures + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }

    #[test]
    fn default_policy_comes_from_config() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.initial_backoff, Duration::from_secs(2));
        assert_eq!(p.max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn backoff_doubles() {
        let mut t = RetryTracker::new(policy(5));
        assert_eq!(t.record_failure(), RetryVerdict::RetryAfter(Duration::from_secs(2)));
        assert_eq!(t.record_failure(), RetryVerdict::RetryAfter(Duration::from_secs(4)));
        assert_eq!(t.record_failure(), RetryVerdict::RetryAfter(Duration::from_secs(8)));
        assert_eq!(t.attempt(), 4);
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut t = RetryTracker::new(policy(20));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            if let RetryVerdict::RetryAfter(d) = t.record_failure() {
                last = d;
            }
        }
        // 2 → 4 → 8 → 16 → 32 → 60 → 60 ...
        assert_eq!(last, Duration::from_secs(60));
    }

    #[test]
    fn exhausted_after_cap() {
        let mut t = RetryTracker::new(policy(2));
        assert!(matches!(t.record_failure(), RetryVerdict::RetryAfter(_)));
        assert!(matches!(t.record_failure(), RetryVerdict::RetryAfter(_)));
        assert_eq!(t.record_failure(), RetryVerdict::Exhausted);
        assert_eq!(t.failures(), 3);
    }

    #[test]
    fn success_resets() {
        let mut t = RetryTracker::new(policy(2));
        t.record_failure();
        t.record_failure();
        t.record_success();
        assert_eq!(t.failures(), 0);
        assert_eq!(t.record_failure(), RetryVerdict::RetryAfter(Duration::from_secs(2)));
    }
}
