//! # Recovery Policy Module
//!
//! Constant-backoff policy governing connection attempts: a fixed wait
//! interval between attempts and a fixed cap on the number of retries.

use std::time::Duration;

/// Reconnection policy for the connection manager
///
/// # Examples
///
/// ```rust
/// use broker_runtime::RecoveryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 5 retries, 5s apart
/// let policy = RecoveryPolicy::default();
/// assert_eq!(policy.retry_count, 5);
///
/// let policy = RecoveryPolicy::constant_backoff(Duration::from_secs(1), 3);
/// assert_eq!(policy.calculate_delay(2), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Wait before each retry
    pub interval: Duration,

    /// Maximum number of retries after the first failed attempt
    pub retry_count: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            retry_count: 5,
        }
    }
}

impl RecoveryPolicy {
    /// Create a constant-backoff policy
    pub fn constant_backoff(interval: Duration, retry_count: u32) -> Self {
        Self {
            interval,
            retry_count,
        }
    }

    /// Policy that never retries; the first loss is terminal
    pub fn none() -> Self {
        Self {
            interval: Duration::ZERO,
            retry_count: 0,
        }
    }

    /// Delay before retry `attempt` (0-based). Constant for every attempt.
    pub fn calculate_delay(&self, _attempt: u32) -> Duration {
        self.interval
    }

    /// Check if retry `attempt` (0-based) is allowed
    ///
    /// # Examples
    ///
    /// ```rust
    /// use broker_runtime::RecoveryPolicy;
    ///
    /// let policy = RecoveryPolicy::default(); // retry_count = 5
    ///
    /// assert!(policy.should_retry(0));
    /// assert!(policy.should_retry(4));
    /// assert!(!policy.should_retry(5));
    /// ```
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.retry_count
    }

    /// Upper bound on the time spent waiting across all retries
    pub fn total_backoff(&self) -> Duration {
        self.interval.saturating_mul(self.retry_count)
    }
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
