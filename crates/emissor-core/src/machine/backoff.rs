//! Retry budget and backoff schedule.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Per-step floors of the backoff schedule. Attempts beyond the table reuse
/// the last entry.
const SCHEDULE: [Duration; 6] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(6 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

/// Bounds retries per request: a fixed attempt budget plus a wall-clock cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of scheduled retries.
    pub max_retries: u32,
    /// Total age beyond which a request is abandoned.
    pub max_age: chrono::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_age: chrono::Duration::hours(48),
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom attempt budget and the default 48h age cap.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before the attempt numbered `retry_count` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let index = (retry_count.max(1) as usize - 1).min(SCHEDULE.len() - 1);
        SCHEDULE[index]
    }

    /// Whether another retry fits the budget, given the attempts already
    /// consumed and the request's creation time.
    #[must_use]
    pub fn allows_retry(&self, retry_count: u32, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        retry_count < self.max_retries && now - created_at <= self.max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_floors() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(300));
        assert_eq!(policy.delay_for(3), Duration::from_secs(900));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(5), Duration::from_secs(21600));
        assert_eq!(policy.delay_for(6), Duration::from_secs(86400));
        // Beyond the table the last entry applies.
        assert_eq!(policy.delay_for(9), Duration::from_secs(86400));
    }

    #[test]
    fn budget_counts_attempts() {
        let policy = RetryPolicy::default();
        let created = Utc::now();
        assert!(policy.allows_retry(0, created, created));
        assert!(policy.allows_retry(4, created, created));
        assert!(!policy.allows_retry(5, created, created));
    }

    #[test]
    fn budget_caps_wall_clock_age() {
        let policy = RetryPolicy::default();
        let created = Utc::now();
        let later = created + chrono::Duration::hours(49);
        assert!(!policy.allows_retry(0, created, later));
    }
}
