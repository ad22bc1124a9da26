//! Exponential backoff for transient worker failures.

use std::time::Duration;

/// Default backoff table, indexed by retry attempt (1-based).
const DEFAULT_BACKOFF_SECS: [u64; 4] = [5, 15, 30, 60];

/// Maps a retry attempt to its wait time.
///
/// Attempt `n` waits `schedule[n - 1]`; attempts past the end of the
/// schedule are exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
}

impl RetryPolicy {
    /// Build a policy from an explicit schedule.
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    /// Number of retries allowed before the budget is exhausted.
    pub fn max_retries(&self) -> u32 {
        self.schedule.len() as u32
    }

    /// Wait time for the given attempt, or `None` once the budget is spent.
    pub fn wait_time(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return None;
        }
        self.schedule.get(attempt as usize - 1).copied()
    }

    /// Whether the given attempt is still inside the retry budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.wait_time(attempt).is_some()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 4);
        assert_eq!(policy.wait_time(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.wait_time(2), Some(Duration::from_secs(15)));
        assert_eq!(policy.wait_time(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.wait_time(4), Some(Duration::from_secs(60)));
    }

    #[test]
    fn exhausted_after_max() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert_eq!(policy.wait_time(5), None);
    }

    #[test]
    fn attempt_zero_has_no_wait() {
        assert_eq!(RetryPolicy::default().wait_time(0), None);
    }

    #[test]
    fn custom_schedule() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(1), Duration::from_millis(2)]);
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.wait_time(2), Some(Duration::from_millis(2)));
        assert!(!policy.should_retry(3));
    }
}
