//! Retry and backoff decisions for failed jobs.
//!
//! A job that fails with `attempts` recorded tries becomes claimable again
//! `backoff_base ^ attempts` seconds after its last failure. The failure that
//! brings `attempts` up to `max_retries` moves it to the dead-letter queue.

use chrono::{DateTime, Duration, Utc};

use crate::job::{Job, JobState};

/// Outcome of a failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Mark `failed`; eligible again once the backoff elapses.
    Retry,
    /// Mark `dead`; only an operator can revive it.
    Dead,
}

impl RetryDecision {
    pub fn state(&self) -> JobState {
        match self {
            RetryDecision::Retry => JobState::Failed,
            RetryDecision::Dead => JobState::Dead,
        }
    }
}

/// Decide where a failed job goes. `attempts` is the count after the failure
/// has been recorded.
pub fn decide(attempts: u32, max_retries: u32) -> RetryDecision {
    if attempts >= max_retries {
        RetryDecision::Dead
    } else {
        RetryDecision::Retry
    }
}

/// `base ^ attempts` seconds, or `None` if that does not fit in a duration.
pub fn backoff_delay(base: u32, attempts: u32) -> Option<Duration> {
    let secs = i64::from(base).checked_pow(attempts)?;
    Duration::try_seconds(secs)
}

/// Backoff settings in effect for one claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: u32,
}

impl RetryPolicy {
    pub fn new(backoff_base: u32) -> Self {
        Self { backoff_base }
    }

    /// Earliest instant a failed job may be claimed again.
    pub fn retry_at(&self, job: &Job) -> Option<DateTime<Utc>> {
        backoff_delay(self.backoff_base, job.attempts)
            .and_then(|delay| job.updated_at.checked_add_signed(delay))
    }

    pub fn is_claimable(&self, job: &Job, now: DateTime<Utc>) -> bool {
        match job.state {
            JobState::Pending => true,
            JobState::Failed => self.retry_at(job).is_some_and(|at| now >= at),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_job(attempts: u32, updated_at: DateTime<Utc>) -> Job {
        let mut job = Job::new("j", "exit 1", 5).with_created_at(updated_at);
        job.state = JobState::Failed;
        job.attempts = attempts;
        job
    }

    #[test]
    fn decide_moves_to_dlq_when_attempts_reach_limit() {
        assert_eq!(decide(1, 3), RetryDecision::Retry);
        assert_eq!(decide(2, 3), RetryDecision::Retry);
        assert_eq!(decide(3, 3), RetryDecision::Dead);
        assert_eq!(decide(4, 3), RetryDecision::Dead);
        assert_eq!(decide(1, 1), RetryDecision::Dead);
    }

    #[test]
    fn decision_maps_to_state() {
        assert_eq!(RetryDecision::Retry.state(), JobState::Failed);
        assert_eq!(RetryDecision::Dead.state(), JobState::Dead);
    }

    #[test]
    fn delay_is_exponential_in_attempts() {
        assert_eq!(backoff_delay(2, 0), Some(Duration::seconds(1)));
        assert_eq!(backoff_delay(2, 1), Some(Duration::seconds(2)));
        assert_eq!(backoff_delay(2, 3), Some(Duration::seconds(8)));
        assert_eq!(backoff_delay(1, 10), Some(Duration::seconds(1)));
        assert_eq!(backoff_delay(3, 2), Some(Duration::seconds(9)));
    }

    #[test]
    fn delay_overflow_yields_none() {
        assert_eq!(backoff_delay(10, 40), None);
        assert_eq!(backoff_delay(u32::MAX, 3), None);
    }

    #[test]
    fn failed_job_is_not_claimable_before_backoff() {
        let failed_at = Utc::now();
        let job = failed_job(2, failed_at);
        let policy = RetryPolicy::new(2);

        assert!(!policy.is_claimable(&job, failed_at));
        assert!(!policy.is_claimable(&job, failed_at + Duration::milliseconds(3999)));
        assert!(policy.is_claimable(&job, failed_at + Duration::seconds(4)));
        assert!(policy.is_claimable(&job, failed_at + Duration::seconds(60)));
    }

    #[test]
    fn pending_is_always_claimable_and_others_never() {
        let now = Utc::now();
        let policy = RetryPolicy::new(2);
        let mut job = Job::new("j", "true", 3);
        assert!(policy.is_claimable(&job, now));

        for state in [JobState::Processing, JobState::Completed, JobState::Dead] {
            job.state = state;
            assert!(!policy.is_claimable(&job, now + Duration::days(365)));
        }
    }

    #[test]
    fn overflowing_backoff_is_never_claimable() {
        let job = failed_job(60, Utc::now());
        let policy = RetryPolicy::new(10);

        assert_eq!(policy.retry_at(&job), None);
        assert!(!policy.is_claimable(&job, Utc::now() + Duration::days(3650)));
    }
}
