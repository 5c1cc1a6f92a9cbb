//! Upload timeout and retry policy.

use std::time::Duration;

use crate::domain::types::UploadErrorKind;

const MIN_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const BYTES_PER_EXTRA_SECOND: u64 = 100 * 1024;

/// Upload timeout for a payload of `size_bytes`: 30 s plus 1 s per 100 KiB, capped at 120 s.
pub fn upload_timeout(size_bytes: u64) -> Duration {
    let extra = Duration::from_secs(size_bytes / BYTES_PER_EXTRA_SECOND);
    MIN_UPLOAD_TIMEOUT
        .saturating_add(extra)
        .clamp(MIN_UPLOAD_TIMEOUT, MAX_UPLOAD_TIMEOUT)
}

/// Delay before each attempt, indexed by the number of attempts already made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(240),
        ])
    }
}

impl BackoffSchedule {
    /// An empty schedule means no delay at all.
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps }
    }

    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let Some(last) = self.steps.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let idx = (attempts_made as usize).min(last);
        self.steps[idx]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Abandon,
}

/// Decide what happens after a failed attempt; `attempt_count` already includes it.
pub fn decide(
    kind: UploadErrorKind,
    attempt_count: u32,
    max_attempts: u32,
    backoff: &BackoffSchedule,
) -> RetryDecision {
    if !kind.is_retryable() || attempt_count >= max_attempts {
        return RetryDecision::Abandon;
    }
    RetryDecision::Retry {
        delay: backoff.delay_for(attempt_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_scales_with_size() {
        assert_eq!(upload_timeout(0), Duration::from_secs(30));
        assert_eq!(upload_timeout(100 * 1024 - 1), Duration::from_secs(30));
        assert_eq!(upload_timeout(1024 * 1024), Duration::from_secs(40));
        assert_eq!(upload_timeout(6 * 1024 * 1024), Duration::from_secs(91));
        assert_eq!(upload_timeout(6_000_000 * 2), Duration::from_secs(120));
        assert_eq!(upload_timeout(u64::MAX), Duration::from_secs(120));
    }

    #[test]
    fn backoff_clamps_to_last_step() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.delay_for(0), Duration::ZERO);
        assert_eq!(schedule.delay_for(1), Duration::from_secs(60));
        assert_eq!(schedule.delay_for(3), Duration::from_secs(240));
        assert_eq!(schedule.delay_for(9), Duration::from_secs(240));
        assert_eq!(BackoffSchedule::new(Vec::new()).delay_for(2), Duration::ZERO);
    }

    #[test]
    fn permanent_failures_abandon_immediately() {
        let schedule = BackoffSchedule::default();
        for kind in [
            UploadErrorKind::Auth,
            UploadErrorKind::SizeLimit,
            UploadErrorKind::Fatal,
        ] {
            assert_eq!(decide(kind, 1, 3, &schedule), RetryDecision::Abandon);
        }
    }

    #[test]
    fn retryable_failures_follow_schedule_until_bound() {
        let schedule = BackoffSchedule::default();
        assert_eq!(
            decide(UploadErrorKind::Transient, 1, 3, &schedule),
            RetryDecision::Retry {
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(
            decide(UploadErrorKind::RateLimit, 2, 3, &schedule),
            RetryDecision::Retry {
                delay: Duration::from_secs(120)
            }
        );
        assert_eq!(
            decide(UploadErrorKind::Timeout, 3, 3, &schedule),
            RetryDecision::Abandon
        );
    }
}
