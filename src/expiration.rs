use chrono::{DateTime, Duration, Utc};

use crate::config::QueueTimeouts;
use crate::job::JobStatus;

/// Per-job timeout overrides. `Duration::zero()` means "use the queue default".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimeouts {
    pub timeout: Duration,
    pub run_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            timeout: Duration::zero(),
            run_timeout: Duration::zero(),
            read_timeout: Duration::zero(),
        }
    }
}

fn effective(job_override: Duration, queue_default: Duration) -> Duration {
    if job_override.is_zero() {
        queue_default
    } else {
        job_override
    }
}

/// Compute the instant at which a job expires, given its current status.
///
/// The effective "last update" is `event_time` when set, `last_touch`
/// otherwise. A `Pending` job is additionally capped at
/// `submit_time + pending_timeout`, whichever limit comes first.
///
/// Pure and total: no side effects, deterministic for non-negative durations.
pub fn compute_expiration(
    status: JobStatus,
    last_touch: DateTime<Utc>,
    submit_time: DateTime<Utc>,
    job_timeouts: &JobTimeouts,
    queue_timeouts: &QueueTimeouts,
    event_time: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let last_update = event_time.unwrap_or(last_touch);

    match status {
        JobStatus::Running => {
            last_update + effective(job_timeouts.run_timeout, queue_timeouts.run_timeout)
        }
        JobStatus::Reading => {
            last_update + effective(job_timeouts.read_timeout, queue_timeouts.read_timeout)
        }
        JobStatus::Pending => {
            let regular = last_update + effective(job_timeouts.timeout, queue_timeouts.timeout);
            let pending_limit = submit_time + queue_timeouts.pending_timeout;
            regular.min(pending_limit)
        }
        _ => last_update + effective(job_timeouts.timeout, queue_timeouts.timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn queue_timeouts() -> QueueTimeouts {
        QueueTimeouts {
            timeout: Duration::seconds(100),
            run_timeout: Duration::seconds(50),
            read_timeout: Duration::seconds(25),
            pending_timeout: Duration::seconds(1000),
        }
    }

    #[test]
    fn running_uses_run_timeout() {
        let exp = compute_expiration(
            JobStatus::Running,
            t0(),
            t0(),
            &JobTimeouts::default(),
            &queue_timeouts(),
            None,
        );
        assert_eq!(exp, t0() + Duration::seconds(50));
    }

    #[test]
    fn job_override_wins_over_queue_default() {
        let overrides = JobTimeouts {
            run_timeout: Duration::seconds(7),
            ..Default::default()
        };
        let exp = compute_expiration(
            JobStatus::Running,
            t0(),
            t0(),
            &overrides,
            &queue_timeouts(),
            None,
        );
        assert_eq!(exp, t0() + Duration::seconds(7));
    }

    #[test]
    fn event_time_replaces_last_touch() {
        let later = t0() + Duration::seconds(30);
        let exp = compute_expiration(
            JobStatus::Reading,
            t0(),
            t0(),
            &JobTimeouts::default(),
            &queue_timeouts(),
            Some(later),
        );
        assert_eq!(exp, later + Duration::seconds(25));
    }

    #[test]
    fn pending_capped_by_pending_timeout() {
        let overrides = JobTimeouts {
            timeout: Duration::seconds(1_000_000),
            ..Default::default()
        };
        let exp = compute_expiration(
            JobStatus::Pending,
            t0(),
            t0(),
            &overrides,
            &queue_timeouts(),
            None,
        );
        assert_eq!(exp, t0() + Duration::seconds(1000));
    }

    #[test]
    fn pending_regular_limit_when_tighter() {
        let exp = compute_expiration(
            JobStatus::Pending,
            t0(),
            t0(),
            &JobTimeouts::default(),
            &queue_timeouts(),
            None,
        );
        assert_eq!(exp, t0() + Duration::seconds(100));
    }

    #[test]
    fn terminal_states_use_regular_timeout() {
        for status in [JobStatus::Done, JobStatus::Failed, JobStatus::Canceled] {
            let exp = compute_expiration(
                status,
                t0(),
                t0(),
                &JobTimeouts::default(),
                &queue_timeouts(),
                None,
            );
            assert_eq!(exp, t0() + Duration::seconds(100));
        }
    }

    #[test]
    fn monotonic_in_last_touch() {
        let early = compute_expiration(
            JobStatus::Done,
            t0(),
            t0(),
            &JobTimeouts::default(),
            &queue_timeouts(),
            None,
        );
        let late = compute_expiration(
            JobStatus::Done,
            t0() + Duration::seconds(5),
            t0(),
            &JobTimeouts::default(),
            &queue_timeouts(),
            None,
        );
        assert!(late > early);
    }
}
