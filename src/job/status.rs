use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Lifecycle status of a job.
///
/// Discriminants are stable: they appear verbatim in dump records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobStatus {
    Pending = 0,
    Running = 1,
    Returned = 2,
    Canceled = 3,
    Failed = 4,
    Done = 5,
    Reading = 6,
    Confirmed = 7,
    ReadFailed = 8,
    Deleted = 9,
}

impl JobStatus {
    /// True for states from which the scheduler will not dispatch the job
    /// again. A `Done` job may still be handed out for result reading.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done
                | JobStatus::Failed
                | JobStatus::Canceled
                | JobStatus::Confirmed
                | JobStatus::ReadFailed
        )
    }

    pub fn from_repr(repr: u8) -> Option<Self> {
        match repr {
            0 => Some(JobStatus::Pending),
            1 => Some(JobStatus::Running),
            2 => Some(JobStatus::Returned),
            3 => Some(JobStatus::Canceled),
            4 => Some(JobStatus::Failed),
            5 => Some(JobStatus::Done),
            6 => Some(JobStatus::Reading),
            7 => Some(JobStatus::Confirmed),
            8 => Some(JobStatus::ReadFailed),
            9 => Some(JobStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Returned => write!(f, "Returned"),
            JobStatus::Canceled => write!(f, "Canceled"),
            JobStatus::Failed => write!(f, "Failed"),
            JobStatus::Done => write!(f, "Done"),
            JobStatus::Reading => write!(f, "Reading"),
            JobStatus::Confirmed => write!(f, "Confirmed"),
            JobStatus::ReadFailed => write!(f, "ReadFailed"),
            JobStatus::Deleted => write!(f, "Deleted"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "returned" => Ok(JobStatus::Returned),
            "canceled" | "cancelled" => Ok(JobStatus::Canceled),
            "failed" => Ok(JobStatus::Failed),
            "done" => Ok(JobStatus::Done),
            "reading" => Ok(JobStatus::Reading),
            "confirmed" => Ok(JobStatus::Confirmed),
            "readfailed" => Ok(JobStatus::ReadFailed),
            "deleted" => Ok(JobStatus::Deleted),
            other => Err(QueueError::InvalidParameter {
                field: "status",
                message: format!("unknown job status '{}'", other),
            }),
        }
    }
}
