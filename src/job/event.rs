use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// What happened to a job. Ordered, closed enum; discriminants are stable
/// and appear verbatim in dump records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobEventKind {
    Submit = 0,
    BatchSubmit = 1,
    Request = 2,
    Done = 3,
    Return = 4,
    Fail = 5,
    FinalFail = 6,
    Read = 7,
    ReadFail = 8,
    ReadFinalFail = 9,
    ReadDone = 10,
    ReadRollback = 11,
    Clear = 12,
    Cancel = 13,
    Timeout = 14,
    ReadTimeout = 15,
    SessionChanged = 16,
    /// Scheduler-initiated rollback of a submit that could not be committed.
    SubmitRollback = 17,
    /// Scheduler-initiated rollback of a dispatch-for-execution.
    GetRollback = 18,
    /// Scheduler-initiated rollback of a dispatch-for-reading.
    ServerReadRollback = 19,
    ReturnNoBlacklist = 20,
    Reschedule = 21,
    Redo = 22,
    Reread = 23,
}

impl JobEventKind {
    pub fn from_repr(repr: u8) -> Option<Self> {
        use JobEventKind::*;
        const ALL: [JobEventKind; 24] = [
            Submit,
            BatchSubmit,
            Request,
            Done,
            Return,
            Fail,
            FinalFail,
            Read,
            ReadFail,
            ReadFinalFail,
            ReadDone,
            ReadRollback,
            Clear,
            Cancel,
            Timeout,
            ReadTimeout,
            SessionChanged,
            SubmitRollback,
            GetRollback,
            ServerReadRollback,
            ReturnNoBlacklist,
            Reschedule,
            Redo,
            Reread,
        ];
        ALL.get(repr as usize).copied()
    }
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobEventKind::Submit => "Submit",
            JobEventKind::BatchSubmit => "BatchSubmit",
            JobEventKind::Request => "Request",
            JobEventKind::Done => "Done",
            JobEventKind::Return => "Return",
            JobEventKind::Fail => "Fail",
            JobEventKind::FinalFail => "FinalFail",
            JobEventKind::Read => "Read",
            JobEventKind::ReadFail => "ReadFail",
            JobEventKind::ReadFinalFail => "ReadFinalFail",
            JobEventKind::ReadDone => "ReadDone",
            JobEventKind::ReadRollback => "ReadRollback",
            JobEventKind::Clear => "Clear",
            JobEventKind::Cancel => "Cancel",
            JobEventKind::Timeout => "Timeout",
            JobEventKind::ReadTimeout => "ReadTimeout",
            JobEventKind::SessionChanged => "SessionChanged",
            JobEventKind::SubmitRollback => "SubmitRollback",
            JobEventKind::GetRollback => "GetRollback",
            JobEventKind::ServerReadRollback => "ServerReadRollback",
            JobEventKind::ReturnNoBlacklist => "ReturnNoBlacklist",
            JobEventKind::Reschedule => "Reschedule",
            JobEventKind::Redo => "Redo",
            JobEventKind::Reread => "Reread",
        };
        write!(f, "{}", name)
    }
}

/// One recorded state transition in a job's audit trail.
///
/// Events are only ever appended, in call order; the caller fills in the
/// fields through the handle returned by `Job::append_event`. Timestamps
/// are expected to be non-decreasing across the log; the entity does not
/// defend against an out-of-order caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    /// Job status after this event applied.
    pub status: JobStatus,
    /// `None` means "unset", distinct from any real instant.
    pub timestamp: Option<DateTime<Utc>>,
    pub client_node: String,
    pub client_session: String,
    pub ret_code: i32,
    pub err_msg: String,
    /// Numeric address of the acting worker node; 0 is the scheduler itself.
    pub node_addr: u32,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, status: JobStatus) -> Self {
        Self {
            kind,
            status,
            timestamp: None,
            client_node: String::new(),
            client_session: String::new(),
            ret_code: 0,
            err_msg: String::new(),
            node_addr: 0,
        }
    }
}

impl Default for JobEvent {
    fn default() -> Self {
        Self::new(JobEventKind::Submit, JobStatus::Pending)
    }
}
