pub mod event;
pub mod print;
pub mod status;

use std::io::{Read, Write};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueTimeouts;
use crate::dump::{read_record, write_record};
use crate::error::{QueueError, Result};
use crate::expiration::{compute_expiration, JobTimeouts};
use crate::protocol::args::CommandArguments;

pub use event::{JobEvent, JobEventKind};
pub use status::JobStatus;

/// Outcome of checking a client-supplied auth token against a job.
///
/// The passport is matched first (cheap); the event count second, so a
/// stale token for the right job is distinguishable from a token for the
/// wrong job, and both from a token that never parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCompareResult {
    InvalidFormat,
    NoMatch,
    PassportOnlyMatch,
    CompleteMatch,
}

/// The central mutable job record.
///
/// A job owns its event log: an append-only, strictly ordered audit trail.
/// Once the queue has committed the create transaction the log is never
/// empty; its first event is always the creation event (Submit or
/// BatchSubmit). The entity itself holds no lock; the queue serializes
/// access to any one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: u32,
    /// Random per-job value embedded in auth tokens to stop trivial
    /// forgery of job handles.
    pub passport: u32,
    pub status: JobStatus,

    pub input: String,
    pub output: String,
    pub progress_msg: String,

    /// Per-job overrides; zero means "use the queue default".
    pub timeouts: JobTimeouts,
    pub last_touch: DateTime<Utc>,

    pub subm_notif_port: u16,
    pub subm_notif_timeout: Duration,
    pub listener_notif_addr: u32,
    pub listener_notif_port: u16,
    pub listener_notif_abstime: Option<DateTime<Utc>>,
    pub need_subm_progress_msg_notif: bool,
    pub need_lsnr_progress_msg_notif: bool,
    pub need_stolen_notif: bool,

    pub affinity_id: u32,
    pub group_id: u32,
    /// Bitmask of scheduling hints supplied at submit time.
    pub mask: u32,

    pub client_ip: String,
    pub client_sid: String,
    pub ncbi_phid: String,

    pub run_count: u32,
    pub read_count: u32,

    events: Vec<JobEvent>,
}

impl Job {
    pub fn new(id: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            passport: rand::random(),
            status: JobStatus::Pending,
            input: String::new(),
            output: String::new(),
            progress_msg: String::new(),
            timeouts: JobTimeouts::default(),
            last_touch: now,
            subm_notif_port: 0,
            subm_notif_timeout: Duration::zero(),
            listener_notif_addr: 0,
            listener_notif_port: 0,
            listener_notif_abstime: None,
            need_subm_progress_msg_notif: false,
            need_lsnr_progress_msg_notif: false,
            need_stolen_notif: false,
            affinity_id: 0,
            group_id: 0,
            mask: 0,
            client_ip: String::new(),
            client_sid: String::new(),
            ncbi_phid: String::new(),
            run_count: 0,
            read_count: 0,
            events: Vec::new(),
        }
    }

    /// Populate a fresh job from a validated submit request.
    ///
    /// Status starts at `Pending`. The first event is NOT appended here;
    /// recording the Submit event is part of the queue's create
    /// transaction, which calls `append_event` itself.
    pub fn from_submit(id: u32, now: DateTime<Utc>, args: &CommandArguments) -> Self {
        let mut job = Job::new(id, now);
        job.input = args.input.clone();
        job.mask = args.mask;
        job.subm_notif_port = args.port;
        job.subm_notif_timeout = args.timeout;
        job.client_ip = args.ip.clone();
        job.client_sid = args.sid.clone();
        job.ncbi_phid = args.ncbi_phid.clone();
        job
    }

    /// Append a default-initialized event and hand back a mutable handle to
    /// it. Events are always appended at the tail, never inserted.
    pub fn append_event(&mut self, kind: JobEventKind, status: JobStatus) -> &mut JobEvent {
        self.events.push(JobEvent::new(kind, status));
        self.events.last_mut().expect("event was just pushed")
    }

    pub fn events(&self) -> &[JobEvent] {
        &self.events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn last_event(&self) -> Option<&JobEvent> {
        self.events.last()
    }

    pub fn last_event_mut(&mut self) -> Option<&mut JobEvent> {
        self.events.last_mut()
    }

    /// Error text of the most recent event; empty when none was recorded.
    pub fn err_msg(&self) -> &str {
        self.events.last().map(|e| e.err_msg.as_str()).unwrap_or("")
    }

    /// Return code of the most recent event. The all-ones sentinel is
    /// returned for an empty log, which is unreachable once the create
    /// transaction has committed.
    pub fn ret_code(&self) -> i32 {
        self.events.last().map(|e| e.ret_code).unwrap_or(-1)
    }

    /// Timestamp of the creation event, when recorded.
    pub fn submit_time(&self) -> Option<DateTime<Utc>> {
        self.events.first().and_then(|e| e.timestamp)
    }

    /// The token handed to the actor of the most recent dispatch:
    /// `"<passport>_<event_count>"` at issuance time.
    pub fn auth_token(&self) -> String {
        format!("{}_{}", self.passport, self.events.len())
    }

    /// Check a client-supplied auth token of the form
    /// `"<passport>_<event_count>"`.
    pub fn compare_auth_token(&self, token: &str) -> TokenCompareResult {
        let Some((passport_part, count_part)) = token.split_once('_') else {
            return TokenCompareResult::InvalidFormat;
        };
        let Ok(passport) = passport_part.parse::<u32>() else {
            return TokenCompareResult::InvalidFormat;
        };
        let Ok(count) = count_part.parse::<usize>() else {
            return TokenCompareResult::InvalidFormat;
        };
        if passport != self.passport {
            return TokenCompareResult::NoMatch;
        }
        if count != self.events.len() {
            return TokenCompareResult::PassportOnlyMatch;
        }
        TokenCompareResult::CompleteMatch
    }

    /// True while the submitter registered a notification target and the
    /// notify window counted from the submit event is still open.
    pub fn should_notify_submitter(&self, now: DateTime<Utc>) -> bool {
        if self.subm_notif_port == 0 || self.subm_notif_timeout.is_zero() {
            return false;
        }
        match self.submit_time() {
            Some(submitted) => now <= submitted + self.subm_notif_timeout,
            None => false,
        }
    }

    /// True while a listener target is registered and its absolute deadline
    /// has not passed.
    pub fn should_notify_listener(&self, now: DateTime<Utc>) -> bool {
        if self.listener_notif_addr == 0 || self.listener_notif_port == 0 {
            return false;
        }
        match self.listener_notif_abstime {
            Some(deadline) => now <= deadline,
            None => false,
        }
    }

    /// Status to revert to when reading is rolled back: scan the log
    /// backward for the most recent event whose post-status is `Reading`
    /// and return the status of the event immediately before it.
    ///
    /// A job can only reach `Reading` through a recorded transition, so a
    /// missing pair is an invariant violation, not a user error.
    pub fn status_before_reading(&self) -> Result<JobStatus> {
        for idx in (1..self.events.len()).rev() {
            if self.events[idx].status == JobStatus::Reading {
                return Ok(self.events[idx - 1].status);
            }
        }
        Err(QueueError::Internal(
            "no status before reading is found".to_string(),
        ))
    }

    /// Next expiration instant for the job's current status, taking the
    /// most recent event time as the effective last update.
    pub fn expiration(&self, queue_timeouts: &QueueTimeouts) -> DateTime<Utc> {
        let event_time = self.events.last().and_then(|e| e.timestamp);
        let submit_time = self.submit_time().unwrap_or(self.last_touch);
        compute_expiration(
            self.status,
            self.last_touch,
            submit_time,
            &self.timeouts,
            queue_timeouts,
            event_time,
        )
    }

    /// Serialize the full job as one dump record.
    pub fn dump(&self, writer: &mut impl Write) -> Result<()> {
        write_record(writer, &JobRecord::from(self))
    }

    /// Read back one job record. `Ok(None)` is a clean end-of-stream, not
    /// an error; any truncated or undecodable record aborts the load.
    pub fn load_from_dump(reader: &mut impl Read) -> Result<Option<Job>> {
        match read_record::<JobRecord>(reader)? {
            Some(record) => Ok(Some(record.into())),
            None => Ok(None),
        }
    }
}

/// Flat on-disk form of a job: scalar header fields plus length-prefixed
/// variable blobs (the encoding carries each blob's size).
#[derive(Serialize, Deserialize)]
struct JobRecord {
    id: u32,
    passport: u32,
    status: JobStatus,
    timeout_ms: i64,
    run_timeout_ms: i64,
    read_timeout_ms: i64,
    last_touch: DateTime<Utc>,
    subm_notif_port: u16,
    subm_notif_timeout_ms: i64,
    listener_notif_addr: u32,
    listener_notif_port: u16,
    listener_notif_abstime: Option<DateTime<Utc>>,
    need_subm_progress_msg_notif: bool,
    need_lsnr_progress_msg_notif: bool,
    need_stolen_notif: bool,
    affinity_id: u32,
    group_id: u32,
    mask: u32,
    run_count: u32,
    read_count: u32,
    progress_msg: String,
    client_ip: String,
    client_sid: String,
    ncbi_phid: String,
    events: Vec<JobEvent>,
    input: String,
    output: String,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            passport: job.passport,
            status: job.status,
            timeout_ms: job.timeouts.timeout.num_milliseconds(),
            run_timeout_ms: job.timeouts.run_timeout.num_milliseconds(),
            read_timeout_ms: job.timeouts.read_timeout.num_milliseconds(),
            last_touch: job.last_touch,
            subm_notif_port: job.subm_notif_port,
            subm_notif_timeout_ms: job.subm_notif_timeout.num_milliseconds(),
            listener_notif_addr: job.listener_notif_addr,
            listener_notif_port: job.listener_notif_port,
            listener_notif_abstime: job.listener_notif_abstime,
            need_subm_progress_msg_notif: job.need_subm_progress_msg_notif,
            need_lsnr_progress_msg_notif: job.need_lsnr_progress_msg_notif,
            need_stolen_notif: job.need_stolen_notif,
            affinity_id: job.affinity_id,
            group_id: job.group_id,
            mask: job.mask,
            run_count: job.run_count,
            read_count: job.read_count,
            progress_msg: job.progress_msg.clone(),
            client_ip: job.client_ip.clone(),
            client_sid: job.client_sid.clone(),
            ncbi_phid: job.ncbi_phid.clone(),
            events: job.events.clone(),
            input: job.input.clone(),
            output: job.output.clone(),
        }
    }
}

impl From<JobRecord> for Job {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id,
            passport: record.passport,
            status: record.status,
            input: record.input,
            output: record.output,
            progress_msg: record.progress_msg,
            timeouts: JobTimeouts {
                timeout: Duration::milliseconds(record.timeout_ms),
                run_timeout: Duration::milliseconds(record.run_timeout_ms),
                read_timeout: Duration::milliseconds(record.read_timeout_ms),
            },
            last_touch: record.last_touch,
            subm_notif_port: record.subm_notif_port,
            subm_notif_timeout: Duration::milliseconds(record.subm_notif_timeout_ms),
            listener_notif_addr: record.listener_notif_addr,
            listener_notif_port: record.listener_notif_port,
            listener_notif_abstime: record.listener_notif_abstime,
            need_subm_progress_msg_notif: record.need_subm_progress_msg_notif,
            need_lsnr_progress_msg_notif: record.need_lsnr_progress_msg_notif,
            need_stolen_notif: record.need_stolen_notif,
            affinity_id: record.affinity_id,
            group_id: record.group_id,
            mask: record.mask,
            client_ip: record.client_ip,
            client_sid: record.client_sid,
            ncbi_phid: record.ncbi_phid,
            run_count: record.run_count,
            read_count: record.read_count,
            events: record.events,
        }
    }
}
