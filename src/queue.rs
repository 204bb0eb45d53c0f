//! The queue: owns the jobs, both registries, and the per-queue defaults.
//!
//! All job mutation funnels through here; the queue appends the audit
//! events and decides retry-vs-final-fail policy, while the job entity
//! just records what it is told. The queue itself holds no lock; an
//! embedding server wraps it the same way it would wrap any other
//! single-writer state.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};

use chrono::{DateTime, Utc};

use crate::config::QueueConfig;
use crate::dump::DumpContext;
use crate::error::{QueueError, Result};
use crate::job::print::{JobFields, PrintContext};
use crate::job::{Job, JobEventKind, JobStatus, TokenCompareResult};
use crate::protocol::args::CommandArguments;
use crate::protocol::job_key::make_job_key;
use crate::registry::{AffinityRegistry, GroupRegistry};

/// What a successful submit hands back to the client.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: u32,
    pub job_key: String,
    pub auth_token: String,
}

/// A job handed out for execution.
#[derive(Debug, Clone)]
pub struct DispatchedJob {
    pub job_id: u32,
    pub job_key: String,
    pub auth_token: String,
    pub input: String,
}

/// A finished job handed out for result reading.
#[derive(Debug, Clone)]
pub struct ReadableJob {
    pub job_id: u32,
    pub job_key: String,
    pub auth_token: String,
    pub output: String,
}

pub struct Queue {
    name: String,
    host: String,
    port: u16,
    config: QueueConfig,
    jobs: HashMap<u32, Job>,
    groups: GroupRegistry,
    affinities: AffinityRegistry,
    last_job_id: u32,
}

impl Queue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            host: "localhost".to_string(),
            port: 9100,
            config,
            jobs: HashMap::new(),
            groups: GroupRegistry::new(),
            affinities: AffinityRegistry::new(),
            last_job_id: 0,
        }
    }

    /// Host/port advertised inside composite job keys.
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn affinities(&self) -> &AffinityRegistry {
        &self.affinities
    }

    pub fn job(&self, job_id: u32) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn next_job_id(&mut self) -> u32 {
        loop {
            self.last_job_id = self.last_job_id.wrapping_add(1);
            if self.last_job_id != 0 && !self.jobs.contains_key(&self.last_job_id) {
                return self.last_job_id;
            }
        }
    }

    /// Create a job from a validated submit request. Appending the Submit
    /// event is part of this transaction: once the queue returns, the job's
    /// event log is non-empty for the rest of its life.
    pub fn submit(&mut self, args: &CommandArguments, now: DateTime<Utc>) -> Result<SubmittedJob> {
        let job_id = self.next_job_id();
        let mut job = Job::from_submit(job_id, now, args);

        job.affinity_id = self.affinities.resolve(args.affinity());
        job.group_id = self.groups.add_job_by_token(args.group(), job_id);

        let event = job.append_event(JobEventKind::Submit, JobStatus::Pending);
        event.timestamp = Some(now);
        event.client_node = args.ip.clone();
        event.client_session = args.sid.clone();

        let auth_token = job.auth_token();
        self.jobs.insert(job_id, job);
        tracing::info!(job_id, "Job submitted");

        Ok(SubmittedJob {
            job_id,
            job_key: make_job_key(job_id, &self.host, self.port),
            auth_token,
        })
    }

    /// Batch submission: contiguous ids, one shared group, a BatchSubmit
    /// creation event per job, and a single bulk insert into the group's
    /// bitmap.
    pub fn submit_batch(
        &mut self,
        batch: &[CommandArguments],
        group: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<u32>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let first_id = self.next_job_id();
        let count = u32::try_from(batch.len()).map_err(|_| QueueError::InvalidParameter {
            field: "count",
            message: "batch is too large".to_string(),
        })?;
        let last_id = first_id
            .checked_add(count - 1)
            .ok_or_else(|| QueueError::InvalidParameter {
                field: "count",
                message: "job id space exhausted".to_string(),
            })?;

        let group_id = self.groups.resolve(group);
        let mut ids = Vec::with_capacity(batch.len());
        for (offset, args) in batch.iter().enumerate() {
            let job_id = first_id + offset as u32;
            let mut job = Job::from_submit(job_id, now, args);
            job.affinity_id = self.affinities.resolve(args.affinity());
            job.group_id = group_id;

            let event = job.append_event(JobEventKind::BatchSubmit, JobStatus::Pending);
            event.timestamp = Some(now);
            event.client_node = args.ip.clone();
            event.client_session = args.sid.clone();

            self.jobs.insert(job_id, job);
            ids.push(job_id);
        }
        self.last_job_id = last_id;
        self.groups.add_jobs(group_id, first_id, count)?;
        tracing::info!(first_id, count, "Batch submitted");
        Ok(ids)
    }

    /// Hand the oldest pending job out for execution.
    pub fn get_job_for_execution(
        &mut self,
        node_addr: u32,
        session: &str,
        now: DateTime<Utc>,
    ) -> Option<DispatchedJob> {
        let job_id = self
            .jobs
            .iter()
            .filter(|(_, job)| job.status == JobStatus::Pending)
            .map(|(id, _)| *id)
            .min()?;

        let job = self.jobs.get_mut(&job_id).expect("job id was just found");
        job.status = JobStatus::Running;
        job.run_count += 1;
        job.last_touch = now;
        let event = job.append_event(JobEventKind::Request, JobStatus::Running);
        event.timestamp = Some(now);
        event.node_addr = node_addr;
        event.client_session = session.to_string();

        let dispatched = DispatchedJob {
            job_id,
            job_key: make_job_key(job_id, &self.host, self.port),
            auth_token: job.auth_token(),
            input: job.input.clone(),
        };
        tracing::info!(job_id, node_addr, "Job dispatched for execution");
        Some(dispatched)
    }

    /// Record successful execution output.
    pub fn put_result(
        &mut self,
        job_id: u32,
        auth_token: &str,
        ret_code: i32,
        output: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = checked_job_mut(&mut self.jobs, job_id, auth_token)?;
        expect_status(job, JobStatus::Running)?;

        job.output = output;
        job.status = JobStatus::Done;
        job.last_touch = now;
        let event = job.append_event(JobEventKind::Done, JobStatus::Done);
        event.timestamp = Some(now);
        event.ret_code = ret_code;
        tracing::info!(job_id, ret_code, "Job done");
        Ok(())
    }

    /// Give a running job back to the queue.
    pub fn return_job(
        &mut self,
        job_id: u32,
        auth_token: &str,
        blacklist: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = checked_job_mut(&mut self.jobs, job_id, auth_token)?;
        expect_status(job, JobStatus::Running)?;

        let kind = if blacklist {
            JobEventKind::Return
        } else {
            JobEventKind::ReturnNoBlacklist
        };
        job.status = JobStatus::Pending;
        job.last_touch = now;
        let event = job.append_event(kind, JobStatus::Pending);
        event.timestamp = Some(now);
        tracing::info!(job_id, "Job returned");
        Ok(())
    }

    /// Record an execution failure. Retry policy lives here, not in the
    /// job: once the configured retry budget is exhausted (or the client
    /// asked for no retries) the failure is final. Returns true when the
    /// job became terminally failed.
    pub fn fail_job(
        &mut self,
        job_id: u32,
        auth_token: &str,
        err_msg: String,
        ret_code: i32,
        no_retries: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let retries = self.config.failed_retries;
        let job = checked_job_mut(&mut self.jobs, job_id, auth_token)?;
        expect_status(job, JobStatus::Running)?;

        let prior_fails = job
            .events()
            .iter()
            .filter(|e| e.kind == JobEventKind::Fail)
            .count() as u32;
        let is_final = no_retries || prior_fails >= retries;
        let kind = if is_final {
            JobEventKind::FinalFail
        } else {
            JobEventKind::Fail
        };

        job.status = JobStatus::Failed;
        job.last_touch = now;
        let event = job.append_event(kind, JobStatus::Failed);
        event.timestamp = Some(now);
        event.ret_code = ret_code;
        event.err_msg = err_msg;
        tracing::warn!(job_id, is_final, "Job failed");
        Ok(is_final)
    }

    /// Put a retriable failed job back into rotation.
    pub fn reschedule_job(&mut self, job_id: u32, now: DateTime<Utc>) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        expect_status(job, JobStatus::Failed)?;
        if job.last_event().map(|e| e.kind) == Some(JobEventKind::FinalFail) {
            return Err(QueueError::InvalidParameter {
                field: "job_key",
                message: format!("job {} has failed permanently", job_id),
            });
        }
        job.status = JobStatus::Pending;
        job.last_touch = now;
        job.append_event(JobEventKind::Reschedule, JobStatus::Pending)
            .timestamp = Some(now);
        tracing::info!(job_id, "Job rescheduled");
        Ok(())
    }

    /// Cancel a job in any non-terminal state; canceling an already
    /// canceled job is a no-op. Returns the status the job had before.
    pub fn cancel_job(&mut self, job_id: u32, now: DateTime<Utc>) -> Result<JobStatus> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        let old_status = job.status;
        if old_status == JobStatus::Canceled {
            return Ok(old_status);
        }
        job.status = JobStatus::Canceled;
        job.last_touch = now;
        job.append_event(JobEventKind::Cancel, JobStatus::Canceled)
            .timestamp = Some(now);
        tracing::info!(job_id, %old_status, "Job canceled");
        Ok(old_status)
    }

    /// Cancel every job of a group. Returns how many jobs were canceled.
    pub fn cancel_group(&mut self, group: &str, now: DateTime<Utc>) -> Result<usize> {
        let members = self.groups.jobs(group, false)?;
        let mut canceled = 0;
        for job_id in members {
            match self.cancel_job(job_id, now) {
                Ok(JobStatus::Canceled) => {}
                Ok(_) => canceled += 1,
                Err(QueueError::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(group, canceled, "Group canceled");
        Ok(canceled)
    }

    /// Administrative reset: a non-terminal job goes back to pending, for
    /// instance when its worker node is cleared from the grid.
    pub fn clear_job(&mut self, job_id: u32, now: DateTime<Utc>) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(QueueError::InvalidParameter {
                field: "job_key",
                message: format!("job {} is already in state {}", job_id, job.status),
            });
        }
        job.status = JobStatus::Pending;
        job.last_touch = now;
        job.append_event(JobEventKind::Clear, JobStatus::Pending)
            .timestamp = Some(now);
        tracing::info!(job_id, "Job cleared back to pending");
        Ok(())
    }

    /// Undo a submit that could not be committed: the job vanishes as if
    /// it never existed.
    pub fn rollback_submit(&mut self, job_id: u32) -> Result<()> {
        let job = self
            .jobs
            .remove(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        if job.group_id != 0 {
            self.groups.remove_job(job.group_id, job_id)?;
        }
        tracing::info!(job_id, "Submit rolled back");
        Ok(())
    }

    /// Undo a dispatch-for-execution: the job goes back to pending and the
    /// dispatch is not counted against it.
    pub fn rollback_get(&mut self, job_id: u32, auth_token: &str, now: DateTime<Utc>) -> Result<()> {
        let job = checked_job_mut(&mut self.jobs, job_id, auth_token)?;
        expect_status(job, JobStatus::Running)?;

        job.status = JobStatus::Pending;
        job.run_count = job.run_count.saturating_sub(1);
        job.last_touch = now;
        job.append_event(JobEventKind::GetRollback, JobStatus::Pending)
            .timestamp = Some(now);
        Ok(())
    }

    /// Hand the oldest finished job out for result reading.
    pub fn get_job_for_reading(
        &mut self,
        node_addr: u32,
        session: &str,
        now: DateTime<Utc>,
    ) -> Option<ReadableJob> {
        let job_id = self
            .jobs
            .iter()
            .filter(|(_, job)| job.status == JobStatus::Done)
            .map(|(id, _)| *id)
            .min()?;

        let job = self.jobs.get_mut(&job_id).expect("job id was just found");
        job.status = JobStatus::Reading;
        job.read_count += 1;
        job.last_touch = now;
        let event = job.append_event(JobEventKind::Read, JobStatus::Reading);
        event.timestamp = Some(now);
        event.node_addr = node_addr;
        event.client_session = session.to_string();

        let readable = ReadableJob {
            job_id,
            job_key: make_job_key(job_id, &self.host, self.port),
            auth_token: job.auth_token(),
            output: job.output.clone(),
        };
        tracing::info!(job_id, node_addr, "Job dispatched for reading");
        Some(readable)
    }

    /// Reading finished successfully; the job is confirmed and terminal.
    pub fn confirm_read(
        &mut self,
        job_id: u32,
        auth_token: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = checked_job_mut(&mut self.jobs, job_id, auth_token)?;
        expect_status(job, JobStatus::Reading)?;

        job.status = JobStatus::Confirmed;
        job.last_touch = now;
        job.append_event(JobEventKind::ReadDone, JobStatus::Confirmed)
            .timestamp = Some(now);
        Ok(())
    }

    /// Reader gave the job back: revert to whatever status it had just
    /// before the latest transition into Reading.
    pub fn rollback_read(
        &mut self,
        job_id: u32,
        auth_token: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = checked_job_mut(&mut self.jobs, job_id, auth_token)?;
        expect_status(job, JobStatus::Reading)?;

        let revert_to = job.status_before_reading()?;
        job.status = revert_to;
        job.last_touch = now;
        job.append_event(JobEventKind::ReadRollback, revert_to)
            .timestamp = Some(now);
        Ok(())
    }

    /// Record a reading failure, symmetric to `fail_job`.
    pub fn fail_read(
        &mut self,
        job_id: u32,
        auth_token: &str,
        err_msg: String,
        no_retries: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let retries = self.config.read_failed_retries;
        let job = checked_job_mut(&mut self.jobs, job_id, auth_token)?;
        expect_status(job, JobStatus::Reading)?;

        let prior_fails = job
            .events()
            .iter()
            .filter(|e| e.kind == JobEventKind::ReadFail)
            .count() as u32;
        let is_final = no_retries || prior_fails >= retries;
        let kind = if is_final {
            JobEventKind::ReadFinalFail
        } else {
            JobEventKind::ReadFail
        };

        job.status = JobStatus::ReadFailed;
        job.last_touch = now;
        let event = job.append_event(kind, JobStatus::ReadFailed);
        event.timestamp = Some(now);
        event.err_msg = err_msg;
        tracing::warn!(job_id, is_final, "Job reading failed");
        Ok(is_final)
    }

    /// Put a retriably read-failed job back into Reading.
    pub fn reread_job(&mut self, job_id: u32, now: DateTime<Utc>) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        expect_status(job, JobStatus::ReadFailed)?;
        if job.last_event().map(|e| e.kind) == Some(JobEventKind::ReadFinalFail) {
            return Err(QueueError::InvalidParameter {
                field: "job_key",
                message: format!("reading of job {} has failed permanently", job_id),
            });
        }
        job.status = JobStatus::Reading;
        job.read_count += 1;
        job.last_touch = now;
        job.append_event(JobEventKind::Reread, JobStatus::Reading)
            .timestamp = Some(now);
        Ok(())
    }

    /// Reaper pass over running/reading jobs whose deadline has passed:
    /// a timed-out run is requeued, a timed-out read reverts. At most
    /// `limit` jobs are processed per pass. Returns the affected ids.
    pub fn check_expirations(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<u32> {
        let expired: Vec<u32> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                matches!(job.status, JobStatus::Running | JobStatus::Reading)
                    && job.expiration(&self.config.timeouts) <= now
            })
            .map(|(id, _)| *id)
            .take(limit)
            .collect();

        let mut affected = Vec::new();
        for job_id in expired {
            let job = self.jobs.get_mut(&job_id).expect("expired id exists");
            match job.status {
                JobStatus::Running => {
                    job.status = JobStatus::Pending;
                    job.last_touch = now;
                    job.append_event(JobEventKind::Timeout, JobStatus::Pending)
                        .timestamp = Some(now);
                    tracing::warn!(job_id, "Job run timed out, requeued");
                    affected.push(job_id);
                }
                JobStatus::Reading => {
                    let revert_to = match job.status_before_reading() {
                        Ok(status) => status,
                        Err(e) => {
                            tracing::error!(job_id, error = %e, "Cannot revert timed out read");
                            continue;
                        }
                    };
                    job.status = revert_to;
                    job.last_touch = now;
                    job.append_event(JobEventKind::ReadTimeout, revert_to)
                        .timestamp = Some(now);
                    tracing::warn!(job_id, "Job read timed out, reverted");
                    affected.push(job_id);
                }
                _ => {}
            }
        }
        affected
    }

    /// Vacuum pass: drop jobs in any other state whose lifetime expired.
    /// Group membership is cleared so the group can become GC-eligible.
    pub fn collect_expired(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<u32> {
        let expired: Vec<u32> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                !matches!(job.status, JobStatus::Running | JobStatus::Reading)
                    && job.expiration(&self.config.timeouts) <= now
            })
            .map(|(id, _)| *id)
            .take(limit)
            .collect();

        for job_id in &expired {
            if let Some(job) = self.jobs.remove(job_id) {
                if job.group_id != 0 {
                    // The group may already be gone; that is fine here.
                    let _ = self.groups.remove_job(job.group_id, *job_id);
                }
                tracing::info!(job_id, "Expired job removed");
            }
        }
        expired
    }

    /// Render one job, selected field groups only.
    pub fn print_job(&self, job_id: u32, fields: JobFields) -> Result<String> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        let ctx = PrintContext {
            queue_name: &self.name,
            host: &self.host,
            port: self.port,
            timeouts: &self.config.timeouts,
            groups: &self.groups,
            affinities: &self.affinities,
        };
        Ok(job.print(fields, &ctx))
    }

    /// Persist the whole queue: every job, then the group registry.
    pub fn dump(&self, ctx: &DumpContext) -> Result<()> {
        fs::create_dir_all(ctx.dir())?;

        let file = File::create(ctx.jobs_file())?;
        let mut writer = BufWriter::new(file);
        let mut ids: Vec<u32> = self.jobs.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            self.jobs[id].dump(&mut writer)?;
        }
        writer.flush()?;
        tracing::info!(
            jobs = ids.len(),
            file = %ctx.jobs_file().display(),
            "Queue dumped"
        );

        self.groups.dump(ctx)
    }

    /// Restore a dumped queue: load the group dictionary, stream the job
    /// records back in, replay group membership, then finalize the group
    /// load (purging groups whose jobs expired before the dump was cut).
    /// Any format error makes the persisted state unusable as a whole.
    pub fn load_from_dump(&mut self, ctx: &DumpContext) -> Result<usize> {
        self.groups.load_from_dump(ctx)?;

        let mut loaded = 0;
        match File::open(ctx.jobs_file()) {
            Ok(file) => {
                let mut reader = BufReader::new(file);
                while let Some(job) = Job::load_from_dump(&mut reader)? {
                    if job.group_id != 0 {
                        self.groups.add_job(job.group_id, job.id).map_err(|_| {
                            QueueError::DumpFormat(format!(
                                "job {} references unknown group {}",
                                job.id, job.group_id
                            ))
                        })?;
                    }
                    self.last_job_id = self.last_job_id.max(job.id);
                    self.jobs.insert(job.id, job);
                    loaded += 1;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let purged = self.groups.finalize_loading();
        tracing::info!(loaded, purged, "Queue loaded from dump");
        Ok(loaded)
    }
}

/// Resolve a job and verify the caller's auth token against it. The three
/// failure shapes are reported distinctly so a client can tell a stale
/// handle on the right job from a handle to the wrong job.
fn checked_job_mut<'a>(
    jobs: &'a mut HashMap<u32, Job>,
    job_id: u32,
    auth_token: &str,
) -> Result<&'a mut Job> {
    let job = jobs
        .get_mut(&job_id)
        .ok_or(QueueError::JobNotFound(job_id))?;
    match job.compare_auth_token(auth_token) {
        TokenCompareResult::CompleteMatch => Ok(job),
        TokenCompareResult::PassportOnlyMatch => Err(QueueError::InvalidParameter {
            field: "auth_token",
            message: "authorization token is stale".to_string(),
        }),
        TokenCompareResult::NoMatch => Err(QueueError::InvalidParameter {
            field: "auth_token",
            message: "authorization token does not match the job".to_string(),
        }),
        TokenCompareResult::InvalidFormat => Err(QueueError::InvalidParameter {
            field: "auth_token",
            message: "malformed authorization token".to_string(),
        }),
    }
}

fn expect_status(job: &Job, expected: JobStatus) -> Result<()> {
    if job.status != expected {
        return Err(QueueError::InvalidParameter {
            field: "job_key",
            message: format!(
                "job {} is in state {}, expected {}",
                job.id, job.status, expected
            ),
        });
    }
    Ok(())
}
