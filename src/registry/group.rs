use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::dump::{read_record, write_record, DumpContext};
use crate::error::{QueueError, Result};
use crate::job::print::escape_printable;

/// One group: its token and the set of member job ids.
///
/// The token string is allocated once and shared with the name-to-id map,
/// so both lookup directions point at the same bytes.
#[derive(Debug)]
struct GroupEntry {
    token: Arc<str>,
    jobs: RoaringBitmap,
}

#[derive(Debug, Default)]
struct GroupData {
    by_id: HashMap<u32, GroupEntry>,
    by_token: HashMap<Arc<str>, u32>,
    /// Group ids whose job set went empty. Kept until garbage collection
    /// re-checks them; never deleted in place while lookups may be live.
    remove_candidates: RoaringBitmap,
    last_id: u32,
}

impl GroupData {
    /// Allocate the next free group id. Id 0 is reserved for "no group";
    /// the counter skips it on wraparound and re-probes on collision.
    fn next_id(&mut self) -> u32 {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id == 0 {
                continue;
            }
            if !self.by_id.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    fn create(&mut self, token: &str) -> u32 {
        let id = self.next_id();
        let shared: Arc<str> = Arc::from(token);
        self.by_id.insert(
            id,
            GroupEntry {
                token: shared.clone(),
                jobs: RoaringBitmap::new(),
            },
        );
        self.by_token.insert(shared, id);
        id
    }
}

/// Bidirectional index: group token ⇄ integer id ⇄ bitmap of job ids.
///
/// One mutex guards the whole structure, counter included, so the
/// check-then-create sequence of `resolve` is atomic and the token⇄id
/// bijection holds under concurrent resolve/remove. Readers take the same
/// lock; every public snapshot is a copy.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    data: Mutex<GroupData>,
}

/// On-disk form: one record per group that still has jobs.
#[derive(Serialize, Deserialize)]
struct GroupDumpRecord {
    id: u32,
    token: String,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create a group by token. The empty token means "no group"
    /// and always resolves to the reserved id 0.
    pub fn resolve(&self, token: &str) -> u32 {
        if token.is_empty() {
            return 0;
        }
        let mut data = self.data.lock();
        if let Some(&id) = data.by_token.get(token) {
            return id;
        }
        let id = data.create(token);
        tracing::debug!(group_id = id, token, "Group created");
        id
    }

    /// Batch form of `resolve`; empty tokens are skipped, not an error.
    pub fn resolve_many(&self, tokens: &[String]) -> Vec<u32> {
        tokens
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| self.resolve(t))
            .collect()
    }

    /// Token for a known group id.
    pub fn token(&self, group_id: u32) -> Result<Arc<str>> {
        let data = self.data.lock();
        data.by_id
            .get(&group_id)
            .map(|entry| entry.token.clone())
            .ok_or_else(|| QueueError::GroupNotFound(group_id.to_string()))
    }

    /// Insert a job id into an existing group's bitmap. A numeric id that
    /// does not exist cannot be fabricated into a group, so it is an error.
    pub fn add_job(&self, group_id: u32, job_id: u32) -> Result<()> {
        let mut data = self.data.lock();
        let entry = data
            .by_id
            .get_mut(&group_id)
            .ok_or_else(|| QueueError::GroupNotFound(group_id.to_string()))?;
        entry.jobs.insert(job_id);
        data.remove_candidates.remove(group_id);
        Ok(())
    }

    /// Insert a job under a token, creating the group on demand. Returns
    /// the group id, 0 when the token is empty ("no group").
    pub fn add_job_by_token(&self, token: &str, job_id: u32) -> u32 {
        if token.is_empty() {
            return 0;
        }
        let mut data = self.data.lock();
        let id = match data.by_token.get(token) {
            Some(&id) => id,
            None => {
                let id = data.create(token);
                tracing::debug!(group_id = id, token, "Group created");
                id
            }
        };
        let entry = data.by_id.get_mut(&id).expect("entry exists for id");
        entry.jobs.insert(job_id);
        data.remove_candidates.remove(id);
        id
    }

    /// Bulk range insert `[first_job_id, first_job_id + count - 1]` for a
    /// batch submission. No-op returning 0 when any argument is zero.
    pub fn add_jobs(&self, group_id: u32, first_job_id: u32, count: u32) -> Result<u64> {
        if group_id == 0 || first_job_id == 0 || count == 0 {
            return Ok(0);
        }
        let mut data = self.data.lock();
        let entry = data
            .by_id
            .get_mut(&group_id)
            .ok_or_else(|| QueueError::GroupNotFound(group_id.to_string()))?;
        let last = first_job_id.saturating_add(count - 1);
        let inserted = entry.jobs.insert_range(first_job_id..=last);
        data.remove_candidates.remove(group_id);
        Ok(inserted)
    }

    /// Clear a job's bit. A group whose bitmap goes empty becomes a
    /// garbage-collection candidate immediately; the record itself stays
    /// until `collect_garbage` gets to it.
    pub fn remove_job(&self, group_id: u32, job_id: u32) -> Result<()> {
        let mut data = self.data.lock();
        let entry = data
            .by_id
            .get_mut(&group_id)
            .ok_or_else(|| QueueError::GroupNotFound(group_id.to_string()))?;
        entry.jobs.remove(job_id);
        if entry.jobs.is_empty() {
            data.remove_candidates.insert(group_id);
        }
        Ok(())
    }

    /// Snapshot of one group's job set. An unknown token raises
    /// `GroupNotFound` unless the caller opted out, in which case an empty
    /// bitmap is a valid answer (the group may simply have expired).
    pub fn jobs(&self, token: &str, allow_missing: bool) -> Result<RoaringBitmap> {
        let data = self.data.lock();
        match data.by_token.get(token) {
            Some(id) => Ok(data.by_id[id].jobs.clone()),
            None if allow_missing => Ok(RoaringBitmap::new()),
            None => Err(QueueError::GroupNotFound(token.to_string())),
        }
    }

    /// Snapshot union of several groups' job sets, by id.
    pub fn jobs_union(&self, group_ids: &[u32]) -> Result<RoaringBitmap> {
        let data = self.data.lock();
        let mut union = RoaringBitmap::new();
        for id in group_ids {
            let entry = data
                .by_id
                .get(id)
                .ok_or_else(|| QueueError::GroupNotFound(id.to_string()))?;
            union |= &entry.jobs;
        }
        Ok(union)
    }

    /// Process the remove-candidate set, deleting up to `max_to_delete`
    /// groups whose bitmap is still empty. Emptiness is re-checked here: a
    /// group that regained jobs since being marked survives. Returns how
    /// many groups were actually deleted.
    ///
    /// Meant to be called repeatedly from a background sweep; the bound
    /// keeps any single pass from holding the lock for long.
    pub fn collect_garbage(&self, max_to_delete: usize) -> usize {
        let mut data = self.data.lock();
        let candidates: Vec<u32> = data.remove_candidates.iter().collect();
        let mut deleted = 0;

        for group_id in candidates {
            if deleted >= max_to_delete {
                break;
            }
            data.remove_candidates.remove(group_id);
            let still_empty = data
                .by_id
                .get(&group_id)
                .map(|entry| entry.jobs.is_empty())
                .unwrap_or(false);
            if !still_empty {
                continue;
            }
            if let Some(entry) = data.by_id.remove(&group_id) {
                data.by_token.remove(&entry.token);
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::debug!(deleted, "Group registry garbage collected");
        }
        deleted
    }

    pub fn len(&self) -> usize {
        self.data.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().by_id.is_empty()
    }

    /// Persist `(id, token)` for every group that currently has jobs.
    pub fn dump(&self, ctx: &DumpContext) -> Result<()> {
        let file = File::create(ctx.groups_file())?;
        let mut writer = BufWriter::new(file);
        let data = self.data.lock();
        let mut dumped = 0;
        for (id, entry) in &data.by_id {
            if entry.jobs.is_empty() {
                continue;
            }
            write_record(
                &mut writer,
                &GroupDumpRecord {
                    id: *id,
                    token: entry.token.to_string(),
                },
            )?;
            dumped += 1;
        }
        writer.flush()?;
        tracing::info!(dumped, file = %ctx.groups_file().display(), "Group registry dumped");
        Ok(())
    }

    /// Load `(id, token)` pairs; every group starts with an empty bitmap.
    /// The caller replays job membership and then calls `finalize_loading`.
    /// A missing dump file means there is nothing to restore.
    pub fn load_from_dump(&self, ctx: &DumpContext) -> Result<usize> {
        let file = match File::open(ctx.groups_file()) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut data = self.data.lock();
        let mut loaded = 0;

        while let Some(record) = read_record::<GroupDumpRecord>(&mut reader)? {
            if record.id == 0 || record.token.is_empty() {
                return Err(QueueError::DumpFormat(
                    "group record with reserved id or empty token".to_string(),
                ));
            }
            let shared: Arc<str> = Arc::from(record.token.as_str());
            if data.by_id.contains_key(&record.id) || data.by_token.contains_key(&shared) {
                return Err(QueueError::DumpFormat(format!(
                    "duplicate group record: id {} token '{}'",
                    record.id, record.token
                )));
            }
            data.by_id.insert(
                record.id,
                GroupEntry {
                    token: shared.clone(),
                    jobs: RoaringBitmap::new(),
                },
            );
            data.by_token.insert(shared, record.id);
            loaded += 1;
        }

        tracing::info!(loaded, "Group registry loaded from dump");
        Ok(loaded)
    }

    /// One-time cleanup after a crash-recovery load: purge groups whose
    /// jobs all expired before the crash, and re-seed the id counter at the
    /// highest id seen. Returns the number of purged groups.
    pub fn finalize_loading(&self) -> usize {
        let mut data = self.data.lock();
        let empty_ids: Vec<u32> = data
            .by_id
            .iter()
            .filter(|(_, entry)| entry.jobs.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in &empty_ids {
            if let Some(entry) = data.by_id.remove(id) {
                data.by_token.remove(&entry.token);
            }
            data.remove_candidates.remove(*id);
        }
        data.last_id = data.by_id.keys().max().copied().unwrap_or(0);
        empty_ids.len()
    }

    /// Human-readable, line-oriented rendering. Groups are processed
    /// `batch_size` at a time so a huge registry never pins the lock for
    /// the whole walk.
    pub fn print(&self, batch_size: usize, verbose: bool) -> String {
        let batch_size = batch_size.max(1);
        let ids: Vec<u32> = {
            let data = self.data.lock();
            let mut ids: Vec<u32> = data.by_id.keys().copied().collect();
            ids.sort_unstable();
            ids
        };

        let mut out = String::new();
        for chunk in ids.chunks(batch_size) {
            let data = self.data.lock();
            for id in chunk {
                // A group may have been garbage collected between batches.
                let Some(entry) = data.by_id.get(id) else {
                    continue;
                };
                out.push_str(&format!(
                    "OK:GROUP: '{}'\n",
                    escape_printable(&entry.token)
                ));
                out.push_str(&format!("OK:  ID: {}\n", id));
                out.push_str(&format!("OK:  NUMBER OF JOBS: {}\n", entry.jobs.len()));
                if verbose {
                    let jobs: Vec<String> =
                        entry.jobs.iter().map(|j| j.to_string()).collect();
                    out.push_str(&format!("OK:  JOBS: {}\n", jobs.join(" ")));
                }
            }
        }
        out
    }
}
