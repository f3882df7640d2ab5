//! Durable job storage on sled.
//!
//! Keyspace (lexicographic order is exploited for range scans):
//!
//! | prefix | value |
//! |---|---|
//! | `jobs:<id>` | serialized job |
//! | `jobs:pending:<created-ns>:<id>` | empty (time-ordered pending index) |
//! | `jobs:by_tool:<name>:<id>` | empty |
//! | `jobs:by_status:<status>:<id>` | empty |
//!
//! Every mutation runs in a single sled transaction so the indexes never
//! drift from the records: a job has exactly one `by_status` entry, and a
//! `pending` entry iff its status is pending.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sled::transaction::ConflictableTransactionError;
use uuid::Uuid;

use crate::error::StorageError;

use super::model::{Job, JobStatus};

const JOB_PREFIX: &str = "jobs:";
const PENDING_PREFIX: &str = "jobs:pending:";
const BY_TOOL_PREFIX: &str = "jobs:by_tool:";
const BY_STATUS_PREFIX: &str = "jobs:by_status:";

/// Filter for [`JobStorage::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tool_name: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Sled-backed job store.
pub struct JobStorage {
    tree: sled::Tree,
}

impl JobStorage {
    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree("jobs")?;
        Ok(Self { tree })
    }

    fn job_key(id: Uuid) -> String {
        format!("{JOB_PREFIX}{id}")
    }

    fn pending_key(created_at: DateTime<Utc>, id: Uuid) -> String {
        // Nanoseconds zero-padded to 20 digits: lexicographic == numeric.
        let nanos = created_at.timestamp_nanos_opt().unwrap_or(0).max(0);
        format!("{PENDING_PREFIX}{nanos:020}:{id}")
    }

    fn tool_key(tool_name: &str, id: Uuid) -> String {
        format!("{BY_TOOL_PREFIX}{tool_name}:{id}")
    }

    fn status_key(status: JobStatus, id: Uuid) -> String {
        format!("{BY_STATUS_PREFIX}{status}:{id}")
    }

    fn is_index_key(key: &str) -> bool {
        key.starts_with(PENDING_PREFIX)
            || key.starts_with(BY_TOOL_PREFIX)
            || key.starts_with(BY_STATUS_PREFIX)
    }

    /// Insert or update a job, maintaining all secondary indexes in the
    /// same transaction.
    pub fn save(&self, job: &Job) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(job).map_err(|e| StorageError::Write(e.to_string()))?;
        let job_key = Self::job_key(job.id);

        self.tree
            .transaction(move |tx| {
                // Remove the previous version's index entries.
                if let Some(old_bytes) = tx.get(job_key.as_bytes())? {
                    let old: Job = serde_json::from_slice(&old_bytes).map_err(|e| {
                        ConflictableTransactionError::Abort(StorageError::Corrupt {
                            key: job_key.clone(),
                            reason: e.to_string(),
                        })
                    })?;
                    tx.remove(Self::status_key(old.status, old.id).as_bytes())?;
                    if old.status == JobStatus::Pending {
                        tx.remove(Self::pending_key(old.created_at, old.id).as_bytes())?;
                    }
                    if let Some(tool) = &old.tool_name {
                        tx.remove(Self::tool_key(tool, old.id).as_bytes())?;
                    }
                }

                tx.insert(job_key.as_bytes(), bytes.clone())?;
                tx.insert(Self::status_key(job.status, job.id).as_bytes(), &[] as &[u8])?;
                if job.status == JobStatus::Pending {
                    tx.insert(Self::pending_key(job.created_at, job.id).as_bytes(), &[] as &[u8])?;
                }
                if let Some(tool) = &job.tool_name {
                    tx.insert(Self::tool_key(tool, job.id).as_bytes(), &[] as &[u8])?;
                }
                Ok(())
            })
            .map_err(Self::unwrap_tx_error)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        let Some(bytes) = self.tree.get(Self::job_key(id))? else {
            return Ok(None);
        };
        let job = serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            key: Self::job_key(id),
            reason: e.to_string(),
        })?;
        Ok(Some(job))
    }

    /// Delete a job and every index entry, in one transaction.
    pub fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        let job_key = Self::job_key(id);
        self.tree
            .transaction(move |tx| {
                if let Some(bytes) = tx.remove(job_key.as_bytes())? {
                    let job: Job = serde_json::from_slice(&bytes).map_err(|e| {
                        ConflictableTransactionError::Abort(StorageError::Corrupt {
                            key: job_key.clone(),
                            reason: e.to_string(),
                        })
                    })?;
                    tx.remove(Self::status_key(job.status, job.id).as_bytes())?;
                    if job.status == JobStatus::Pending {
                        tx.remove(Self::pending_key(job.created_at, job.id).as_bytes())?;
                    }
                    if let Some(tool) = &job.tool_name {
                        tx.remove(Self::tool_key(tool, job.id).as_bytes())?;
                    }
                }
                Ok(())
            })
            .map_err(Self::unwrap_tx_error)
    }

    /// List jobs. Status and tool filters use their indexes; the scan of
    /// the plain keyspace skips index keys. Creation-time filters are
    /// applied after the read.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let mut jobs = if let Some(status) = filter.status {
            self.hydrate_index(&format!("{BY_STATUS_PREFIX}{status}:"))?
        } else if let Some(tool) = &filter.tool_name {
            self.hydrate_index(&format!("{BY_TOOL_PREFIX}{tool}:"))?
        } else {
            let mut jobs = Vec::new();
            for entry in self.tree.scan_prefix(JOB_PREFIX) {
                let (key, bytes) = entry?;
                let key_str = String::from_utf8_lossy(&key);
                if Self::is_index_key(&key_str) {
                    continue;
                }
                let job = serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                    key: key_str.to_string(),
                    reason: e.to_string(),
                })?;
                jobs.push(job);
            }
            jobs
        };

        if let Some(before) = filter.created_before {
            jobs.retain(|j: &Job| j.created_at < before);
        }
        if let Some(after) = filter.created_after {
            jobs.retain(|j: &Job| j.created_at > after);
        }
        if let Some(tool) = &filter.tool_name
            && filter.status.is_some()
        {
            jobs.retain(|j| j.tool_name.as_deref() == Some(tool.as_str()));
        }

        jobs.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Pending jobs in FIFO order by creation time. Records that have
    /// moved on since their index entry was written are skipped.
    pub fn get_pending(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        let mut jobs = Vec::new();
        for entry in self.tree.scan_prefix(PENDING_PREFIX) {
            if jobs.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            let key_str = String::from_utf8_lossy(&key);
            let Some(id) = key_str.rsplit(':').next().and_then(|s| s.parse().ok()) else {
                tracing::warn!(key = %key_str, "skipping malformed pending index key");
                continue;
            };
            if let Some(job) = self.get(id)?
                && job.status == JobStatus::Pending
            {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Drop terminal jobs older than `max_age` (by completion time) or
    /// whose TTL has lapsed. Returns the number of deleted jobs.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize, StorageError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut deleted = 0;

        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for job in self.hydrate_index(&format!("{BY_STATUS_PREFIX}{status}:"))? {
                let too_old = job.completed_at.map(|t| t < cutoff).unwrap_or(false);
                if too_old || job.ttl_expired(now) {
                    self.delete(job.id)?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    pub fn counts(&self) -> Result<JobCounts, StorageError> {
        let mut counts = JobCounts::default();
        for entry in self.tree.scan_prefix(BY_STATUS_PREFIX) {
            let (key, _) = entry?;
            let key_str = String::from_utf8_lossy(&key);
            let status = key_str
                .strip_prefix(BY_STATUS_PREFIX)
                .and_then(|rest| rest.split(':').next())
                .and_then(|s| s.parse::<JobStatus>().ok());
            match status {
                Some(JobStatus::Pending) => counts.pending += 1,
                Some(JobStatus::Running) => counts.running += 1,
                Some(JobStatus::Completed) => counts.completed += 1,
                Some(JobStatus::Failed) => counts.failed += 1,
                Some(JobStatus::Cancelled) => counts.cancelled += 1,
                None => {}
            }
        }
        Ok(counts)
    }

    fn hydrate_index(&self, prefix: &str) -> Result<Vec<Job>, StorageError> {
        let mut jobs = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, _) = entry?;
            let key_str = String::from_utf8_lossy(&key);
            let Some(id) = key_str.rsplit(':').next().and_then(|s| s.parse().ok()) else {
                continue;
            };
            if let Some(job) = self.get(id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn unwrap_tx_error(
        err: sled::transaction::TransactionError<StorageError>,
    ) -> StorageError {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => e.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn raw_keys(&self) -> Vec<String> {
        self.tree
            .iter()
            .filter_map(|entry| entry.ok())
            .map(|(key, _)| String::from_utf8_lossy(&key).to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn open_storage() -> (tempfile::TempDir, JobStorage) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, JobStorage::new(&db).unwrap())
    }

    fn job_named(tool: &str) -> Job {
        Job::new(Some(tool.to_string()), None, Value::Null, None)
    }

    #[test]
    fn status_index_tracks_transitions() {
        let (_dir, storage) = open_storage();
        let mut job = job_named("weather.get_current");
        storage.save(&job).unwrap();

        let keys = storage.raw_keys();
        assert!(keys.iter().any(|k| k.starts_with("jobs:by_status:pending:")));
        assert!(keys.iter().any(|k| k.starts_with("jobs:pending:")));

        job.mark_running().unwrap();
        storage.save(&job).unwrap();

        let keys = storage.raw_keys();
        // Exactly one by_status entry, and the pending entry is gone.
        let status_entries: Vec<_> = keys
            .iter()
            .filter(|k| k.starts_with("jobs:by_status:"))
            .collect();
        assert_eq!(status_entries.len(), 1);
        assert!(status_entries[0].starts_with("jobs:by_status:running:"));
        assert!(!keys.iter().any(|k| k.starts_with("jobs:pending:")));
    }

    #[test]
    fn delete_removes_all_indexes() {
        let (_dir, storage) = open_storage();
        let job = job_named("weather.get_current");
        storage.save(&job).unwrap();
        storage.delete(job.id).unwrap();
        assert!(storage.raw_keys().is_empty());
        assert!(storage.get(job.id).unwrap().is_none());
    }

    #[test]
    fn pending_scan_is_fifo_by_creation() {
        let (_dir, storage) = open_storage();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut job = job_named("t.a");
            // Distinct, strictly increasing creation times.
            job.created_at = Utc::now() + chrono::Duration::milliseconds(i * 10);
            ids.push(job.id);
            storage.save(&job).unwrap();
        }

        let pending = storage.get_pending(10).unwrap();
        let got: Vec<Uuid> = pending.iter().map(|j| j.id).collect();
        assert_eq!(got, ids);
    }

    #[test]
    fn pending_scan_skips_moved_on_jobs() {
        let (_dir, storage) = open_storage();
        let mut a = job_named("t.a");
        let b = job_named("t.b");
        storage.save(&a).unwrap();
        storage.save(&b).unwrap();

        a.mark_running().unwrap();
        storage.save(&a).unwrap();

        let pending = storage.get_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[test]
    fn list_by_status_and_tool() {
        let (_dir, storage) = open_storage();
        let mut done = job_named("weather.get_current");
        storage.save(&done).unwrap();
        done.mark_running().unwrap();
        done.mark_completed(crate::executor::ExecutionResult::success(
            Value::Null,
            Duration::from_secs(1),
        ));
        storage.save(&done).unwrap();
        storage.save(&job_named("github.list_issues")).unwrap();

        let completed = storage
            .list(&JobFilter {
                status: Some(JobStatus::Completed),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);

        let by_tool = storage
            .list(&JobFilter {
                tool_name: Some("github.list_issues".to_string()),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(by_tool.len(), 1);

        let all = storage.list(&JobFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn cleanup_drops_old_and_expired() {
        let (_dir, storage) = open_storage();

        let mut old = job_named("t.old");
        storage.save(&old).unwrap();
        old.mark_running().unwrap();
        old.mark_failed("boom");
        old.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
        storage.save(&old).unwrap();

        let mut expired = job_named("t.ttl");
        expired.ttl = Some(1);
        expired.created_at = Utc::now() - chrono::Duration::hours(1);
        storage.save(&expired).unwrap();
        expired.mark_running().unwrap();
        expired.mark_completed(crate::executor::ExecutionResult::success(
            Value::Null,
            Duration::from_secs(1),
        ));
        storage.save(&expired).unwrap();

        let mut fresh = job_named("t.fresh");
        storage.save(&fresh).unwrap();
        fresh.mark_running().unwrap();
        fresh.mark_completed(crate::executor::ExecutionResult::success(
            Value::Null,
            Duration::from_secs(1),
        ));
        storage.save(&fresh).unwrap();

        let deleted = storage.cleanup(Duration::from_secs(24 * 3600)).unwrap();
        assert_eq!(deleted, 2);
        assert!(storage.get(fresh.id).unwrap().is_some());
        assert!(storage.get(old.id).unwrap().is_none());
        assert!(storage.get(expired.id).unwrap().is_none());
    }

    #[test]
    fn counts_by_status() {
        let (_dir, storage) = open_storage();
        storage.save(&job_named("t.a")).unwrap();
        storage.save(&job_named("t.b")).unwrap();
        let counts = storage.counts().unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.completed, 0);
    }
}
