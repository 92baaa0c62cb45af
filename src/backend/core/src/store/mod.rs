//! Job record storage.
//!
//! Pure data access for job records: keyed reads, compare-and-set writes
//! guarded by the record's `version`, an `owner_id` index, and the aggregate
//! queries behind queue statistics and health counters.
//!
//! Two backends are provided:
//!
//! - [`InMemoryJobStore`]: dashmap-backed, for tests and single-process use
//! - [`PostgresJobStore`]: sqlx/PostgreSQL, for durable deployments

mod memory;
mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ErrorCode, Result};
use crate::jobs::{Job, JobId, JobPriority, JobStatus};

/// Attempts made by [`modify_job`] before giving up on a contended record.
const MAX_CAS_ATTEMPTS: usize = 8;

// ═══════════════════════════════════════════════════════════════════════════════
// Aggregates
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-priority queue figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityStats {
    /// Jobs in PENDING, QUEUED, RUNNING or RETRYING
    pub active: u64,
    /// Jobs in FAILED or TIMEOUT
    pub failed: u64,
    /// Mean seconds between start and completion over finished jobs
    pub avg_processing_time: f64,
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: u64,
    pub pending: u64,
    pub queued: u64,
    pub running: u64,
    pub retrying: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeout: u64,
    pub cancelled: u64,
}

impl JobCounts {
    pub fn from_status_counts(counts: &HashMap<JobStatus, u64>) -> Self {
        let get = |status: JobStatus| counts.get(&status).copied().unwrap_or(0);
        Self {
            total: counts.values().sum(),
            pending: get(JobStatus::Pending),
            queued: get(JobStatus::Queued),
            running: get(JobStatus::Running),
            retrying: get(JobStatus::Retrying),
            succeeded: get(JobStatus::Success),
            failed: get(JobStatus::Failed),
            timeout: get(JobStatus::Timeout),
            cancelled: get(JobStatus::Cancelled),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable keyed storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Backend name for logs and health reports.
    fn name(&self) -> &'static str;

    /// Insert a new record. The stored copy is returned with its version set.
    async fn insert(&self, job: &Job) -> Result<Job>;

    /// Read a record by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Replace the record if its stored version still equals `job.version`.
    ///
    /// Returns the stored copy with the incremented version, a
    /// `ConcurrentModification` error when the version moved, or
    /// `ResourceNotFound` when the record is gone.
    async fn compare_and_set(&self, job: &Job) -> Result<Job>;

    /// Records submitted by `owner_id`, newest first.
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>>;

    /// Non-terminal records, oldest first, at most `limit`.
    async fn list_active(&self, limit: usize) -> Result<Vec<Job>>;

    /// Number of records in each status.
    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>>;

    /// Queue figures for each priority that has records.
    async fn stats_by_priority(&self) -> Result<HashMap<JobPriority, PriorityStats>>;

    /// Delete records created before `cutoff`; only terminal ones when `terminal_only`.
    async fn delete_created_before(&self, cutoff: DateTime<Utc>, terminal_only: bool) -> Result<u64>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;
}

/// Read-modify-write a record under compare-and-set, retrying lost races.
///
/// `apply` receives the freshest copy and returns `Ok(true)` to write it,
/// `Ok(false)` to leave the record untouched. Returns the final record and
/// whether a write happened.
pub async fn modify_job<F>(store: &dyn JobStore, id: JobId, mut apply: F) -> Result<(Job, bool)>
where
    F: FnMut(&mut Job) -> Result<bool> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut job = store
            .get(id)
            .await?
            .ok_or_else(|| crate::error::TasklineError::job_not_found(id))?;

        if !apply(&mut job)? {
            return Ok((job, false));
        }

        match store.compare_and_set(&job).await {
            Ok(stored) => return Ok((stored, true)),
            Err(e) if e.code() == ErrorCode::ConcurrentModification && attempt < MAX_CAS_ATTEMPTS => {
                tracing::debug!(job_id = %id, attempt, "Lost compare-and-set race, re-reading");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobRequest;
    use std::sync::Arc;

    #[test]
    fn test_counts_from_status_map() {
        let mut map = HashMap::new();
        map.insert(JobStatus::Success, 3);
        map.insert(JobStatus::Failed, 2);
        map.insert(JobStatus::Pending, 1);

        let counts = JobCounts::from_status_counts(&map);
        assert_eq!(counts.total, 6);
        assert_eq!(counts.succeeded, 3);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.running, 0);
    }

    #[tokio::test]
    async fn test_modify_job_skips_write_when_unchanged() {
        let store = InMemoryJobStore::new();
        let job = store.insert(&Job::new(JobRequest::new("noop"), "normal")).await.unwrap();

        let (same, written) = modify_job(&store, job.id, |_| Ok(false)).await.unwrap();
        assert!(!written);
        assert_eq!(same.version, job.version);
    }

    #[tokio::test]
    async fn test_modify_job_survives_contention() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store.insert(&Job::new(JobRequest::new("noop"), "normal")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                modify_job(store.as_ref(), job.id, |j| {
                    j.tags.insert(format!("t{}", i));
                    Ok(true)
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.tags.len(), 4);
        assert_eq!(stored.version, job.version + 4);
    }
}
