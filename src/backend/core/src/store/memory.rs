//! In-memory job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};

use super::{JobStore, PriorityStats};
use crate::error::{Result, TasklineError};
use crate::jobs::{Job, JobId, JobPriority, JobStatus};

/// dashmap-backed store with an owner index.
///
/// Compare-and-set holds the entry's shard lock across the version check and
/// the write, so concurrent writers to one record serialize.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    by_owner: DashMap<String, HashSet<JobId>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn unindex(&self, job: &Job) {
        if let Some(owner) = &job.owner_id {
            if let Some(mut ids) = self.by_owner.get_mut(owner) {
                ids.remove(&job.id);
            }
            self.by_owner.remove_if(owner, |_, ids| ids.is_empty());
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, job: &Job) -> Result<Job> {
        let mut stored = job.clone();
        stored.version = 1;

        match self.jobs.entry(job.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TasklineError::store(format!("job {} already exists", job.id)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(stored.clone());
            }
        }

        if let Some(owner) = &stored.owner_id {
            self.by_owner.entry(owner.clone()).or_default().insert(stored.id);
        }
        Ok(stored)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|j| j.value().clone()))
    }

    async fn compare_and_set(&self, job: &Job) -> Result<Job> {
        let mut entry = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| TasklineError::job_not_found(job.id))?;

        if entry.version != job.version {
            return Err(TasklineError::concurrent_modification(job.id, job.version));
        }

        let mut stored = job.clone();
        stored.version = job.version + 1;
        *entry = stored.clone();
        Ok(stored)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>> {
        let ids: Vec<JobId> = self
            .by_owner
            .get(owner_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let mut jobs: Vec<Job> = ids
            .into_iter()
            .filter_map(|id| self.jobs.get(&id).map(|j| j.value().clone()))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_active(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.status.is_active())
            .map(|j| j.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let mut counts = HashMap::new();
        for job in self.jobs.iter() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn stats_by_priority(&self) -> Result<HashMap<JobPriority, PriorityStats>> {
        let mut stats: HashMap<JobPriority, PriorityStats> = HashMap::new();
        let mut durations: HashMap<JobPriority, (f64, u64)> = HashMap::new();

        for job in self.jobs.iter() {
            let entry = stats.entry(job.priority).or_default();
            match job.status {
                JobStatus::Pending | JobStatus::Queued | JobStatus::Running | JobStatus::Retrying => {
                    entry.active += 1
                }
                JobStatus::Failed | JobStatus::Timeout => entry.failed += 1,
                JobStatus::Success | JobStatus::Cancelled => {}
            }
            if let Some(duration) = job.duration() {
                let (sum, n) = durations.entry(job.priority).or_insert((0.0, 0));
                *sum += duration.num_milliseconds() as f64 / 1000.0;
                *n += 1;
            }
        }

        for (priority, (sum, n)) in durations {
            if let Some(entry) = stats.get_mut(&priority) {
                entry.avg_processing_time = if n > 0 { sum / n as f64 } else { 0.0 };
            }
        }
        Ok(stats)
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>, terminal_only: bool) -> Result<u64> {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| j.created_at < cutoff && (!terminal_only || j.is_terminal()))
            .map(|j| j.id)
            .collect();

        let mut deleted = 0;
        for id in expired {
            if let Some((_, job)) = self.jobs.remove(&id) {
                self.unindex(&job);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
