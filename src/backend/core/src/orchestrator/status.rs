//! Status views and the broker → record merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::broker::BrokerTaskInfo;
use crate::error::Result;
use crate::jobs::{ExecutionMode, Job, JobId, JobPriority, JobStatus, PriorityRouter};

/// What `get_status` returns.
///
/// `estimated_completion` is a heuristic (`now + multiplier × base_duration`)
/// present only while the job is active. `queue_position` is always `None`:
/// the broker cannot report a real position cheaply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub name: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub queue: String,
    pub execution_mode: Option<ExecutionMode>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub owner_id: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<Value>,
    pub tags: BTreeSet<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub queue_position: Option<u64>,
}

impl JobStatusView {
    pub fn from_job(job: &Job, router: &PriorityRouter, now: DateTime<Utc>) -> Self {
        let estimated_completion = if job.is_terminal() {
            None
        } else {
            Some(router.estimate_completion(job.priority, now))
        };

        Self {
            id: job.id,
            name: job.name.clone(),
            priority: job.priority,
            status: job.status,
            queue: job.queue.clone(),
            execution_mode: job.execution_mode,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            owner_id: job.owner_id.clone(),
            error_message: job.error_message.clone(),
            result: job.result.clone(),
            tags: job.tags.clone(),
            estimated_completion,
            queue_position: None,
        }
    }
}

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Broker-mode active jobs looked at
    pub examined: usize,
    /// Records changed by broker state
    pub updated: usize,
    /// Broker queries that failed
    pub errors: usize,
    /// The sweep did not run because the broker is out of reach
    pub skipped: bool,
}

/// Fold broker-reported state into `job`.
///
/// Broker state wins for `status` and the outcome payload; the record keeps
/// `created_at`, `tags` and `owner_id`. Returns whether `job` changed. States
/// the lifecycle graph cannot reach from the current status are ignored, as
/// are unknown broker states.
pub fn apply_broker_info(job: &mut Job, info: &BrokerTaskInfo) -> Result<bool> {
    if job.is_terminal() {
        return Ok(false);
    }

    let target = match info.normalized_status() {
        Some(status) => status,
        None => {
            tracing::warn!(
                job_id = %job.id,
                broker_state = info.state.as_str(),
                "Unknown broker state, keeping local status"
            );
            return Ok(false);
        }
    };

    let adopted_retries = adopt_retry_count(job, info.retries);

    if target == job.status {
        if adopted_retries {
            job.updated_at = Utc::now();
        }
        return Ok(adopted_retries);
    }

    let had_started = job.started_at.is_some();

    // A retried attempt reports its outcome without a separate STARTED.
    if target.is_terminal()
        && !job.status.can_transition_to(target)
        && job.status.can_transition_to(JobStatus::Running)
        && JobStatus::Running.can_transition_to(target)
    {
        job.mark_running()?;
    }

    match target {
        JobStatus::Retrying => {
            if !job.status.can_transition_to(JobStatus::Retrying) {
                if !job.status.can_transition_to(JobStatus::Failed) {
                    return Ok(adopted_retries);
                }
                job.mark_failed(
                    info.error.clone().unwrap_or_else(|| "attempt failed".to_string()),
                    info.trace.clone(),
                )?;
            }
            job.transition(JobStatus::Retrying)?;
            job.result = None;
            job.error_message = None;
            job.error_trace = None;
            job.completed_at = None;
        }
        _ if !job.status.can_transition_to(target) => {
            tracing::debug!(
                job_id = %job.id,
                from = %job.status,
                to = %target,
                "Ignoring broker state not reachable from local status"
            );
            return Ok(adopted_retries);
        }
        JobStatus::Queued => job.transition(JobStatus::Queued)?,
        JobStatus::Running => job.mark_running()?,
        JobStatus::Success => job.mark_succeeded(info.result.clone().unwrap_or(Value::Null))?,
        JobStatus::Failed => job.mark_failed(
            info.error.clone().unwrap_or_else(|| "job failed in worker".to_string()),
            info.trace.clone(),
        )?,
        JobStatus::Timeout => job.mark_timed_out(
            info.error.clone().unwrap_or_else(|| "job exceeded its time limit".to_string()),
        )?,
        JobStatus::Cancelled => job.mark_cancelled()?,
        JobStatus::Pending => return Ok(adopted_retries),
    }

    if !had_started && job.started_at.is_some() {
        if let Some(started_at) = info.started_at {
            job.started_at = Some(started_at);
        }
    }
    if job.is_terminal() {
        if let Some(completed_at) = info.completed_at {
            let floor = job.started_at.unwrap_or(completed_at);
            job.completed_at = Some(completed_at.max(floor));
        }
    }

    Ok(true)
}

/// Take the broker's retry counter when it is ahead, capped at `max_retries`.
fn adopt_retry_count(job: &mut Job, broker_retries: u32) -> bool {
    let adopted = broker_retries.min(job.max_retries);
    if adopted > job.retry_count {
        job.retry_count = adopted;
        true
    } else {
        false
    }
}
