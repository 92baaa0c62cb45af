//! Fallback executor: in-process execution for jobs the broker cannot take.
//!
//! The caller awaits the whole run. The handler itself runs on a spawned task
//! bounded by the job's `timeout_seconds` (see [`run_handler`]); deadline
//! expiry ends the job `TIMEOUT`, but code that blocks without yielding keeps
//! its thread until it returns.
//!
//! Every record write goes through compare-and-set. An outcome that arrives
//! after the job was cancelled is dropped.

use dashmap::DashMap;
use metrics::{counter, histogram};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{run_handler, ExecutionMode, Job, JobContext, JobId, JobRegistry, RunOutcome};
use crate::cache::ComputationCache;
use crate::error::{Result, TasklineError};
use crate::store::{modify_job, JobStore};

pub struct FallbackExecutor {
    registry: JobRegistry,
    store: Arc<dyn JobStore>,
    cache: Option<Arc<ComputationCache>>,
    running: Arc<DashMap<JobId, CancellationToken>>,
}

/// Removes a job from the running set when execution ends, however it ends.
struct RunningGuard {
    running: Arc<DashMap<JobId, CancellationToken>>,
    job_id: JobId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

impl FallbackExecutor {
    pub fn new(registry: JobRegistry, store: Arc<dyn JobStore>) -> Self {
        Self {
            registry,
            store,
            cache: None,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<ComputationCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Whether `job_id` is executing in this process right now.
    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running.contains_key(&job_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Signal an in-process run to stop. Returns `false` when `job_id` is not running here.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.running.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `job` to a terminal state and return the final record.
    ///
    /// Handler failures, panics and timeouts are recorded on the job and are
    /// not errors. An error is returned only when the job could not be run at
    /// all (no handler, or the store refused the writes); the record is left
    /// `FAILED` whenever the store still accepts writes.
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    pub async fn execute(&self, job: &Job) -> Result<Job> {
        let handler = match self.registry.get(&job.name) {
            Some(handler) => handler,
            None => {
                let error = TasklineError::handler_not_found(&job.name);
                let message = error.user_message().to_string();
                self.record_failure(job.id, &message).await;
                return Err(TasklineError::processing_failed(job.id, message));
            }
        };

        let token = CancellationToken::new();
        self.running.insert(job.id, token.clone());
        let _guard = RunningGuard {
            running: Arc::clone(&self.running),
            job_id: job.id,
        };

        let (started, written) = modify_job(self.store.as_ref(), job.id, |current| {
            if current.is_terminal() {
                return Ok(false);
            }
            current.mark_running()?;
            current.execution_mode = Some(ExecutionMode::Inline);
            current.dispatch_token = None;
            Ok(true)
        })
        .await
        .map_err(|e| {
            e.log();
            TasklineError::processing_failed(job.id, format!("could not mark job running: {}", e))
        })?;

        if !written {
            tracing::info!(status = %started.status, "Job finished before inline execution began");
            return Ok(started);
        }

        tracing::info!(timeout_secs = started.timeout_seconds, "Running job inline");
        let ctx = JobContext::for_job(&started, ExecutionMode::Inline).with_cache(self.cache.clone());
        let report = run_handler(handler, ctx, started.timeout(), token).await;

        histogram!("taskline_job_duration_seconds", "name" => started.name.clone())
            .record(report.elapsed.as_secs_f64());

        let outcome = report.outcome;
        let (finished, written) = modify_job(self.store.as_ref(), job.id, |current| {
            if current.is_terminal() {
                return Ok(false);
            }
            match &outcome {
                RunOutcome::Succeeded(value) => current.mark_succeeded(value.clone())?,
                RunOutcome::Failed(error) => current.mark_failed(error.message.clone(), error.trace.clone())?,
                RunOutcome::TimedOut(limit) => {
                    current.mark_timed_out(format!("job exceeded its {}s time limit", limit.as_secs()))?
                }
                RunOutcome::Cancelled => current.mark_cancelled()?,
            }
            Ok(true)
        })
        .await
        .map_err(|e| {
            e.log();
            TasklineError::processing_failed(job.id, format!("could not record outcome: {}", e))
        })?;

        if written {
            counter!(
                "taskline_jobs_finished_total",
                "status" => finished.status.as_str(),
                "mode" => ExecutionMode::Inline.as_str()
            )
            .increment(1);
            match &outcome {
                RunOutcome::Failed(error) => tracing::warn!(
                    error = %error,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Inline job failed"
                ),
                _ => tracing::info!(
                    status = %finished.status,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Inline job finished"
                ),
            }
        } else {
            tracing::info!(
                status = %finished.status,
                outcome = outcome.label(),
                "Dropped inline outcome for a job that already finished"
            );
        }

        Ok(finished)
    }

    /// Best-effort `FAILED` write for a job that could not be started.
    async fn record_failure(&self, job_id: JobId, message: &str) {
        let result = modify_job(self.store.as_ref(), job_id, |current| {
            if !current.status.can_transition_to(super::JobStatus::Failed) {
                return Ok(false);
            }
            current.mark_failed(message, None)?;
            current.execution_mode = Some(ExecutionMode::Inline);
            Ok(true)
        })
        .await;

        match result {
            Ok((_, true)) => {
                counter!(
                    "taskline_jobs_finished_total",
                    "status" => "FAILED",
                    "mode" => ExecutionMode::Inline.as_str()
                )
                .increment(1);
            }
            Ok((_, false)) => {}
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Could not record job failure"),
        }
    }
}

impl std::fmt::Debug for FallbackExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackExecutor")
            .field("store", &self.store.name())
            .field("running", &self.running.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::{HandlerResult, JobError, JobRequest, JobStatus, TaskOutput};
    use crate::store::InMemoryJobStore;
    use serde_json::json;
    use std::time::Duration;

    async fn returns_map(_ctx: JobContext) -> HandlerResult {
        Ok(TaskOutput::json(json!({"a": 1})))
    }

    async fn bad_input(_ctx: JobContext) -> HandlerResult {
        Err(JobError::fatal("ValueError: bad input"))
    }

    async fn slow(_ctx: JobContext) -> HandlerResult {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(TaskOutput::Unit)
    }

    fn setup() -> (FallbackExecutor, Arc<InMemoryJobStore>) {
        let registry = JobRegistry::new();
        registry.register_fn("map", returns_map);
        registry.register_fn("bad", bad_input);
        registry.register_fn("slow", slow);
        let store = Arc::new(InMemoryJobStore::new());
        (FallbackExecutor::new(registry, store.clone()), store)
    }

    async fn pending(store: &InMemoryJobStore, request: JobRequest) -> Job {
        store.insert(&Job::new(request, "normal")).await.unwrap()
    }

    #[tokio::test]
    async fn test_success_records_result() {
        let (executor, store) = setup();
        let job = pending(&store, JobRequest::new("map")).await;

        let done = executor.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.result, Some(json!({"a": 1})));
        assert!(done.error_message.is_none());
        assert_eq!(done.execution_mode, Some(ExecutionMode::Inline));
        assert!(done.completed_at.unwrap() >= done.started_at.unwrap());
        assert!(!executor.is_running(job.id));
    }

    #[tokio::test]
    async fn test_failure_is_captured() {
        let (executor, store) = setup();
        let job = pending(&store, JobRequest::new("bad")).await;

        let done = executor.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error_message.unwrap().contains("bad input"));
        assert!(done.error_trace.is_some());
        assert!(done.result.is_none());
    }

    #[tokio::test]
    async fn test_deadline_yields_timeout() {
        let (executor, store) = setup();
        let mut job = Job::new(JobRequest::new("slow"), "normal");
        job.timeout_seconds = 0;
        let job = store.insert(&job).await.unwrap();

        let done = executor.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Timeout);
        assert!(done.error_message.is_some());
    }

    #[tokio::test]
    async fn test_missing_handler_records_failure() {
        let (executor, store) = setup();
        let job = pending(&store, JobRequest::new("nope")).await;

        let err = executor.execute(&job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TaskProcessingError);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_cancel_stops_inline_run() {
        let (executor, store) = setup();
        let executor = Arc::new(executor);
        let job = pending(&store, JobRequest::new("slow")).await;

        let runner = executor.clone();
        let running_job = job.clone();
        let handle = tokio::spawn(async move { runner.execute(&running_job).await });

        for _ in 0..100 {
            if executor.is_running(job.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(executor.cancel(job.id));

        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(done.error_message.as_deref(), Some(crate::jobs::CANCELLED_MESSAGE));
    }
}
