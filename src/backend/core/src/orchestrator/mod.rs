//! Job Orchestrator - the public face of the queue.
//!
//! Validates submissions, records them, routes them to a priority queue and
//! dispatches them through the broker, falling back to in-process execution
//! when the broker is out of reach. Status queries merge broker-reported
//! state into the stored record; cancel and retry move the record through
//! its lifecycle under compare-and-set.

mod status;

pub use status::{apply_broker_info, JobStatusView, ReconcileReport};

use chrono::Utc;
use metrics::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::broker::{BrokerClient, TaskMessage};
use crate::config::{JobsConfig, MaintenanceConfig};
use crate::error::{Result, TasklineError};
use crate::jobs::{
    ExecutionMode, FallbackExecutor, Job, JobId, JobPriority, JobRequest, JobStatus, PriorityRouter, RetryPolicy,
    SubmitParams, MAX_DURATION_SECS,
};
use crate::store::{modify_job, JobStore, PriorityStats};

/// Active records examined per reconciliation sweep.
const RECONCILE_BATCH: usize = 500;

/// Coordinates submission, status, cancel and retry.
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    broker: Arc<BrokerClient>,
    executor: Arc<FallbackExecutor>,
    router: PriorityRouter,
    jobs: JobsConfig,
    retention: chrono::Duration,
    retain_active: bool,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<BrokerClient>,
        executor: Arc<FallbackExecutor>,
        jobs: JobsConfig,
    ) -> Self {
        let defaults = MaintenanceConfig::default();
        Self {
            router: PriorityRouter::new(Duration::from_secs(jobs.base_duration_secs)),
            store,
            broker,
            executor,
            jobs,
            retention: retention_from_hours(defaults.retention_hours),
            retain_active: defaults.retain_active,
        }
    }

    pub fn with_router(mut self, router: PriorityRouter) -> Self {
        self.router = router;
        self
    }

    /// Age and scope of `cleanup_expired`.
    pub fn with_retention(mut self, maintenance: &MaintenanceConfig) -> Self {
        self.retention = retention_from_hours(maintenance.retention_hours);
        self.retain_active = maintenance.retain_active;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    pub fn executor(&self) -> &Arc<FallbackExecutor> {
        &self.executor
    }

    pub fn router(&self) -> &PriorityRouter {
        &self.router
    }

    pub fn jobs_config(&self) -> &JobsConfig {
        &self.jobs
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Submit
    // ═══════════════════════════════════════════════════════════════════════════

    /// Submit an untyped request: priority by name, optional bounds.
    pub async fn submit_params(&self, params: SubmitParams) -> Result<JobId> {
        let request = params.into_request(&self.jobs)?;
        self.submit(request).await
    }

    /// Record and dispatch a job.
    ///
    /// Returns once the broker has accepted the job, or, on the fallback
    /// path, once the job has reached a terminal state. A validation failure
    /// creates no record. `TaskProcessingError` means neither path could run
    /// the job; the record is left `FAILED`.
    #[instrument(skip(self, request), fields(job_name = %request.name, priority = %request.priority))]
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        request.validate(&self.jobs)?;

        let queue = self.router.queue_for(request.priority);
        let job = self.store.insert(&Job::new(request, queue)).await?;
        tracing::info!(job_id = %job.id, queue = %job.queue, "Job recorded");

        let reason = match self.dispatch(&job, Duration::ZERO).await? {
            Dispatch::Queued => {
                self.count_submitted(&job, ExecutionMode::Broker);
                return Ok(job.id);
            }
            Dispatch::Fallback(reason) => reason,
        };

        self.count_submitted(&job, ExecutionMode::Inline);
        self.run_inline(&job, reason).await?;
        Ok(job.id)
    }

    /// Try the broker. `Queued` means the record now says so.
    async fn dispatch(&self, job: &Job, countdown: Duration) -> Result<Dispatch> {
        let availability = self.broker.availability().await;
        if !availability.use_broker() {
            return Ok(Dispatch::Fallback(availability.as_str()));
        }

        let message = TaskMessage::for_job(job)
            .with_expiry(job.timeout().saturating_add(countdown))
            .with_retry_policy(RetryPolicy::new(job.max_retries, self.jobs.backoff.clone()))
            .with_countdown(countdown);

        let token = match self.broker.enqueue(message).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Dispatch failed, falling back to inline execution");
                return Ok(Dispatch::Fallback("dispatch_failed"));
            }
        };

        let (queued, written) = modify_job(self.store.as_ref(), job.id, |current| {
            if !current.status.can_transition_to(JobStatus::Queued) {
                return Ok(false);
            }
            current.mark_queued(token.0.clone())?;
            Ok(true)
        })
        .await?;

        if written {
            tracing::info!(job_id = %job.id, queue = %queued.queue, token = %token, "Job dispatched to broker");
        } else {
            tracing::info!(job_id = %job.id, status = %queued.status, "Job moved on before it was marked queued");
        }
        Ok(Dispatch::Queued)
    }

    async fn run_inline(&self, job: &Job, reason: &'static str) -> Result<Job> {
        counter!("taskline_fallback_total", "reason" => reason).increment(1);
        tracing::info!(job_id = %job.id, reason, "Executing job inline");

        let current = self
            .store
            .get(job.id)
            .await?
            .ok_or_else(|| TasklineError::job_not_found(job.id))?;
        self.executor.execute(&current).await
    }

    fn count_submitted(&self, job: &Job, mode: ExecutionMode) {
        counter!(
            "taskline_jobs_submitted_total",
            "priority" => job.priority.as_str(),
            "mode" => mode.as_str()
        )
        .increment(1);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Status
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current status, merged with broker state for dispatched active jobs.
    #[instrument(skip(self))]
    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatusView> {
        let job = self.load(job_id).await?;
        let job = if job.execution_mode == Some(ExecutionMode::Broker) && !job.is_terminal() {
            self.sync_with_broker(job).await?
        } else {
            job
        };
        Ok(JobStatusView::from_job(&job, &self.router, Utc::now()))
    }

    /// Jobs submitted by `owner_id`, newest first, without broker queries.
    pub async fn list_jobs(&self, owner_id: &str) -> Result<Vec<JobStatusView>> {
        let now = Utc::now();
        let jobs = self.store.list_by_owner(owner_id).await?;
        Ok(jobs.iter().map(|job| JobStatusView::from_job(job, &self.router, now)).collect())
    }

    /// Pull broker state into `job`. Broker errors leave the record as it is.
    async fn sync_with_broker(&self, job: Job) -> Result<Job> {
        let info = match self.broker.query_status(job.id).await {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(job),
            Err(e) => {
                tracing::debug!(job_id = %job.id, error = %e, "Broker status unavailable, using stored record");
                return Ok(job);
            }
        };

        let (merged, written) = modify_job(self.store.as_ref(), job.id, |current| {
            apply_broker_info(current, &info)
        })
        .await?;

        if written {
            tracing::info!(job_id = %merged.id, status = %merged.status, "Applied broker state");
            if merged.is_terminal() {
                counter!(
                    "taskline_jobs_finished_total",
                    "status" => merged.status.as_str(),
                    "mode" => ExecutionMode::Broker.as_str()
                )
                .increment(1);
            }
        }
        Ok(merged)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Cancel / Retry
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cancel an active job. Returns `false` when it had already finished.
    ///
    /// The broker revoke is best-effort; the record becomes `CANCELLED`
    /// whether or not the revoke reached the broker.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: JobId, force: bool) -> Result<bool> {
        let job = self.load(job_id).await?;
        if job.is_terminal() {
            return Ok(false);
        }

        if job.execution_mode == Some(ExecutionMode::Broker) || job.dispatch_token.is_some() {
            if let Err(e) = self.broker.revoke(job_id, force).await {
                tracing::warn!(job_id = %job_id, error = %e, "Revoke failed, cancelling locally");
            }
        }
        if self.executor.cancel(job_id) {
            tracing::debug!(job_id = %job_id, "Signalled inline execution to stop");
        }

        let (_, written) = modify_job(self.store.as_ref(), job_id, |current| {
            if current.is_terminal() {
                return Ok(false);
            }
            current.mark_cancelled()?;
            Ok(true)
        })
        .await?;

        if written {
            tracing::info!(job_id = %job_id, force, "Job cancelled");
        }
        Ok(written)
    }

    /// Retry a failed job after `delay`.
    ///
    /// Returns `false`, changing nothing, unless the job is `FAILED` with
    /// retries left. The delay is a broker countdown when dispatched, or a
    /// local sleep before inline execution.
    #[instrument(skip(self))]
    pub async fn retry(&self, job_id: JobId, delay: Duration) -> Result<bool> {
        if delay.as_secs() > MAX_DURATION_SECS {
            return Err(TasklineError::validation(format!(
                "retry delay must be at most {} seconds",
                MAX_DURATION_SECS
            ))
            .with_context("field", "delay_seconds"));
        }

        let (job, written) = modify_job(self.store.as_ref(), job_id, |current| {
            if !current.can_retry() {
                return Ok(false);
            }
            current.mark_retrying()?;
            Ok(true)
        })
        .await?;

        if !written {
            tracing::info!(
                job_id = %job_id,
                status = %job.status,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                "Retry rejected"
            );
            return Ok(false);
        }

        tracing::info!(job_id = %job_id, attempt = job.retry_count, delay_secs = delay.as_secs(), "Retrying job");
        counter!("taskline_jobs_retried_total", "mode" => "explicit").increment(1);

        let redispatched = async {
            if let Dispatch::Fallback(reason) = self.dispatch(&job, delay).await? {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.run_inline(&job, reason).await?;
            }
            Ok::<_, TasklineError>(())
        }
        .await;

        if let Err(e) = redispatched {
            self.abandon_retry(job_id, &e).await;
            return Err(e);
        }
        Ok(true)
    }

    /// Best-effort return to `FAILED` for a retry that never got going.
    async fn abandon_retry(&self, job_id: JobId, cause: &TasklineError) {
        let result = modify_job(self.store.as_ref(), job_id, |current| {
            if current.status != JobStatus::Retrying {
                return Ok(false);
            }
            current.mark_failed(format!("retry could not be dispatched: {}", cause), None)?;
            Ok(true)
        })
        .await;

        match result {
            Ok((_, true)) => tracing::warn!(job_id = %job_id, error = %cause, "Retry abandoned, job left FAILED"),
            Ok((_, false)) => {}
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Could not record abandoned retry"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Statistics / Maintenance
    // ═══════════════════════════════════════════════════════════════════════════

    /// Active, failed and mean processing time per priority name.
    pub async fn get_queue_stats(&self) -> Result<BTreeMap<String, PriorityStats>> {
        let stats = self.store.stats_by_priority().await?;
        Ok(JobPriority::ALL
            .iter()
            .map(|priority| {
                (
                    priority.as_str().to_string(),
                    stats.get(priority).cloned().unwrap_or_default(),
                )
            })
            .collect())
    }

    /// Apply broker state to every active dispatched job.
    pub async fn reconcile_active(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if !self.broker.availability().await.use_broker() {
            report.skipped = true;
            return Ok(report);
        }

        let active = self.store.list_active(RECONCILE_BATCH).await?;
        for job in active.into_iter().filter(|j| j.execution_mode == Some(ExecutionMode::Broker)) {
            report.examined += 1;
            let info = match self.broker.query_status(job.id).await {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(e) => {
                    report.errors += 1;
                    tracing::debug!(job_id = %job.id, error = %e, "Broker query failed during reconcile");
                    continue;
                }
            };

            match modify_job(self.store.as_ref(), job.id, |current| apply_broker_info(current, &info)).await {
                Ok((_, true)) => report.updated += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to apply broker state");
                }
            }
        }

        if report.updated > 0 || report.errors > 0 {
            tracing::info!(
                examined = report.examined,
                updated = report.updated,
                errors = report.errors,
                "Reconciled active jobs"
            );
        }
        Ok(report)
    }

    /// Delete records older than the retention age.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.retention;
        let deleted = self.store.delete_created_before(cutoff, self.retain_active).await?;
        counter!("taskline_store_cleanup_deleted_total").increment(deleted);
        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, terminal_only = self.retain_active, "Deleted expired job records");
        }
        Ok(deleted)
    }

    async fn load(&self, job_id: JobId) -> Result<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| TasklineError::job_not_found(job_id))
    }
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("store", &self.store.name())
            .field("broker", &self.broker)
            .field("router", &self.router)
            .finish()
    }
}

enum Dispatch {
    Queued,
    Fallback(&'static str),
}

fn retention_from_hours(hours: u64) -> chrono::Duration {
    chrono::Duration::hours(i64::try_from(hours).unwrap_or(i64::MAX / 3_600_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerState, BrokerTaskInfo, InMemoryBroker};
    use crate::config::BrokerConfig;
    use crate::error::ErrorCode;
    use crate::jobs::JobRegistry;
    use crate::store::InMemoryJobStore;
    use serde_json::json;

    struct Fixture {
        orchestrator: JobOrchestrator,
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryJobStore>,
    }

    fn fixture(reachable: bool) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_reachable(reachable);
        let store = Arc::new(InMemoryJobStore::new());
        let client = Arc::new(BrokerClient::new(broker.clone(), &BrokerConfig::default()));
        let executor = Arc::new(FallbackExecutor::new(JobRegistry::with_builtins(), store.clone()));
        let orchestrator = JobOrchestrator::new(store.clone(), client, executor, JobsConfig::default());
        Fixture {
            orchestrator,
            broker,
            store,
        }
    }

    #[tokio::test]
    async fn test_submit_dispatches_when_reachable() {
        let f = fixture(true);
        let id = f
            .orchestrator
            .submit(JobRequest::new("noop").with_priority(JobPriority::High))
            .await
            .unwrap();

        let view = f.orchestrator.get_status(id).await.unwrap();
        assert!(matches!(view.status, JobStatus::Pending | JobStatus::Queued));
        assert_eq!(view.queue, "high");
        assert_eq!(view.execution_mode, Some(ExecutionMode::Broker));
        assert_eq!(f.broker.queue_len("high"), 1);
    }

    #[tokio::test]
    async fn test_submit_falls_back_when_unreachable() {
        let f = fixture(false);
        let id = f
            .orchestrator
            .submit(JobRequest::new("noop").with_priority(JobPriority::Low))
            .await
            .unwrap();

        let view = f.orchestrator.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Success);
        assert_eq!(view.execution_mode, Some(ExecutionMode::Inline));
        assert!(view.completed_at.unwrap() >= view.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_failure_falls_back() {
        let f = fixture(true);
        f.broker.set_fail_enqueue(true);
        let id = f.orchestrator.submit(JobRequest::new("noop")).await.unwrap();

        let view = f.orchestrator.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Success);
        assert_eq!(f.broker.enqueued_total(), 0);
    }

    #[tokio::test]
    async fn test_invalid_priority_creates_nothing() {
        let f = fixture(false);
        let err = f
            .orchestrator
            .submit_params(SubmitParams::new("noop", "urgent"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(err.user_message().contains("CRITICAL, HIGH, NORMAL, LOW, BULK"));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_status_merges_broker_state() {
        let f = fixture(true);
        let id = f.orchestrator.submit(JobRequest::new("noop")).await.unwrap();
        f.broker
            .report(id, BrokerTaskInfo::new(BrokerState::Success).with_result(json!({"a": 1})))
            .await
            .unwrap();

        let view = f.orchestrator.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Success);
        assert_eq!(view.result, Some(json!({"a": 1})));
        assert!(view.estimated_completion.is_none());

        let stored = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let f = fixture(true);
        let err = f.orchestrator.get_status(JobId::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceNotFound);
        assert_eq!(
            f.orchestrator.cancel(JobId::new(), false).await.unwrap_err().code(),
            ErrorCode::ResourceNotFound
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_job_revokes() {
        let f = fixture(true);
        let id = f.orchestrator.submit(JobRequest::new("noop")).await.unwrap();

        assert!(f.orchestrator.cancel(id, false).await.unwrap());
        assert!(f.broker.is_revoked(id).await.unwrap());

        let view = f.orchestrator.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert!(view.completed_at.is_some());

        assert!(!f.orchestrator.cancel(id, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_survives_revoke_failure() {
        let f = fixture(true);
        let id = f.orchestrator.submit(JobRequest::new("noop")).await.unwrap();
        f.broker.set_reachable(false);

        assert!(f.orchestrator.cancel(id, true).await.unwrap());
        assert_eq!(f.store.get(id).await.unwrap().unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_failed_job_inline() {
        let f = fixture(false);
        let id = f
            .orchestrator
            .submit(JobRequest::new("fail").with_max_retries(1))
            .await
            .unwrap();
        assert_eq!(f.orchestrator.get_status(id).await.unwrap().status, JobStatus::Failed);

        assert!(f.orchestrator.retry(id, Duration::ZERO).await.unwrap());
        let view = f.orchestrator.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.retry_count, 1);

        assert!(!f.orchestrator.retry(id, Duration::ZERO).await.unwrap());
        assert_eq!(f.orchestrator.get_status(id).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_redispatches_with_countdown() {
        let f = fixture(false);
        let id = f.orchestrator.submit(JobRequest::new("fail")).await.unwrap();
        f.broker.set_reachable(true);

        assert!(f.orchestrator.retry(id, Duration::from_secs(60)).await.unwrap());
        assert_eq!(f.broker.scheduled_len(), 1);

        let stored = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.execution_mode, Some(ExecutionMode::Broker));
    }

    #[tokio::test]
    async fn test_queue_stats_cover_every_priority() {
        let f = fixture(false);
        f.orchestrator.submit(JobRequest::new("fail")).await.unwrap();

        let stats = f.orchestrator.get_queue_stats().await.unwrap();
        assert_eq!(stats.len(), 5);
        assert_eq!(stats["NORMAL"].failed, 1);
        assert_eq!(stats["CRITICAL"], PriorityStats::default());
    }

    #[tokio::test]
    async fn test_reconcile_applies_worker_reports() {
        let f = fixture(true);
        let id = f.orchestrator.submit(JobRequest::new("noop")).await.unwrap();
        f.broker
            .report(id, BrokerTaskInfo::new(BrokerState::Started).with_started_at(Some(Utc::now())))
            .await
            .unwrap();

        let report = f.orchestrator.reconcile_active().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(f.store.get(id).await.unwrap().unwrap().status, JobStatus::Running);

        f.broker.set_reachable(false);
        assert!(f.orchestrator.reconcile_active().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let f = fixture(false);
        let id = f.orchestrator.submit(JobRequest::new("noop")).await.unwrap();
        let orchestrator = f.orchestrator.with_retention(&MaintenanceConfig {
            retention_hours: 0,
            ..Default::default()
        });

        assert_eq!(orchestrator.cleanup_expired().await.unwrap(), 1);
        assert!(f.store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_durations_are_rejected() {
        let f = fixture(true);
        let err = f
            .orchestrator
            .submit(JobRequest::new("noop").with_timeout(10_000_000_000_000))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(f.store.count_by_status().await.unwrap().values().sum::<u64>(), 0);

        let id = f
            .orchestrator
            .submit(JobRequest::new("noop").with_timeout(MAX_DURATION_SECS))
            .await
            .unwrap();
        assert_eq!(f.broker.queue_len("normal"), 1);

        let err = f.orchestrator.retry(id, Duration::MAX).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    /// Store whose writes of `QUEUED` records fail while `reject_queued` is set.
    struct QueuedWriteFailure {
        inner: InMemoryJobStore,
        reject_queued: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl JobStore for QueuedWriteFailure {
        fn name(&self) -> &'static str {
            "queued_write_failure"
        }

        async fn insert(&self, job: &Job) -> Result<Job> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>> {
            self.inner.get(id).await
        }

        async fn compare_and_set(&self, job: &Job) -> Result<Job> {
            if job.status == JobStatus::Queued && self.reject_queued.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(TasklineError::store("write rejected"));
            }
            self.inner.compare_and_set(job).await
        }

        async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>> {
            self.inner.list_by_owner(owner_id).await
        }

        async fn list_active(&self, limit: usize) -> Result<Vec<Job>> {
            self.inner.list_active(limit).await
        }

        async fn count_by_status(&self) -> Result<std::collections::HashMap<JobStatus, u64>> {
            self.inner.count_by_status().await
        }

        async fn stats_by_priority(&self) -> Result<std::collections::HashMap<JobPriority, PriorityStats>> {
            self.inner.stats_by_priority().await
        }

        async fn delete_created_before(&self, cutoff: chrono::DateTime<Utc>, terminal_only: bool) -> Result<u64> {
            self.inner.delete_created_before(cutoff, terminal_only).await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_retry_that_cannot_dispatch_returns_to_failed() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_reachable(false);
        let store = Arc::new(QueuedWriteFailure {
            inner: InMemoryJobStore::new(),
            reject_queued: std::sync::atomic::AtomicBool::new(false),
        });
        let client = Arc::new(BrokerClient::new(broker.clone(), &BrokerConfig::default()));
        let executor = Arc::new(FallbackExecutor::new(JobRegistry::with_builtins(), store.clone()));
        let orchestrator = JobOrchestrator::new(store.clone(), client, executor, JobsConfig::default());

        let id = orchestrator.submit(JobRequest::new("fail")).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Failed);

        broker.set_reachable(true);
        store.reject_queued.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(orchestrator.retry(id, Duration::ZERO).await.is_err());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert!(job.error_message.as_ref().unwrap().contains("retry could not be dispatched"));
        assert!(job.can_retry());
    }
}
