//! Job worker: the broker-consuming side of dispatched execution.
//!
//! A worker pulls messages from its queues in the order configured (most
//! urgent first), runs each one through [`run_handler`] and publishes the
//! outcome back to the broker, where the orchestrator picks it up on its next
//! status query or reconciliation sweep.

use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{run_handler, ExecutionMode, JobContext, JobId, JobRegistry, PriorityRouter, RunOutcome, CANCELLED_MESSAGE};
use crate::broker::{offset, Broker, BrokerState, BrokerTaskInfo, TaskMessage};
use crate::cache::ComputationCache;
use crate::error::Result;

/// Configuration for the job worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long one fetch waits for a message before re-checking delayed tasks
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Worker name/identifier
    #[serde(default = "default_worker_name")]
    pub name: String,
    /// Queues to consume, earlier queues first
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
}

fn default_concurrency() -> usize { 4 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_worker_name() -> String { "taskline-worker".to_string() }
fn default_queues() -> Vec<String> {
    PriorityRouter::default().queues()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            name: default_worker_name(),
            queues: default_queues(),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total messages taken off a queue
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Failed, timed out or cancelled
    pub failed: Arc<AtomicU64>,
    /// Re-enqueued for another attempt
    pub retried: Arc<AtomicU64>,
    /// Revoked or expired before they started
    pub skipped: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Wait for the run loop to exit and in-flight jobs to drain.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Worker loop ended abnormally");
        }
    }
}

/// Job worker that consumes broker queues.
pub struct JobWorker {
    broker: Arc<dyn Broker>,
    registry: JobRegistry,
    cache: Option<Arc<ComputationCache>>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl JobWorker {
    pub fn new(broker: Arc<dyn Broker>, registry: JobRegistry, config: WorkerConfig) -> Self {
        Self {
            broker,
            registry,
            cache: None,
            config,
            stats: WorkerStats::new(),
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<ComputationCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Start the worker, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let worker = Arc::new(self);
        let task = tokio::spawn(worker.run(shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let config = &self.config;
        let semaphore = Arc::new(Semaphore::new(config.concurrency));

        tracing::info!(
            worker = %config.name,
            concurrency = config.concurrency,
            queues = ?config.queues,
            broker = self.broker.name(),
            "Job worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            if let Err(e) = self.broker.promote_due().await {
                tracing::warn!(worker = %config.name, error = %e, "Failed to promote delayed tasks");
            }

            let fetched = tokio::select! {
                fetched = self.broker.fetch(&config.queues, config.poll_interval) => fetched,
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            match fetched {
                Ok(Some(message)) => {
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.process(message).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker = %config.name, error = %e, "Failed to fetch from broker");
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval) => {}
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    }
                }
            }
        }

        tracing::info!(worker = %config.name, active = self.stats.active(), "Worker shutting down");

        let permits = u32::try_from(config.concurrency).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(config.shutdown_timeout, semaphore.acquire_many(permits)).await;
        if drained.is_err() {
            tracing::warn!(
                worker = %config.name,
                active = self.stats.active(),
                "Shutdown timeout elapsed with jobs still running"
            );
        }

        tracing::info!(worker = %config.name, processed = self.stats.processed(), "Worker stopped");
    }

    /// Fetch and process at most one message, waiting up to `wait`.
    ///
    /// Returns whether a message was taken.
    pub async fn run_once(&self, wait: Duration) -> Result<bool> {
        self.broker.promote_due().await?;
        match self.broker.fetch(&self.config.queues, wait).await? {
            Some(message) => {
                self.process(message).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, message: TaskMessage) {
        let job_id = message.job_id;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        match self.broker.revocation(job_id).await {
            Ok(Some(_)) => {
                tracing::info!(job_id = %job_id, job_name = %message.name, "Skipping revoked task");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not check revocation, running anyway"),
        }

        if message.is_expired(Utc::now()) {
            tracing::info!(job_id = %job_id, job_name = %message.name, "Discarding expired task");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            let info = BrokerTaskInfo::new(BrokerState::Revoked)
                .with_error("task expired before it started", None)
                .with_retries(message.retries)
                .with_completed_at(Some(Utc::now()));
            self.publish(job_id, info).await;
            return;
        }

        let handler = match self.registry.get(&message.name) {
            Some(handler) => handler,
            None => {
                tracing::error!(job_id = %job_id, job_name = %message.name, "No handler registered");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let info = BrokerTaskInfo::new(BrokerState::Failure)
                    .with_error(format!("no handler registered for job '{}'", message.name), None)
                    .with_retries(message.retries)
                    .with_completed_at(Some(Utc::now()));
                self.publish(job_id, info).await;
                self.count_finished(&info_status(BrokerState::Failure, false));
                return;
            }
        };

        let started_at = Utc::now();
        self.publish(
            job_id,
            BrokerTaskInfo::new(BrokerState::Started)
                .with_retries(message.retries)
                .with_started_at(Some(started_at)),
        )
        .await;

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let watcher = self.watch_revocation(job_id, token.clone());

        let ctx = JobContext::new(job_id, message.name.clone(), message.args.clone(), message.kwargs.clone())
            .with_attempt(message.retries)
            .with_mode(ExecutionMode::Broker)
            .with_cache(self.cache.clone());
        let report = run_handler(handler, ctx, message.time_limit(), token).await;

        watcher.abort();
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        histogram!("taskline_job_duration_seconds", "name" => message.name.clone())
            .record(report.elapsed.as_secs_f64());

        let base = |state: BrokerState| {
            BrokerTaskInfo::new(state)
                .with_retries(message.retries)
                .with_started_at(Some(started_at))
                .with_completed_at(Some(Utc::now()))
        };

        let info = match report.outcome {
            RunOutcome::Succeeded(value) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                base(BrokerState::Success).with_result(value)
            }
            RunOutcome::Failed(error) if error.retryable && message.retry_policy.allows(message.retries) => {
                match self.schedule_retry(&message).await {
                    Ok(delay) => {
                        tracing::info!(
                            job_id = %job_id,
                            attempt = message.retries + 1,
                            delay_secs = delay.as_secs(),
                            error = %error,
                            "Job failed, retry scheduled"
                        );
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        counter!("taskline_jobs_retried_total", "mode" => ExecutionMode::Broker.as_str()).increment(1);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Could not schedule retry");
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        base(BrokerState::Failure).with_error(error.message, error.trace)
                    }
                }
            }
            RunOutcome::Failed(error) => {
                tracing::warn!(job_id = %job_id, job_name = %message.name, error = %error, "Job failed");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                base(BrokerState::Failure).with_error(error.message, error.trace)
            }
            RunOutcome::TimedOut(limit) => {
                tracing::warn!(job_id = %job_id, limit_secs = limit.as_secs(), "Job exceeded its time limit");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                base(BrokerState::Failure)
                    .with_error(format!("job exceeded its {}s time limit", limit.as_secs()), None)
                    .with_timed_out(true)
            }
            RunOutcome::Cancelled => {
                tracing::info!(job_id = %job_id, "Job terminated by revoke");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                base(BrokerState::Revoked).with_error(CANCELLED_MESSAGE, None)
            }
        };

        let status = info_status(info.state.clone(), info.timed_out);
        self.publish(job_id, info).await;
        self.count_finished(&status);
    }

    /// Put the next attempt back on the broker, then report `RETRY`.
    ///
    /// The report goes last because enqueueing resets the task state to `PENDING`.
    async fn schedule_retry(&self, message: &TaskMessage) -> Result<Duration> {
        let delay = message.retry_policy.next_delay(message.retries);
        let attempt = message.retries + 1;

        let mut next = message.clone().with_retries(attempt).with_countdown(delay);
        if let Some(expires_at) = next.expires_at {
            next.expires_at = offset(expires_at, delay);
        }
        next.sent_at = Utc::now();
        self.broker.enqueue(next).await?;

        self.broker
            .report(
                message.job_id,
                BrokerTaskInfo::new(BrokerState::Retry).with_retries(attempt),
            )
            .await?;
        Ok(delay)
    }

    /// Poll for a forced revoke while the job runs and fire `token` when one lands.
    fn watch_revocation(&self, job_id: JobId, token: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let interval = self.config.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match broker.revocation(job_id).await {
                    Ok(Some(revocation)) if revocation.terminate => {
                        token.cancel();
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(job_id = %job_id, error = %e, "Revocation poll failed"),
                }
            }
        })
    }

    async fn publish(&self, job_id: JobId, info: BrokerTaskInfo) {
        if let Err(e) = self.broker.report(job_id, info).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to report task state");
        }
    }

    fn count_finished(&self, status: &str) {
        counter!(
            "taskline_jobs_finished_total",
            "status" => status.to_string(),
            "mode" => ExecutionMode::Broker.as_str()
        )
        .increment(1);
    }
}

fn info_status(state: BrokerState, timed_out: bool) -> String {
    state
        .normalize(timed_out)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| state.as_str().to_string())
}

/// Resolves when shutdown is requested or the handle is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::jobs::{BackoffStrategy, HandlerResult, JobError, JobStatus, RetryPolicy, TaskOutput};
    use serde_json::{json, Map};

    async fn answer(_ctx: JobContext) -> HandlerResult {
        Ok(TaskOutput::json(json!(42)))
    }

    async fn flaky(_ctx: JobContext) -> HandlerResult {
        Err(JobError::retryable("connection reset"))
    }

    async fn stuck(_ctx: JobContext) -> HandlerResult {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(TaskOutput::Unit)
    }

    fn worker(broker: Arc<InMemoryBroker>) -> JobWorker {
        let registry = JobRegistry::new();
        registry.register_fn("answer", answer);
        registry.register_fn("flaky", flaky);
        registry.register_fn("stuck", stuck);
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        JobWorker::new(broker, registry, config)
    }

    fn message(name: &str) -> TaskMessage {
        TaskMessage::new(JobId::new(), name, vec![], Map::new(), "normal")
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.queues, vec!["critical", "high", "normal", "low", "bulk"]);
    }

    #[tokio::test]
    async fn test_success_is_reported() {
        let broker = Arc::new(InMemoryBroker::new());
        let worker = worker(broker.clone());
        let msg = message("answer");
        let id = msg.job_id;
        broker.enqueue(msg).await.unwrap();

        assert!(worker.run_once(Duration::from_millis(50)).await.unwrap());

        let info = broker.query_status(id).await.unwrap().unwrap();
        assert_eq!(info.state, BrokerState::Success);
        assert_eq!(info.result, Some(json!(42)));
        assert!(info.started_at.is_some());
        assert_eq!(worker.stats().succeeded(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_requeued() {
        let broker = Arc::new(InMemoryBroker::new());
        let worker = worker(broker.clone());
        let msg = message("flaky").with_retry_policy(RetryPolicy::new(2, BackoffStrategy::fixed(0)));
        let id = msg.job_id;
        broker.enqueue(msg).await.unwrap();

        worker.run_once(Duration::from_millis(50)).await.unwrap();
        assert_eq!(broker.queue_len("normal"), 1);
        assert_eq!(broker.query_status(id).await.unwrap().unwrap().retries, 1);

        worker.run_once(Duration::from_millis(50)).await.unwrap();
        worker.run_once(Duration::from_millis(50)).await.unwrap();

        let info = broker.query_status(id).await.unwrap().unwrap();
        assert_eq!(info.state, BrokerState::Failure);
        assert_eq!(info.retries, 2);
        assert_eq!(broker.queue_len("normal"), 0);
        assert_eq!(worker.stats().retried(), 2);
    }

    #[tokio::test]
    async fn test_revoked_task_is_skipped() {
        let broker = Arc::new(InMemoryBroker::new());
        let worker = worker(broker.clone());
        let msg = message("answer");
        let id = msg.job_id;
        broker.enqueue(msg).await.unwrap();
        broker.revoke(id, false).await.unwrap();

        worker.run_once(Duration::from_millis(50)).await.unwrap();

        let info = broker.query_status(id).await.unwrap().unwrap();
        assert_eq!(info.state, BrokerState::Revoked);
        assert_eq!(worker.stats().skipped(), 1);
        assert_eq!(worker.stats().succeeded(), 0);
    }

    #[tokio::test]
    async fn test_time_limit_reports_timeout() {
        let broker = Arc::new(InMemoryBroker::new());
        let worker = worker(broker.clone());
        let msg = message("stuck").with_time_limit(Duration::ZERO);
        let id = msg.job_id;
        broker.enqueue(msg).await.unwrap();

        worker.run_once(Duration::from_millis(50)).await.unwrap();

        let info = broker.query_status(id).await.unwrap().unwrap();
        assert_eq!(info.state, BrokerState::Failure);
        assert!(info.timed_out);
        assert_eq!(info.normalized_status(), Some(JobStatus::Timeout));
    }

    #[tokio::test]
    async fn test_started_worker_drains_queue_and_stops() {
        let broker = Arc::new(InMemoryBroker::new());
        let handle = worker(broker.clone()).start();

        let msg = message("answer");
        let id = msg.job_id;
        broker.enqueue(msg).await.unwrap();

        let mut state = None;
        for _ in 0..100 {
            state = broker.query_status(id).await.unwrap().map(|i| i.state);
            if state == Some(BrokerState::Success) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, Some(BrokerState::Success));

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();
    }
}
