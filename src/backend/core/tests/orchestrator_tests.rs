//! End-to-end tests for the job orchestrator.
//!
//! Tests cover:
//! - Broker dispatch and worker execution
//! - Inline fallback when the broker is unreachable or overridden
//! - Cancelling a job while it runs inline
//! - Owner listing, queue statistics and health counters

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use taskline_core::broker::InMemoryBroker;
use taskline_core::cache::ComputationCache;
use taskline_core::config::Config;
use taskline_core::error::ErrorCode;
use taskline_core::jobs::{ExecutionMode, JobPriority, JobRegistry, JobRequest, JobStatus, SubmitParams};
use taskline_core::store::InMemoryJobStore;
use taskline_core::Taskline;

struct Harness {
    service: Taskline,
    broker: Arc<InMemoryBroker>,
}

fn harness(config: Config, reachable: bool) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    broker.set_reachable(reachable);
    let cache = Arc::new(ComputationCache::in_memory(&config.cache));
    let service = Taskline::from_parts(
        config,
        Arc::new(InMemoryJobStore::new()),
        broker.clone(),
        cache,
        JobRegistry::with_builtins(),
    );
    Harness { service, broker }
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_dispatched_job_completes_through_worker() {
    let h = harness(Config::default(), true);
    let orchestrator = h.service.orchestrator();

    let id = orchestrator
        .submit(
            JobRequest::new("echo")
                .with_arg(7)
                .with_kwarg("label", "x")
                .with_priority(JobPriority::Critical),
        )
        .await
        .unwrap();

    let queued = orchestrator.get_status(id).await.unwrap();
    assert_eq!(queued.queue, "critical");
    assert_eq!(queued.execution_mode, Some(ExecutionMode::Broker));
    assert!(queued.estimated_completion.is_some());
    assert_eq!(h.broker.queue_len("critical"), 1);

    assert!(h.service.worker().run_once(Duration::from_millis(50)).await.unwrap());

    let done = orchestrator.get_status(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.result, Some(json!({"args": [7], "kwargs": {"label": "x"}})));
    assert!(done.completed_at.unwrap() >= done.started_at.unwrap());
    assert!(done.estimated_completion.is_none());
}

#[tokio::test]
async fn test_unreachable_broker_runs_inline() {
    let h = harness(Config::default(), false);

    let id = h
        .service
        .orchestrator()
        .submit(JobRequest::new("echo").with_arg("hi"))
        .await
        .unwrap();

    let view = h.service.orchestrator().get_status(id).await.unwrap();
    assert_eq!(view.status, JobStatus::Success);
    assert_eq!(view.execution_mode, Some(ExecutionMode::Inline));
    assert_eq!(h.broker.enqueued_total(), 0);
}

#[tokio::test]
async fn test_always_inline_skips_reachable_broker() {
    let mut config = Config::default();
    config.broker.always_inline = true;
    let h = harness(config, true);

    let id = h.service.orchestrator().submit(JobRequest::new("noop")).await.unwrap();

    let view = h.service.orchestrator().get_status(id).await.unwrap();
    assert_eq!(view.status, JobStatus::Success);
    assert_eq!(view.execution_mode, Some(ExecutionMode::Inline));
    assert_eq!(h.broker.enqueued_total(), 0);
}

#[tokio::test]
async fn test_failed_inline_job_keeps_error() {
    let h = harness(Config::default(), false);

    let id = h
        .service
        .orchestrator()
        .submit(JobRequest::new("fail").with_kwarg("message", "disk full"))
        .await
        .unwrap();

    let view = h.service.orchestrator().get_status(id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error_message.unwrap().contains("disk full"));
    assert!(view.result.is_none());
}

#[tokio::test]
async fn test_unknown_handler_fails_inline() {
    let h = harness(Config::default(), false);

    let err = h
        .service
        .orchestrator()
        .submit(JobRequest::new("no_such_handler").with_owner("ops"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TaskProcessingError);

    let jobs = h.service.orchestrator().list_jobs("ops").await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_boundary_params_are_validated() {
    let h = harness(Config::default(), true);
    let orchestrator = h.service.orchestrator();

    let bad_timeout = SubmitParams {
        timeout_seconds: Some(0),
        ..SubmitParams::new("noop", "HIGH")
    };
    assert_eq!(
        orchestrator.submit_params(bad_timeout).await.unwrap_err().code(),
        ErrorCode::ValidationError
    );

    let bad_retries = SubmitParams {
        max_retries: Some(-1),
        ..SubmitParams::new("noop", "HIGH")
    };
    assert_eq!(
        orchestrator.submit_params(bad_retries).await.unwrap_err().code(),
        ErrorCode::ValidationError
    );

    let id = orchestrator
        .submit_params(SubmitParams::new("noop", "bulk"))
        .await
        .unwrap();
    assert_eq!(orchestrator.get_status(id).await.unwrap().queue, "bulk");
    assert_eq!(h.service.health_snapshot().await.counts.total, 1);
}

// ============================================================================
// Cancel
// ============================================================================

#[tokio::test]
async fn test_cancel_running_inline_job() {
    let h = harness(Config::default(), false);
    let service = Arc::new(h.service);

    let submitter = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .orchestrator()
                .submit(JobRequest::new("sleep").with_kwarg("seconds", 30.0).with_owner("alice"))
                .await
        })
    };

    let mut running = None;
    for _ in 0..200 {
        let jobs = service.orchestrator().list_jobs("alice").await.unwrap();
        if let Some(job) = jobs.into_iter().find(|j| j.status == JobStatus::Running) {
            running = Some(job.id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let id = running.expect("job should start running inline");

    assert!(service.orchestrator().cancel(id, true).await.unwrap());

    let submitted = tokio::time::timeout(Duration::from_secs(5), submitter)
        .await
        .expect("inline run should stop after cancel")
        .unwrap();
    assert_eq!(submitted.unwrap(), id);

    let view = service.orchestrator().get_status(id).await.unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.result.is_none());
}

// ============================================================================
// Statistics
// ============================================================================

#[tokio::test]
async fn test_queue_stats_and_health_counts() {
    let h = harness(Config::default(), false);
    let orchestrator = h.service.orchestrator();

    orchestrator
        .submit(JobRequest::new("noop").with_priority(JobPriority::High))
        .await
        .unwrap();
    orchestrator
        .submit(JobRequest::new("fail").with_priority(JobPriority::High))
        .await
        .unwrap();
    orchestrator
        .submit(JobRequest::new("fail").with_priority(JobPriority::Bulk))
        .await
        .unwrap();

    let stats = orchestrator.get_queue_stats().await.unwrap();
    assert_eq!(
        stats.keys().cloned().collect::<Vec<_>>(),
        vec!["BULK", "CRITICAL", "HIGH", "LOW", "NORMAL"]
    );
    assert_eq!(stats["HIGH"].failed, 1);
    assert_eq!(stats["HIGH"].active, 0);
    assert_eq!(stats["BULK"].failed, 1);

    let snapshot = h.service.health_snapshot().await;
    assert!(!snapshot.broker_available);
    assert_eq!(snapshot.execution_mode, ExecutionMode::Inline);
    assert_eq!(snapshot.counts.total, 3);
    assert_eq!(snapshot.counts.succeeded, 1);
    assert_eq!(snapshot.counts.failed, 2);
}

// ============================================================================
// Finished Jobs and Repeated Reads
// ============================================================================

#[tokio::test]
async fn test_cancel_leaves_finished_jobs_untouched() {
    let h = harness(Config::default(), false);
    let orchestrator = h.service.orchestrator();

    let succeeded = orchestrator.submit(JobRequest::new("noop")).await.unwrap();
    let failed = orchestrator
        .submit(JobRequest::new("fail").with_kwarg("message", "bad input"))
        .await
        .unwrap();

    for (id, status) in [(succeeded, JobStatus::Success), (failed, JobStatus::Failed)] {
        let before = orchestrator.get_status(id).await.unwrap();
        assert_eq!(before.status, status);
        assert!(before.completed_at.is_some());

        for force in [false, true] {
            assert!(!orchestrator.cancel(id, force).await.unwrap());
        }

        let after = orchestrator.get_status(id).await.unwrap();
        assert_eq!(after.status, status);
        assert_eq!(after.completed_at, before.completed_at);
        assert_eq!(after.error_message, before.error_message);
    }
}

fn status_bytes(mut view: taskline_core::orchestrator::JobStatusView) -> Vec<u8> {
    view.estimated_completion = None;
    serde_json::to_vec(&view).unwrap()
}

#[tokio::test]
async fn test_repeated_status_reads_are_identical() {
    let dispatched = harness(Config::default(), true);
    let queued = dispatched
        .service
        .orchestrator()
        .submit(JobRequest::new("echo").with_arg(1).with_tag("batch"))
        .await
        .unwrap();

    let inline = harness(Config::default(), false);
    let finished = inline
        .service
        .orchestrator()
        .submit(JobRequest::new("echo").with_arg(2).with_owner("owner-1"))
        .await
        .unwrap();

    for (h, id) in [(&dispatched, queued), (&inline, finished)] {
        let first = h.service.orchestrator().get_status(id).await.unwrap();
        let second = h.service.orchestrator().get_status(id).await.unwrap();
        assert_eq!(status_bytes(first), status_bytes(second));
    }
}
