//! Computation cache tests.
//!
//! Tests cover:
//! - Handlers memoizing work through the job context
//! - Key determinism across field order
//! - Invalidation and expiry

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskline_core::broker::InMemoryBroker;
use taskline_core::cache::{CacheKey, ComputationCache};
use taskline_core::config::{CacheConfig, Config};
use taskline_core::jobs::{JobContext, JobError, JobRegistry, JobRequest, JobStatus, TaskOutput};
use taskline_core::store::InMemoryJobStore;
use taskline_core::Taskline;
use tokio_test::{assert_err, assert_ok};

fn cache() -> ComputationCache {
    ComputationCache::in_memory(&CacheConfig::default())
}

// ============================================================================
// Memoized Handlers
// ============================================================================

#[tokio::test]
async fn test_handler_computes_once_per_input() {
    let computations = Arc::new(AtomicUsize::new(0));
    let registry = JobRegistry::new();
    let counter = Arc::clone(&computations);
    registry.register_fn("square", move |ctx: JobContext| {
        let counter = Arc::clone(&counter);
        async move {
            let n: i64 = ctx.arg(0)?;
            let cache = ctx.cache().ok_or_else(|| JobError::fatal("no cache configured"))?;
            let squared = cache
                .get_or_compute("square", &json!({ "n": n }), None, || async {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, JobError>(n * n)
                })
                .await?;
            Ok(TaskOutput::json(squared))
        }
    });

    let mut config = Config::default();
    config.broker.always_inline = true;
    let broker = Arc::new(InMemoryBroker::new());
    let cache = Arc::new(cache());
    let service = Taskline::from_parts(config, Arc::new(InMemoryJobStore::new()), broker, cache.clone(), registry);

    for _ in 0..2 {
        let id = service
            .orchestrator()
            .submit(JobRequest::new("square").with_arg(12))
            .await
            .unwrap();
        let view = service.orchestrator().get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Success);
        assert_eq!(view.result, Some(json!(144)));
    }

    let id = service
        .orchestrator()
        .submit(JobRequest::new("square").with_arg(3))
        .await
        .unwrap();
    assert_eq!(service.orchestrator().get_status(id).await.unwrap().result, Some(json!(9)));

    assert_eq!(computations.load(Ordering::SeqCst), 2);
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.entries, 2);
}

#[tokio::test]
async fn test_failed_computation_is_not_cached() {
    let cache = cache();

    let first: Result<u32, String> = cache
        .get_or_compute("flaky", &1, None, || async { Err("boom".to_string()) })
        .await;
    assert!(first.is_err());

    let second: Result<u32, String> = cache.get_or_compute("flaky", &1, None, || async { Ok(5) }).await;
    assert_eq!(second.unwrap(), 5);
    assert_eq!(cache.get::<_, u32>("flaky", &1).await, Some(5));
}

// ============================================================================
// Keys
// ============================================================================

#[test]
fn test_key_ignores_field_order() {
    let a = CacheKey::for_inputs("report", &json!({"user": 1, "range": {"from": 0, "to": 9}})).unwrap();
    let b = CacheKey::for_inputs("report", &json!({"range": {"to": 9, "from": 0}, "user": 1})).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.digest().len(), 64);
    assert_eq!(a.render("taskline:cache:"), format!("taskline:cache:report:{}", a.digest()));
}

#[test]
fn test_key_depends_on_namespace_and_inputs() {
    let base = CacheKey::for_inputs("report", &json!([1, 2])).unwrap();
    assert_ne!(base, CacheKey::for_inputs("summary", &json!([1, 2])).unwrap());
    assert_ne!(base, CacheKey::for_inputs("report", &json!([2, 1])).unwrap());
    assert_err!(CacheKey::for_inputs("", &1));
    assert_err!(CacheKey::for_inputs("has space", &1));
}

// ============================================================================
// Invalidation and Expiry
// ============================================================================

#[tokio::test]
async fn test_invalidate_forces_recompute() {
    let cache = cache();
    assert_ok!(cache.set("totals", &"acct-1", &100u64, None).await);
    assert_eq!(cache.get::<_, u64>("totals", &"acct-1").await, Some(100));

    assert!(cache.invalidate("totals", &"acct-1").await.unwrap());
    assert!(!cache.invalidate("totals", &"acct-1").await.unwrap());
    assert_eq!(cache.get::<_, u64>("totals", &"acct-1").await, None);
}

#[tokio::test]
async fn test_expired_entries_are_missed_and_swept() {
    let cache = cache();
    cache
        .set("short", &1, &"value", Some(Duration::from_millis(10)))
        .await
        .unwrap();
    cache.set("long", &1, &"value", None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(cache.sweep().await.unwrap(), 1);
    assert_eq!(cache.get::<_, String>("short", &1).await, None);
    assert_eq!(cache.get::<_, String>("long", &1).await.as_deref(), Some("value"));
    assert_eq!(cache.stats().await.unwrap().entries, 1);
}
