//! Routing, keying and submission benchmarks. Run with: cargo bench --bench router_bench

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;

use taskline_core::cache::CacheKey;
use taskline_core::config::Config;
use taskline_core::jobs::{JobPriority, JobRegistry, JobRequest, PriorityRouter, SubmitParams};
use taskline_core::Taskline;

fn bench_priority_routing(c: &mut Criterion) {
    let router = PriorityRouter::default();
    let mut group = c.benchmark_group("priority_routing");

    for priority in JobPriority::ALL {
        group.bench_with_input(BenchmarkId::new("queue_for", priority), &priority, |b, &p| {
            b.iter(|| black_box(router.queue_for(p)));
        });
    }

    group.bench_function("estimate_completion", |b| {
        let now = Utc::now();
        b.iter(|| black_box(router.estimate_completion(JobPriority::Low, now)));
    });

    group.bench_function("priority_for_queue", |b| {
        b.iter(|| black_box(router.priority_for_queue("bulk")));
    });

    group.finish();
}

fn bench_submit_params(c: &mut Criterion) {
    let defaults = Config::default().jobs;
    let mut group = c.benchmark_group("submit_params");

    group.bench_function("into_request", |b| {
        b.iter(|| {
            let mut params = SubmitParams::new("report.generate", "high");
            params.args = vec![json!(42), json!("monthly")];
            params.tags = vec!["billing".into(), "finance".into()];
            black_box(params.into_request(&defaults))
        });
    });

    group.bench_function("invalid_priority", |b| {
        b.iter(|| black_box(SubmitParams::new("noop", "URGENT").into_request(&defaults)));
    });

    group.finish();
}

fn bench_cache_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_keys");

    for &width in &[1usize, 16, 256] {
        let inputs: serde_json::Map<String, serde_json::Value> =
            (0..width).map(|i| (format!("field_{}", i), json!(i))).collect();

        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("for_inputs", width), &inputs, |b, inputs| {
            b.iter(|| black_box(CacheKey::for_inputs("bench", inputs)));
        });
    }

    group.finish();
}

fn bench_inline_submission(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut config = Config::default();
    config.broker.always_inline = true;
    let service = Taskline::in_memory(config, JobRegistry::with_builtins());

    let mut group = c.benchmark_group("submission");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("inline_noop", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(service.orchestrator().submit(JobRequest::new("noop")).await) });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_priority_routing,
    bench_submit_params,
    bench_cache_keys,
    bench_inline_submission,
);
criterion_main!(benches);
