//! Prometheus recorder and metric descriptions.
//!
//! Call sites use the `metrics` macros directly; this module only installs the
//! recorder and documents what is emitted.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use super::TelemetryConfig;

/// Buckets for job durations, from sub-second handlers up to the default
/// five minute time limit.
const JOB_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Holds the Prometheus handle when the recorder is installed.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

pub fn init_metrics(config: &TelemetryConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.metrics_enabled {
        return Ok(MetricsRegistry::default());
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("service", config.service_name.clone())
        .set_buckets_for_metric(
            Matcher::Full("taskline_job_duration_seconds".to_string()),
            JOB_DURATION_BUCKETS,
        )?
        .install_recorder()?;

    describe_metrics();

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register descriptions for every metric the crate emits.
pub fn describe_metrics() {
    describe_counter!(
        "taskline_jobs_submitted_total",
        "Jobs accepted by submit, by priority and execution mode"
    );
    describe_counter!(
        "taskline_jobs_finished_total",
        "Jobs reaching a final outcome, by status and execution mode"
    );
    describe_counter!("taskline_jobs_retried_total", "Attempts re-enqueued by workers");
    describe_counter!(
        "taskline_fallback_total",
        "Submissions executed inline instead of through the broker, by reason"
    );
    describe_counter!("taskline_broker_ping_total", "Broker availability pings, by result");
    describe_counter!("taskline_cache_requests_total", "Computation cache lookups, by result");
    describe_counter!("taskline_errors_total", "Errors constructed, by code and category");
    describe_counter!(
        "taskline_store_cleanup_deleted_total",
        "Job records deleted by retention cleanup"
    );
    describe_counter!(
        "taskline_maintenance_runs_total",
        "Maintenance loop runs, by task and result"
    );

    describe_histogram!(
        "taskline_job_duration_seconds",
        Unit::Seconds,
        "Handler wall time, by job name"
    );

    describe_gauge!("taskline_broker_available", "1 when the broker answered its last ping");
    describe_gauge!("taskline_store_available", "1 when the job store answered its last ping");
    describe_gauge!("taskline_jobs_active", "Jobs in a non-terminal state at the last health check");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let config = TelemetryConfig {
            metrics_enabled: false,
            ..TelemetryConfig::default()
        };
        let registry = init_metrics(&config).unwrap();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }
}
