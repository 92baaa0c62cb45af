//! OpenTelemetry span export.

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Tracer;

use super::TelemetryConfig;

pub(super) fn build_tracer(endpoint: &str, config: &TelemetryConfig) -> anyhow::Result<Tracer> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::config().with_resource(opentelemetry_sdk::Resource::new(vec![
                opentelemetry::KeyValue::new("service.name", config.service_name.clone()),
                opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                opentelemetry::KeyValue::new("deployment.environment", config.environment.clone()),
            ])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    opentelemetry::global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());
    Ok(tracer)
}

/// Flush pending spans.
pub(super) fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
