//! Telemetry: structured logging, optional OTLP trace export and Prometheus
//! metrics.
//!
//! ```rust,no_run
//! use taskline_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let telemetry = init_telemetry(&TelemetryConfig::default())?;
//! // ... run the service ...
//! telemetry.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod metrics;
mod otel;

pub use logging::{init_logging, LogFormat};
pub use metrics::{describe_metrics, init_metrics, MetricsRegistry};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Name reported in traces and as the `service` metric label
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// `EnvFilter` directive, e.g. `info` or `taskline_core=debug,info`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// OTLP gRPC endpoint; spans are only exported when set
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Install the Prometheus recorder
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

fn default_service_name() -> String {
    "taskline".to_string()
}

fn default_environment() -> String {
    std::env::var("TASKLINE_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

/// Install the metrics recorder, the tracer and the log subscriber.
///
/// Call once at startup; a second call fails because the global subscriber
/// is already set.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(config)?;

    let tracer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => Some(otel::build_tracer(endpoint, config)?),
        None => None,
    };
    let tracing_enabled = tracer.is_some();

    init_logging(config, tracer)?;

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        otlp = tracing_enabled,
        metrics = config.metrics_enabled,
        "Telemetry initialized"
    );

    Ok(TelemetryHandle {
        metrics,
        tracing_enabled,
    })
}

/// Keeps the metrics handle alive and flushes spans on shutdown.
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
    tracing_enabled: bool,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        if self.tracing_enabled {
            otel::shutdown();
        }
        tracing::info!("Telemetry shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "taskline");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.otlp_endpoint.is_none());
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_telemetry_config_deserialize() {
        let config: TelemetryConfig = serde_json::from_value(serde_json::json!({
            "log_format": "compact",
            "otlp_endpoint": "http://collector:4317"
        }))
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Compact);
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
        assert_eq!(config.service_name, "taskline");
    }
}
