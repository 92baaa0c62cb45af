//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, TasklineError};
use crate::jobs::{BackoffStrategy, WorkerConfig};
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "TASKLINE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Job record store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Job defaults and limits
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Periodic maintenance configuration
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Computation cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Broker-consuming worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging, tracing and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Redis URL of the broker
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Upper bound on a single enqueue call
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound on the availability ping
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Skip the broker entirely and run every job in-process
    #[serde(default)]
    pub always_inline: bool,

    /// Prefix for every broker key
    #[serde(default = "default_broker_prefix")]
    pub key_prefix: String,

    /// Consecutive dispatch failures before probing is suspended
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// How long probing stays suspended once the breaker opens
    #[serde(default = "default_circuit_breaker_recovery", with = "humantime_serde")]
    pub circuit_breaker_recovery: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            connect_timeout: default_connect_timeout(),
            ping_timeout: default_ping_timeout(),
            always_inline: false,
            key_prefix: default_broker_prefix(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_recovery: default_circuit_breaker_recovery(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL connection URL; records are kept in memory when absent
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Time to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Execution budget when a submission does not name one
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Retry bound when a submission does not name one
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Reference duration scaled by the priority multiplier for ETA estimates
    #[serde(default = "default_base_duration_secs")]
    pub base_duration_secs: u64,

    /// Maximum number of tags per job
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Maximum characters per tag
    #[serde(default = "default_max_tag_length")]
    pub max_tag_length: usize,

    /// Delay schedule between automatic retries
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            base_duration_secs: default_base_duration_secs(),
            max_tags: default_max_tags(),
            max_tag_length: default_max_tag_length(),
            backoff: BackoffStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// How often expired job records are deleted
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Age after which a job record is deleted
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Keep non-terminal records past the retention age
    #[serde(default)]
    pub retain_active: bool,

    /// How often the health snapshot is refreshed
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// How often broker state is pulled into active job records
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: default_cleanup_interval(),
            retention_hours: default_retention_hours(),
            retain_active: false,
            health_check_interval: default_health_check_interval(),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Redis URL; entries are kept in memory when absent
    pub redis_url: Option<String>,

    /// TTL used when a caller does not pass one
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Maximum in-memory entries before the oldest are evicted
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: usize,

    /// Prefix for every cache key
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            default_ttl: default_cache_ttl(),
            max_capacity: default_cache_capacity(),
            key_prefix: default_cache_prefix(),
        }
    }
}

// Default value functions
fn default_broker_url() -> String { "redis://localhost:6379".to_string() }
fn default_connect_timeout() -> Duration { Duration::from_secs(2) }
fn default_ping_timeout() -> Duration { Duration::from_secs(1) }
fn default_broker_prefix() -> String { "taskline:".to_string() }
fn default_circuit_breaker_threshold() -> u32 { 5 }
fn default_circuit_breaker_recovery() -> Duration { Duration::from_secs(30) }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_timeout_secs() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }
fn default_base_duration_secs() -> u64 { 60 }
fn default_max_tags() -> usize { 32 }
fn default_max_tag_length() -> usize { 64 }
fn default_cleanup_interval() -> Duration { Duration::from_secs(3600) }
fn default_retention_hours() -> u64 { 24 * 7 }
fn default_health_check_interval() -> Duration { Duration::from_secs(30) }
fn default_reconcile_interval() -> Duration { Duration::from_secs(15) }
fn default_cache_ttl() -> Duration { Duration::from_secs(3600) }
fn default_cache_capacity() -> usize { 10_000 }
fn default_cache_prefix() -> String { "taskline:cache:".to_string() }

impl Config {
    /// Load configuration from the environment (`TASKLINE__SECTION__KEY`).
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, overlaid with the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.default_timeout_secs == 0 {
            return Err(TasklineError::configuration("jobs.default_timeout_secs must be positive"));
        }
        if self.broker.ping_timeout.is_zero() || self.broker.connect_timeout.is_zero() {
            return Err(TasklineError::configuration("broker timeouts must be positive"));
        }
        if self.worker.concurrency == 0 {
            return Err(TasklineError::configuration("worker.concurrency must be positive"));
        }
        if self.worker.queues.is_empty() {
            return Err(TasklineError::configuration("worker.queues must name at least one queue"));
        }
        if self.maintenance.cleanup_interval.is_zero()
            || self.maintenance.health_check_interval.is_zero()
            || self.maintenance.reconcile_interval.is_zero()
        {
            return Err(TasklineError::configuration("maintenance intervals must be positive"));
        }
        Ok(())
    }
}
