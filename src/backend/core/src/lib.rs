#![allow(clippy::result_large_err)]
//! # Taskline Core
//!
//! Priority job queue with broker dispatch and in-process fallback.
//!
//! ## Architecture
//!
//! - **Jobs**: Job records, the lifecycle state machine, handlers and both
//!   execution paths (broker workers and the inline fallback executor)
//! - **Orchestrator**: Submit, status, cancel, retry, queue statistics,
//!   reconciliation and retention cleanup
//! - **Broker**: Transport trait with Redis and in-memory implementations,
//!   state normalization and availability probing behind a circuit breaker
//! - **Store**: Job record persistence with compare-and-set writes
//! - **Cache**: Content-addressed computation cache for handlers
//! - **Health**: Aggregated health snapshots
//! - **Maintenance**: Periodic cleanup, health refresh, reconciliation and cache sweep
//! - **Telemetry**: Structured logging, OTLP tracing and Prometheus metrics

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod jobs;
pub mod maintenance;
pub mod orchestrator;
pub mod service;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, TasklineError};
pub use service::Taskline;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::{Availability, Broker, BrokerClient, BrokerState, BrokerTaskInfo, TaskMessage};
    pub use crate::cache::{CacheKey, ComputationCache};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, TasklineError};
    pub use crate::health::{HealthReporter, HealthSnapshot, HealthStatus};
    pub use crate::jobs::{
        BackoffStrategy, ExecutionMode, FallbackExecutor, Job, JobContext, JobError, JobId, JobPriority,
        JobRegistry, JobRequest, JobStatus, JobWorker, PriorityRouter, RetryPolicy, SubmitParams, TaskHandler,
        TaskOutput,
    };
    pub use crate::maintenance::{MaintenanceScheduler, MaintenanceTask};
    pub use crate::orchestrator::{JobOrchestrator, JobStatusView, ReconcileReport};
    pub use crate::service::Taskline;
    pub use crate::store::{InMemoryJobStore, JobCounts, JobStore, PriorityStats};
}
