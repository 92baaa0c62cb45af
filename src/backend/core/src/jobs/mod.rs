//! Jobs: the record model, routing, handlers and the two execution paths.
//!
//! - **Job**: The persisted record and its lifecycle state machine
//! - **Router**: Priority to queue name and completion multiplier
//! - **Registry**: Name to handler lookup, with the built-in handlers
//! - **Runner**: One handler invocation under a deadline, panic-isolated
//! - **Executor**: In-process fallback execution when the broker is out of reach
//! - **Worker**: The broker-consuming side that runs dispatched jobs
//!
//! # Execution paths
//!
//! ```text
//!                    ┌──────────────┐  enqueue   ┌────────┐  fetch  ┌───────────┐
//!   submit ─────────▶│ Orchestrator │───────────▶│ Broker │────────▶│ JobWorker │
//!                    └──────┬───────┘            └────────┘         └─────┬─────┘
//!                           │ unavailable / dispatch failed               │
//!                           ▼                                             ▼
//!                  ┌──────────────────┐                           ┌──────────────┐
//!                  │ FallbackExecutor │──────── run_handler ─────▶│ TaskHandler  │
//!                  └──────────────────┘                           └──────────────┘
//! ```

pub mod executor;
pub mod job;
pub mod output;
pub mod registry;
pub mod router;
pub mod runner;
pub mod worker;

mod builtin;

pub use executor::FallbackExecutor;
pub use job::{
    BackoffStrategy, ExecutionMode, Job, JobError, JobId, JobPriority, JobRequest, JobStatus, RetryPolicy,
    SubmitParams, CANCELLED_MESSAGE, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS, MAX_DURATION_SECS,
};
pub use output::{safe_serialize, TaskOutput};
pub use registry::{FnHandler, HandlerResult, JobContext, JobRegistry, TaskHandler};
pub use router::PriorityRouter;
pub use runner::{run_handler, RunOutcome, RunReport};
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
