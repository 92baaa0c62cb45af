//! Broker transport and client.
//!
//! The broker is the out-of-process dispatch system that carries jobs to a
//! remote worker pool. This module defines:
//!
//! - **Broker**: The transport contract, with a producer side (enqueue,
//!   query, revoke, ping) and a consumer side used by workers (fetch, report,
//!   revocation, delayed-task promotion)
//! - **BrokerState**: The broker-native state vocabulary and its fixed
//!   normalization into [`JobStatus`]
//! - **BrokerClient**: Timeouts, the availability ping, the always-inline
//!   override and the dispatch circuit breaker
//! - **InMemoryBroker / RedisBroker**: Transport implementations
//!
//! # Wire model
//!
//! ```text
//!  orchestrator ── enqueue(TaskMessage) ──▶ queue:{name} ──▶ worker.fetch()
//!       ▲                                                        │
//!       └──── query_status ◀── state:{id} ◀── report(BrokerTaskInfo)
//! ```

pub mod circuit_breaker;
mod client;
mod memory;
mod redis_broker;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use client::{Availability, BrokerClient};
pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::jobs::{Job, JobId, JobPriority, JobStatus, RetryPolicy};

/// `from + by`, or `None` when the sum leaves chrono's range.
pub fn offset(from: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(by).ok().and_then(|d| from.checked_add_signed(d))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker State
// ═══════════════════════════════════════════════════════════════════════════════

/// Task state in the broker's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BrokerState {
    /// Waiting in a queue, or unknown to the broker
    Pending,
    /// Taken off the queue by a worker
    Received,
    Started,
    Success,
    Failure,
    /// Failed and re-enqueued by the worker
    Retry,
    Revoked,
    /// Anything outside the vocabulary above
    Unknown(String),
}

impl BrokerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "RECEIVED" => Self::Received,
            "STARTED" => Self::Started,
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            "RETRY" => Self::Retry,
            "REVOKED" => Self::Revoked,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Received => "RECEIVED",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Retry => "RETRY",
            Self::Revoked => "REVOKED",
            Self::Unknown(raw) => raw.as_str(),
        }
    }

    /// Map onto the local lifecycle. `None` for states outside the vocabulary.
    ///
    /// A `FAILURE` flagged as a time-limit failure maps to `TIMEOUT`.
    pub fn normalize(&self, timed_out: bool) -> Option<JobStatus> {
        match self {
            Self::Pending | Self::Received => Some(JobStatus::Queued),
            Self::Started => Some(JobStatus::Running),
            Self::Success => Some(JobStatus::Success),
            Self::Failure if timed_out => Some(JobStatus::Timeout),
            Self::Failure => Some(JobStatus::Failed),
            Self::Retry => Some(JobStatus::Retrying),
            Self::Revoked => Some(JobStatus::Cancelled),
            Self::Unknown(_) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }
}

impl From<String> for BrokerState {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<BrokerState> for String {
    fn from(state: BrokerState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque handle returned by a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchToken(pub String);

impl fmt::Display for DispatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The payload carried through a broker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: JobId,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub queue: String,
    pub priority: JobPriority,
    /// Not to be run before this instant
    pub eta: Option<DateTime<Utc>>,
    /// Discarded unstarted after this instant
    pub expires_at: Option<DateTime<Utc>>,
    /// Execution budget in seconds
    pub time_limit_secs: u64,
    pub retry_policy: RetryPolicy,
    /// Retries already consumed
    pub retries: u32,
    pub sent_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(
        job_id: JobId,
        name: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            name: name.into(),
            args,
            kwargs,
            queue: queue.into(),
            priority: JobPriority::Normal,
            eta: None,
            expires_at: None,
            time_limit_secs: crate::jobs::DEFAULT_TIMEOUT_SECS,
            retry_policy: RetryPolicy::default(),
            retries: 0,
            sent_at: Utc::now(),
        }
    }

    /// Message for a stored job record, routed to its queue.
    pub fn for_job(job: &Job) -> Self {
        Self::new(job.id, job.name.clone(), job.args.clone(), job.kwargs.clone(), job.queue.clone())
            .with_priority(job.priority)
            .with_time_limit(job.timeout())
            .with_retries(job.retry_count)
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Expire the message `expiry` after it is sent.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expires_at = offset(self.sent_at, expiry);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_secs = limit.as_secs();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Delay execution by `countdown`. A zero countdown clears any eta.
    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.eta = if countdown.is_zero() {
            None
        } else {
            Some(offset(Utc::now(), countdown).unwrap_or(DateTime::<Utc>::MAX_UTC))
        };
        self
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eta.map(|eta| eta <= now).unwrap_or(true)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// What the broker knows about one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerTaskInfo {
    pub state: BrokerState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub trace: Option<String>,
    #[serde(default)]
    pub retries: u32,
    /// The failure was a time-limit expiry
    #[serde(default)]
    pub timed_out: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BrokerTaskInfo {
    pub fn new(state: BrokerState) -> Self {
        Self {
            state,
            result: None,
            error: None,
            trace: None,
            retries: 0,
            timed_out: false,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>, trace: Option<String>) -> Self {
        self.error = Some(error.into());
        self.trace = trace;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timed_out(mut self, timed_out: bool) -> Self {
        self.timed_out = timed_out;
        self
    }

    pub fn with_started_at(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_completed_at(mut self, completed_at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = completed_at;
        self
    }

    /// Normalized local status, `None` for unknown broker states.
    pub fn normalized_status(&self) -> Option<JobStatus> {
        self.state.normalize(self.timed_out)
    }
}

/// A revoke request recorded by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revocation {
    /// Interrupt the task if it is already running
    pub terminate: bool,
    pub revoked_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transport Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A distributed task-dispatch transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend name for logs and health reports.
    fn name(&self) -> &'static str;

    /// Place a message on its queue, or on the delayed set when it has a future eta.
    async fn enqueue(&self, message: TaskMessage) -> Result<DispatchToken>;

    /// Latest state reported for `job_id`. `None` when the broker has no record.
    async fn query_status(&self, job_id: JobId) -> Result<Option<BrokerTaskInfo>>;

    /// Record a revoke. Unstarted tasks are skipped by workers; running tasks
    /// are interrupted only when `force` is set.
    async fn revoke(&self, job_id: JobId, force: bool) -> Result<()>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;

    /// Pop the next message from `queues`, earlier queues first, waiting up to `wait`.
    async fn fetch(&self, queues: &[String], wait: Duration) -> Result<Option<TaskMessage>>;

    /// Publish the state of a task.
    async fn report(&self, job_id: JobId, info: BrokerTaskInfo) -> Result<()>;

    /// The revoke recorded for `job_id`, if any.
    async fn revocation(&self, job_id: JobId) -> Result<Option<Revocation>>;

    /// Move delayed messages whose eta has passed onto their queues.
    async fn promote_due(&self) -> Result<usize>;

    async fn is_revoked(&self, job_id: JobId) -> Result<bool> {
        Ok(self.revocation(job_id).await?.is_some())
    }
}
