//! Job records and the lifecycle state machine.
//!
//! This module provides the core data model of the queue:
//!
//! - **Job**: The persisted record for one unit of work
//! - **JobStatus**: Lifecycle states and the transitions allowed between them
//! - **JobPriority**: The ordinal priority classes
//! - **JobRequest / SubmitParams**: Typed and untyped forms of a submission
//! - **RetryPolicy**: Retry bound plus a backoff strategy

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::error::{ErrorDetails, Result, TasklineError};

/// Default execution budget for a submission, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default retry bound for a submission.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound on `timeout_seconds` and on retry delays: 30 days.
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Error message recorded on cancelled jobs.
pub const CANCELLED_MESSAGE: &str = "job cancelled";

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| TasklineError::validation(format!("Invalid job id '{}': {}", s, e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority class of a job. Lower ordinal means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Bulk = 4,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    /// Every priority, most urgent first.
    pub const ALL: [JobPriority; 5] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
        JobPriority::Bulk,
    ];

    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
            Self::Bulk => "BULK",
        }
    }

    /// Comma-separated list of valid names, for error messages.
    pub fn allowed_names() -> String {
        Self::ALL.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| {
                TasklineError::validation(format!(
                    "Invalid priority '{}'. Must be one of: {}",
                    s,
                    Self::allowed_names()
                ))
                .with_details(
                    ErrorDetails::new()
                        .with_context("field", "priority")
                        .with_allowed_values(Self::ALL.iter().map(|p| p.as_str())),
                )
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Record written, not yet handed to a queue or executor
    Pending,
    /// Accepted by the broker
    Queued,
    /// Executing in a worker or in-process
    Running,
    Success,
    Failed,
    /// Failed job re-entering dispatch
    Retrying,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::Cancelled,
        JobStatus::Timeout,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled | Self::Timeout)
    }

    /// Non-terminal states.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        match self {
            Pending => matches!(next, Queued | Running | Failed | Cancelled),
            Queued => matches!(next, Running | Success | Failed | Timeout | Cancelled),
            Running => matches!(next, Success | Failed | Timeout | Cancelled),
            Failed => matches!(next, Retrying),
            Retrying => matches!(next, Queued | Running | Failed | Cancelled),
            Success | Cancelled | Timeout => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| TasklineError::validation(format!("Unknown job status '{}'", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Mode
// ═══════════════════════════════════════════════════════════════════════════════

/// Which regime executed (or is executing) a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Dispatched to the broker and run by a remote worker
    Broker,
    /// Run in-process by the fallback executor
    Inline,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Inline => "inline",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "broker" => Ok(Self::Broker),
            "inline" => Ok(Self::Inline),
            other => Err(TasklineError::validation(format!("Unknown execution mode '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure raised by a job body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether a worker may retry automatically
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Diagnostic trace
    pub trace: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            trace: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            trace: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<TasklineError> for JobError {
    fn from(error: TasklineError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
            trace: error.internal_message().map(str::to_string),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_secs: u64 },
    /// Linear increase in delay
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
    /// Exponential with random jitter
    ExponentialWithJitter {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 5,
            max_delay_secs: 600,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => initial_delay_secs + (increment_secs * attempt as u64),
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
            Self::ExponentialWithJitter {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
                jitter_factor,
            } => {
                let base_delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                let capped_delay = base_delay.min(*max_delay_secs as f64);
                let jitter_range = capped_delay * jitter_factor.clamp(0.0, 1.0);
                let jitter = if jitter_range > 0.0 {
                    rand::thread_rng().gen_range(-jitter_range..=jitter_range)
                } else {
                    0.0
                };
                (capped_delay + jitter).max(1.0) as u64
            }
        };

        Duration::from_secs(secs)
    }

    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry bound and delay schedule carried with a dispatched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = no retries)
    pub max_retries: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self { max_retries, backoff }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether a job that has already been retried `retry_count` times may go again.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before retry number `retry_count + 1`.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        self.backoff.delay_for_attempt(retry_count)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submission
// ═══════════════════════════════════════════════════════════════════════════════

/// A validated, typed submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub priority: JobPriority,
    pub owner_id: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl JobRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: JobPriority::default(),
            owner_id: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Check the request against submission rules and tag limits.
    pub fn validate(&self, limits: &JobsConfig) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TasklineError::validation("Job name must not be empty")
                .with_context("field", "name"));
        }
        if self.timeout_seconds == 0 {
            return Err(TasklineError::validation("timeout_seconds must be a positive integer")
                .with_context("field", "timeout_seconds"));
        }
        if self.timeout_seconds > MAX_DURATION_SECS {
            return Err(TasklineError::validation(format!(
                "timeout_seconds must be at most {}",
                MAX_DURATION_SECS
            ))
            .with_context("field", "timeout_seconds"));
        }
        if self.tags.len() > limits.max_tags {
            return Err(TasklineError::validation(format!(
                "At most {} tags are allowed",
                limits.max_tags
            ))
            .with_context("field", "tags"));
        }
        if let Some(tag) = self
            .tags
            .iter()
            .find(|t| t.trim().is_empty() || t.chars().count() > limits.max_tag_length)
        {
            return Err(TasklineError::validation(format!(
                "Tag '{}' must be non-empty and at most {} characters",
                tag, limits.max_tag_length
            ))
            .with_context("field", "tags"));
        }
        Ok(())
    }
}

/// Untyped submission as received from an outer layer.
///
/// Priority arrives as a string and numeric bounds may be omitted or negative;
/// [`SubmitParams::into_request`] turns it into a [`JobRequest`] or a validation error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitParams {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default = "default_priority_name")]
    pub priority: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_priority_name() -> String {
    JobPriority::Normal.as_str().to_string()
}

impl SubmitParams {
    pub fn new(name: impl Into<String>, priority: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: priority.into(),
            ..Default::default()
        }
    }

    /// Parse and validate, filling omitted bounds from `defaults`.
    pub fn into_request(self, defaults: &JobsConfig) -> Result<JobRequest> {
        let priority: JobPriority = self.priority.parse()?;

        let timeout_seconds = match self.timeout_seconds {
            None => defaults.default_timeout_secs,
            Some(secs) if secs > 0 => secs as u64,
            Some(_) => {
                return Err(TasklineError::validation("timeout_seconds must be a positive integer")
                    .with_context("field", "timeout_seconds"))
            }
        };

        let max_retries = match self.max_retries {
            None => defaults.default_max_retries,
            Some(n) if n >= 0 => u32::try_from(n).map_err(|_| {
                TasklineError::validation("max_retries is too large").with_context("field", "max_retries")
            })?,
            Some(_) => {
                return Err(TasklineError::validation("max_retries must be a non-negative integer")
                    .with_context("field", "max_retries"))
            }
        };

        let request = JobRequest {
            name: self.name,
            args: self.args,
            kwargs: self.kwargs,
            priority,
            owner_id: self.owner_id,
            timeout_seconds,
            max_retries,
            tags: self.tags.into_iter().map(|t| t.trim().to_string()).collect(),
        };
        request.validate(defaults)?;
        Ok(request)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted record of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub priority: JobPriority,
    pub status: JobStatus,
    /// Destination queue chosen at submission
    pub queue: String,
    pub execution_mode: Option<ExecutionMode>,
    /// Token returned by the broker on dispatch
    pub dispatch_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub owner_id: Option<String>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub result: Option<Value>,
    pub tags: BTreeSet<String>,
    /// Incremented by the store on every successful write
    pub version: i64,
}

impl Job {
    /// Build the initial `PENDING` record for a request.
    pub fn new(request: JobRequest, queue: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: request.name,
            args: request.args,
            kwargs: request.kwargs,
            priority: request.priority,
            status: JobStatus::Pending,
            queue: queue.into(),
            execution_mode: None,
            dispatch_token: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            retry_count: 0,
            max_retries: request.max_retries,
            timeout_seconds: request.timeout_seconds,
            owner_id: request.owner_id,
            error_message: None,
            error_trace: None,
            result: None,
            tags: request.tags,
            version: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether an explicit retry would be accepted.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// Wall time between start and completion.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Move to `next`, enforcing the lifecycle graph and timestamp rules.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TasklineError::invalid_transition(self.status, next)
                .with_context("job_id", self.id.to_string()));
        }

        let now = Utc::now();
        if self.started_at.is_none()
            && matches!(next, JobStatus::Running | JobStatus::Success | JobStatus::Failed | JobStatus::Timeout)
        {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now.max(self.started_at.unwrap_or(now)));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_queued(&mut self, dispatch_token: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Queued)?;
        self.execution_mode = Some(ExecutionMode::Broker);
        self.dispatch_token = Some(dispatch_token.into());
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)
    }

    pub fn mark_succeeded(&mut self, result: Value) -> Result<()> {
        self.transition(JobStatus::Success)?;
        self.result = Some(result);
        self.error_message = None;
        self.error_trace = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, trace: Option<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        self.error_trace = trace;
        self.result = None;
        Ok(())
    }

    pub fn mark_timed_out(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Timeout)?;
        self.error_message = Some(message.into());
        self.result = None;
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<()> {
        self.transition(JobStatus::Cancelled)?;
        self.error_message = Some(CANCELLED_MESSAGE.to_string());
        self.result = None;
        Ok(())
    }

    /// Enter `RETRYING`: bump the retry counter and clear the previous outcome.
    pub fn mark_retrying(&mut self) -> Result<()> {
        if self.retry_count >= self.max_retries {
            return Err(TasklineError::validation(format!(
                "Job {} has exhausted its {} retries",
                self.id, self.max_retries
            )));
        }
        self.transition(JobStatus::Retrying)?;
        self.retry_count += 1;
        self.result = None;
        self.error_message = None;
        self.error_trace = None;
        self.completed_at = None;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
