//! Error handling for taskline.
//!
//! This module provides:
//! - A single error type carrying a machine-readable code and structured details
//! - User-facing messages kept apart from internal diagnostics
//! - Severity-driven logging with tracing
//! - An error counter for every constructed error
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskline_core::error::{Result, TasklineError};
//!
//! fn check_timeout(secs: u64) -> Result<()> {
//!     if secs == 0 {
//!         return Err(TasklineError::validation("timeout_seconds must be a positive integer")
//!             .with_context("field", "timeout_seconds"));
//!     }
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for taskline operations.
pub type Result<T> = std::result::Result<T, TasklineError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be surfaced by an API layer unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    ResourceNotFound,
    InvalidStateTransition,
    ConcurrentModification,
    TaskProcessingError,
    TaskTimeout,
    TaskCancelled,
    HandlerNotFound,

    // Broker Errors (2000-2099)
    BrokerUnavailable,
    BrokerError,

    // Store Errors (2100-2199)
    StoreError,
    StoreConnectionFailed,

    // Cache Errors (2200-2299)
    CacheError,

    // Serialization Errors (2300-2399)
    SerializationError,
    DeserializationError,

    // Validation Errors (4100-4199)
    ValidationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ResourceNotFound => 1000,
            Self::InvalidStateTransition => 1001,
            Self::ConcurrentModification => 1002,
            Self::TaskProcessingError => 1003,
            Self::TaskTimeout => 1004,
            Self::TaskCancelled => 1005,
            Self::HandlerNotFound => 1006,

            Self::BrokerUnavailable => 2000,
            Self::BrokerError => 2001,

            Self::StoreError => 2100,
            Self::StoreConnectionFailed => 2101,

            Self::CacheError => 2200,

            Self::SerializationError => 2300,
            Self::DeserializationError => 2301,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// HTTP status an API layer should answer with for this code.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::ResourceNotFound | Self::HandlerNotFound => 404,

            Self::InvalidStateTransition | Self::ConcurrentModification => 409,

            Self::ValidationError => 422,

            Self::TaskTimeout => 504,

            Self::TaskCancelled => 410,

            Self::BrokerUnavailable | Self::StoreConnectionFailed => 503,

            Self::BrokerError => 502,

            Self::TaskProcessingError
            | Self::StoreError
            | Self::CacheError
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::InternalError => 500,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable
                | Self::BrokerError
                | Self::StoreConnectionFailed
                | Self::CacheError
                | Self::ConcurrentModification
                | Self::TaskTimeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            2000..=2099 => "broker",
            2100..=2199 => "store",
            2200..=2299 => "cache",
            2300..=2399 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown ids)
    Low,
    /// Operational issues (timeouts, lost races, broker hiccups)
    Medium,
    /// System errors (store failures, serialization bugs)
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::ResourceNotFound
            | ErrorCode::InvalidStateTransition
            | ErrorCode::TaskCancelled => Self::Low,

            ErrorCode::ConcurrentModification
            | ErrorCode::TaskTimeout
            | ErrorCode::BrokerUnavailable
            | ErrorCode::BrokerError
            | ErrorCode::CacheError => Self::Medium,

            ErrorCode::TaskProcessingError
            | ErrorCode::HandlerNotFound
            | ErrorCode::StoreError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::StoreConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, queue, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Allowed values, for validation failures over a closed set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = values.into_iter().map(Into::into).collect();
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for taskline.
#[derive(Error, Debug)]
pub struct TasklineError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to callers)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TasklineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl TasklineError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "taskline_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for TasklineError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::ResourceNotFound, "The requested record was not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                (ErrorCode::StoreConnectionFailed, "Unable to connect to the job store")
            }
            _ => (ErrorCode::StoreError, "A job store error occurred"),
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for TasklineError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::StoreError,
            "Job store migration failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<redis::RedisError> for TasklineError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::BrokerUnavailable, "Unable to reach redis")
        } else if error.is_timeout() {
            (ErrorCode::BrokerError, "Redis operation timed out")
        } else {
            (ErrorCode::BrokerError, "A redis error occurred")
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for TasklineError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for TasklineError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::TaskTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for TasklineError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::ResourceNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::TaskTimeout, "Operation timed out"),
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for TasklineError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<TasklineError>() {
            Ok(taskline_error) => taskline_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for TasklineError {
    fn from(error: config::ConfigError) -> Self {
        let user_msg = match &error {
            config::ConfigError::NotFound(_) => "Required configuration not found",
            config::ConfigError::FileParse { .. } => "Configuration file is invalid",
            _ => "Configuration error occurred",
        };
        Self::with_internal(ErrorCode::ConfigurationError, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl TasklineError {
    /// Unknown job id.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::ResourceNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// Rejected lifecycle transition.
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Cannot transition job from {} to {}", from, to),
        )
    }

    /// A compare-and-set write lost against a concurrent writer.
    pub fn concurrent_modification(job_id: impl fmt::Display, expected_version: i64) -> Self {
        let id = job_id.to_string();
        Self::new(
            ErrorCode::ConcurrentModification,
            format!("Job {} was modified concurrently", id),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", id)
                .with_context("expected_version", expected_version),
        )
    }

    /// No handler is registered under the given job name.
    pub fn handler_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::HandlerNotFound,
            format!("No handler registered for job '{}'", name),
        )
        .with_details(ErrorDetails::new().with_entity("handler", name))
    }

    /// Both broker dispatch and in-process execution failed.
    pub fn processing_failed(job_id: impl fmt::Display, reason: impl Into<String>) -> Self {
        let id = job_id.to_string();
        Self::with_internal(
            ErrorCode::TaskProcessingError,
            format!("Job {} could not be dispatched or executed", id),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("job", id))
    }

    pub fn broker_unavailable(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::BrokerUnavailable, "Broker is unavailable", reason)
    }

    pub fn broker(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::BrokerError, "Broker operation failed", reason)
    }

    pub fn store(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StoreError, "A job store error occurred", reason)
    }

    pub fn cache(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::CacheError, "A cache error occurred", reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numeric() {
        assert_eq!(ErrorCode::ResourceNotFound.numeric_code(), 1000);
        assert_eq!(ErrorCode::BrokerUnavailable.numeric_code(), 2000);
        assert_eq!(ErrorCode::ValidationError.numeric_code(), 4100);
        assert_eq!(ErrorCode::InternalError.numeric_code(), 9000);
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::TaskProcessingError.category(), "job");
        assert_eq!(ErrorCode::BrokerError.category(), "broker");
        assert_eq!(ErrorCode::StoreConnectionFailed.category(), "store");
        assert_eq!(ErrorCode::ValidationError.category(), "validation");
    }

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::ResourceNotFound.http_status(), 404);
        assert_eq!(ErrorCode::ValidationError.http_status(), 422);
        assert_eq!(ErrorCode::ConcurrentModification.http_status(), 409);
        assert_eq!(ErrorCode::BrokerUnavailable.http_status(), 503);
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::BrokerUnavailable.is_retryable());
        assert!(ErrorCode::ConcurrentModification.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::ResourceNotFound.is_retryable());
    }

    #[test]
    fn test_job_not_found() {
        let error = TasklineError::job_not_found(uuid::Uuid::new_v4());
        assert_eq!(error.code(), ErrorCode::ResourceNotFound);
        assert_eq!(error.details().entity_type.as_deref(), Some("job"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_error_context() {
        let error = TasklineError::validation("Invalid priority")
            .with_context("field", "priority")
            .with_context("value", "urgent");

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("value"));
    }

    #[test]
    fn test_allowed_values_detail() {
        let details = ErrorDetails::new().with_allowed_values(["CRITICAL", "HIGH"]);
        assert_eq!(details.allowed_values, vec!["CRITICAL", "HIGH"]);
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::ValidationError), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::BrokerError), ErrorSeverity::Medium);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::StoreError), ErrorSeverity::High);
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StoreConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = TasklineError::with_internal(
            ErrorCode::StoreError,
            "Job store write failed",
            "connection reset by peer",
        );

        let display = format!("{}", error);
        assert!(display.contains("StoreError"));
        assert!(display.contains("Job store write failed"));
        assert!(display.contains("connection reset"));
    }
}
