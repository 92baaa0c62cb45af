//! Built-in job handlers.
//!
//! Small handlers every deployment has available: useful for smoke-testing a
//! worker fleet and for exercising the queue end to end.

use serde_json::json;
use std::time::Duration;

use super::{HandlerResult, JobContext, JobError, JobRegistry, TaskOutput};

/// Register every built-in handler on `registry`.
pub fn register_builtins(registry: &JobRegistry) {
    registry.register_fn("noop", noop);
    registry.register_fn("echo", echo);
    registry.register_fn("sleep", sleep);
    registry.register_fn("fail", fail);
}

/// Does nothing and succeeds.
async fn noop(ctx: JobContext) -> HandlerResult {
    ctx.log_info("noop");
    Ok(TaskOutput::Unit)
}

/// Returns its arguments unchanged.
async fn echo(ctx: JobContext) -> HandlerResult {
    Ok(TaskOutput::json(json!({
        "args": ctx.args(),
        "kwargs": ctx.kwargs(),
    })))
}

/// Sleeps for `seconds` (keyword, default 1), stopping early on cancellation.
async fn sleep(ctx: JobContext) -> HandlerResult {
    let seconds: f64 = ctx.kwarg("seconds")?.unwrap_or(1.0);
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(JobError::fatal(format!("invalid sleep duration: {}", seconds)));
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {
            Ok(TaskOutput::json(json!({ "slept_seconds": seconds })))
        }
        _ = ctx.cancelled() => {
            Err(JobError::fatal("sleep interrupted by cancellation"))
        }
    }
}

/// Always fails with `message` (keyword, default "requested failure").
///
/// Set `retryable: true` to make the failure eligible for automatic retry.
async fn fail(ctx: JobContext) -> HandlerResult {
    let message: String = ctx
        .kwarg("message")?
        .unwrap_or_else(|| "requested failure".to_string());
    let retryable: bool = ctx.kwarg("retryable")?.unwrap_or(false);

    ctx.log_warn(&format!("failing on request: {}", message));
    if retryable {
        Err(JobError::retryable(message))
    } else {
        Err(JobError::fatal(message))
    }
}
