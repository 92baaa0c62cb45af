//! Single handler invocation under a deadline.
//!
//! The handler runs on its own tokio task. When the deadline passes or the
//! job is cancelled the task is aborted, which stops it at its next await
//! point. Code that blocks the thread without yielding is not preempted; it
//! keeps its worker thread until it returns, although the outcome has
//! already been recorded.

use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{JobContext, JobError, TaskHandler};

/// How one invocation ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Succeeded(Value),
    Failed(JobError),
    TimedOut(Duration),
    Cancelled,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "success",
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome plus wall time.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub elapsed: Duration,
}

/// Run `handler` with `ctx`, bounded by `timeout` and `cancel`.
pub async fn run_handler(
    handler: Arc<dyn TaskHandler>,
    ctx: JobContext,
    timeout: Duration,
    cancel: CancellationToken,
) -> RunReport {
    let started = Instant::now();
    let job_name = ctx.name().to_string();
    let ctx = ctx.with_cancellation(cancel.clone());

    let mut task = tokio::spawn(async move { handler.run(ctx).await });

    let outcome = tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(output)) => RunOutcome::Succeeded(output.into_value()),
            Ok(Err(error)) => {
                let trace = error
                    .trace
                    .clone()
                    .unwrap_or_else(|| describe_error(&job_name, &error));
                RunOutcome::Failed(error.with_trace(trace))
            }
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                RunOutcome::Failed(
                    JobError::fatal(format!("handler panicked: {}", message))
                        .with_code("PANIC")
                        .with_trace(format!("thread panicked in job '{}': {}", job_name, message)),
                )
            }
            Err(join_error) => RunOutcome::Failed(JobError::fatal(join_error.to_string())),
        },
        _ = tokio::time::sleep(timeout) => {
            task.abort();
            RunOutcome::TimedOut(timeout)
        }
        _ = cancel.cancelled() => {
            task.abort();
            RunOutcome::Cancelled
        }
    };

    RunReport {
        outcome,
        elapsed: started.elapsed(),
    }
}

fn describe_error(job_name: &str, error: &JobError) -> String {
    match &error.code {
        Some(code) => format!("job '{}' raised [{}] {}", job_name, code, error.message),
        None => format!("job '{}' raised: {}", job_name, error.message),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{HandlerResult, JobId, JobRegistry, TaskOutput};
    use serde_json::{json, Map};

    async fn returns_map(_ctx: JobContext) -> HandlerResult {
        Ok(TaskOutput::json(json!({"a": 1})))
    }

    async fn panics(_ctx: JobContext) -> HandlerResult {
        panic!("kaboom");
    }

    async fn hangs(_ctx: JobContext) -> HandlerResult {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(TaskOutput::Unit)
    }

    fn handler(name: &str) -> Arc<dyn TaskHandler> {
        let registry = JobRegistry::new();
        registry.register_fn("map", returns_map);
        registry.register_fn("panic", panics);
        registry.register_fn("hang", hangs);
        registry.get(name).unwrap()
    }

    fn ctx(name: &str) -> JobContext {
        JobContext::new(JobId::new(), name, vec![], Map::new())
    }

    #[tokio::test]
    async fn test_success() {
        let report = run_handler(handler("map"), ctx("map"), Duration::from_secs(5), CancellationToken::new()).await;
        match report.outcome {
            RunOutcome::Succeeded(value) => assert_eq!(value, json!({"a": 1})),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let report = run_handler(handler("panic"), ctx("panic"), Duration::from_secs(5), CancellationToken::new()).await;
        match report.outcome {
            RunOutcome::Failed(error) => {
                assert!(error.message.contains("kaboom"));
                assert!(error.trace.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline() {
        let report = run_handler(handler("hang"), ctx("hang"), Duration::from_millis(20), CancellationToken::new()).await;
        assert!(matches!(report.outcome, RunOutcome::TimedOut(_)));
        assert!(report.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = run_handler(handler("hang"), ctx("hang"), Duration::from_secs(30), token).await;
        assert_eq!(report.outcome.label(), "cancelled");
    }
}
