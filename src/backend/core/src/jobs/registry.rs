//! Job handlers and the registry that resolves them by name.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{ExecutionMode, Job, JobError, JobId, TaskOutput};
use crate::cache::ComputationCache;

/// Result type for job handlers.
pub type HandlerResult = std::result::Result<TaskOutput, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one execution attempt.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    name: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    attempt: u32,
    mode: ExecutionMode,
    cancellation: CancellationToken,
    cache: Option<Arc<ComputationCache>>,
}

impl JobContext {
    pub fn new(job_id: JobId, name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            job_id,
            name: name.into(),
            args,
            kwargs,
            attempt: 0,
            mode: ExecutionMode::Inline,
            cancellation: CancellationToken::new(),
            cache: None,
        }
    }

    /// Context for executing a stored job record.
    pub fn for_job(job: &Job, mode: ExecutionMode) -> Self {
        Self::new(job.id, job.name.clone(), job.args.clone(), job.kwargs.clone())
            .with_attempt(job.retry_count)
            .with_mode(mode)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<ComputationCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Number of retries that preceded this attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Positional argument `index`, deserialized.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, JobError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| JobError::fatal(format!("missing positional argument {}", index)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| JobError::fatal(format!("invalid positional argument {}: {}", index, e)))
    }

    /// Keyword argument `key`, deserialized. `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, JobError> {
        match self.kwargs.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| JobError::fatal(format!("invalid keyword argument '{}': {}", key, e))),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Shared computation cache, when one is configured.
    pub fn cache(&self) -> Option<&ComputationCache> {
        self.cache.as_deref()
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(job_id = %self.job_id, job_name = %self.name, attempt = self.attempt, message);
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(job_id = %self.job_id, job_name = %self.name, attempt = self.attempt, message);
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(job_id = %self.job_id, job_name = %self.name, attempt = self.attempt, message);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The callable behind a job name.
///
/// Return a `JobError` to fail the job; use `JobError::retryable()` for
/// transient failures a worker may retry automatically.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> HandlerResult;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> HandlerResult {
        (self.func)(ctx).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Name → handler lookup shared by the fallback executor and workers.
#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: Arc<DashMap<String, Arc<dyn TaskHandler>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        super::builtin::register_builtins(&registry);
        registry
    }

    /// Register a handler, replacing any previous one under `name`.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(job_name = %name, "Replaced existing job handler");
        }
    }

    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler::new(func)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry").field("handlers", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn double(ctx: JobContext) -> HandlerResult {
        let n: i64 = ctx.arg(0)?;
        Ok(TaskOutput::json(n * 2))
    }

    #[tokio::test]
    async fn test_register_and_run_fn() {
        let registry = JobRegistry::new();
        registry.register_fn("double", double);

        let handler = registry.get("double").unwrap();
        let ctx = JobContext::new(JobId::new(), "double", vec![json!(21)], Map::new());
        assert_eq!(handler.run(ctx).await.unwrap(), TaskOutput::json(42));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_context_arguments() {
        let mut kwargs = Map::new();
        kwargs.insert("seconds".into(), json!(2));
        let ctx = JobContext::new(JobId::new(), "sleep", vec![json!("x")], kwargs);

        assert_eq!(ctx.arg::<String>(0).unwrap(), "x");
        assert!(ctx.arg::<String>(1).is_err());
        assert_eq!(ctx.kwarg::<u64>("seconds").unwrap(), Some(2));
        assert_eq!(ctx.kwarg::<u64>("missing").unwrap(), None);
        assert!(ctx.kwarg::<String>("seconds").is_err());
    }

    #[test]
    fn test_builtins_registered() {
        let registry = JobRegistry::with_builtins();
        for name in ["noop", "echo", "sleep", "fail"] {
            assert!(registry.contains(name), "{}", name);
        }
    }
}
