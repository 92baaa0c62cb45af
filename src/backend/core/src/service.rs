//! The service bundle.
//!
//! [`Taskline`] is built once from a [`Config`] and owns every collaborator:
//! job store, broker client, computation cache, handler registry,
//! orchestrator and health reporter. Binaries hold one and pass it by
//! reference; there are no process-wide singletons.

use std::sync::Arc;

use crate::broker::{Broker, BrokerClient, InMemoryBroker, RedisBroker};
use crate::cache::ComputationCache;
use crate::config::Config;
use crate::error::Result;
use crate::health::{CacheHealthChecker, HealthReporter, HealthSnapshot};
use crate::jobs::{FallbackExecutor, JobRegistry, JobWorker};
use crate::maintenance::MaintenanceScheduler;
use crate::orchestrator::JobOrchestrator;
use crate::store::{InMemoryJobStore, JobStore, PostgresJobStore};

pub struct Taskline {
    config: Config,
    store: Arc<dyn JobStore>,
    transport: Arc<dyn Broker>,
    broker: Arc<BrokerClient>,
    cache: Arc<ComputationCache>,
    registry: JobRegistry,
    orchestrator: Arc<JobOrchestrator>,
    health: Arc<HealthReporter>,
}

impl Taskline {
    /// Connect the configured backends.
    ///
    /// The job store is PostgreSQL when `store.url` is set (migrations are
    /// applied) and in-memory otherwise. The Redis broker connects lazily, so
    /// an unreachable broker does not fail startup.
    pub async fn connect(config: Config, registry: JobRegistry) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn JobStore> = if config.store.url.is_some() {
            let store = PostgresJobStore::connect(&config.store).await?;
            store.migrate().await?;
            Arc::new(store)
        } else {
            tracing::warn!("store.url not set, job records are kept in memory");
            Arc::new(InMemoryJobStore::new())
        };
        let transport: Arc<dyn Broker> = Arc::new(RedisBroker::new(&config.broker)?);
        let cache = Arc::new(ComputationCache::from_config(&config.cache)?);

        Ok(Self::from_parts(config, store, transport, cache, registry))
    }

    /// Everything in memory. Used by tests and single-process tools.
    pub fn in_memory(config: Config, registry: JobRegistry) -> Self {
        let cache = Arc::new(ComputationCache::in_memory(&config.cache));
        Self::from_parts(
            config,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryBroker::new()),
            cache,
            registry,
        )
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn JobStore>,
        transport: Arc<dyn Broker>,
        cache: Arc<ComputationCache>,
        registry: JobRegistry,
    ) -> Self {
        let broker = Arc::new(BrokerClient::new(Arc::clone(&transport), &config.broker));
        let executor = Arc::new(
            FallbackExecutor::new(registry.clone(), Arc::clone(&store)).with_cache(Some(Arc::clone(&cache))),
        );
        let orchestrator = Arc::new(
            JobOrchestrator::new(Arc::clone(&store), Arc::clone(&broker), executor, config.jobs.clone())
                .with_retention(&config.maintenance),
        );
        let health = Arc::new(
            HealthReporter::new(Arc::clone(&broker), Arc::clone(&store))
                .with_checker(Arc::new(CacheHealthChecker::new(Arc::clone(&cache)))),
        );

        tracing::info!(
            store = store.name(),
            always_inline = config.broker.always_inline,
            handlers = registry.names().len(),
            "Taskline service assembled"
        );

        Self {
            config,
            store,
            transport,
            broker,
            cache,
            registry,
            orchestrator,
            health,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    pub fn cache(&self) -> &Arc<ComputationCache> {
        &self.cache
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthReporter> {
        &self.health
    }

    /// Take a fresh health snapshot.
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot().await
    }

    /// A worker consuming this service's broker with the configured settings.
    pub fn worker(&self) -> JobWorker {
        JobWorker::new(Arc::clone(&self.transport), self.registry.clone(), self.config.worker.clone())
            .with_cache(Some(Arc::clone(&self.cache)))
    }

    /// The periodic cleanup, health, reconcile and cache loops.
    pub fn maintenance(&self) -> MaintenanceScheduler {
        MaintenanceScheduler::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.health),
            self.config.maintenance.clone(),
        )
        .with_cache(Some(Arc::clone(&self.cache)))
    }
}

impl std::fmt::Debug for Taskline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Taskline")
            .field("store", &self.store.name())
            .field("broker", &self.broker)
            .field("cache", &self.cache.backend_name())
            .field("handlers", &self.registry.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobRequest, JobStatus};

    #[tokio::test]
    async fn test_in_memory_service_runs_jobs_through_worker() {
        let service = Taskline::in_memory(Config::default(), JobRegistry::with_builtins());
        let id = service.orchestrator().submit(JobRequest::new("noop")).await.unwrap();

        assert!(service.worker().run_once(std::time::Duration::from_millis(50)).await.unwrap());

        let view = service.orchestrator().get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_health_snapshot_includes_cache() {
        let service = Taskline::in_memory(Config::default(), JobRegistry::with_builtins());
        let snapshot = service.health_snapshot().await;
        assert!(snapshot.components.iter().any(|c| c.name == "cache"));
        assert!(service.health().latest().is_some());
    }
}
