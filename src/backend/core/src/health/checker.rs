//! Health checkers for the job queue's collaborators.
//!
//! - **Broker**: availability ping, degraded rather than unhealthy when
//!   unreachable since jobs still run inline
//! - **Store**: job record store reachability
//! - **Cache**: computation cache statistics

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::check::{ComponentHealth, HealthStatus};
use crate::broker::{Availability, BrokerClient};
use crate::cache::ComputationCache;
use crate::store::JobStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Checker Trait
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// The component name.
    fn name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;

    /// Run `check` under `timeout`; expiry is reported as unhealthy.
    async fn check_with_timeout(&self, timeout: Duration) -> ComponentHealth {
        let start = Instant::now();
        match tokio::time::timeout(timeout, self.check()).await {
            Ok(mut health) => {
                health.latency_ms = Some(start.elapsed().as_millis() as u64);
                health
            }
            Err(_) => ComponentHealth::unhealthy(self.name())
                .with_error(format!("Health check timed out after {:?}", timeout))
                .with_latency(start.elapsed()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

pub struct BrokerHealthChecker {
    client: Arc<BrokerClient>,
}

impl BrokerHealthChecker {
    pub fn new(client: Arc<BrokerClient>) -> Self {
        Self { client }
    }

    /// Ping the broker, returning the raw availability alongside the report.
    pub async fn ping(&self) -> (Availability, ComponentHealth) {
        let start = Instant::now();
        let availability = self.client.availability().await;
        let circuit = self.client.circuit();

        let health = match availability {
            Availability::Reachable => ComponentHealth::healthy(self.name()),
            Availability::InlineOverride => {
                ComponentHealth::healthy(self.name()).with_message("always_inline is set; broker not pinged")
            }
            Availability::Unreachable => ComponentHealth::degraded(self.name())
                .with_message("broker unreachable; jobs execute inline"),
        };

        let health = health
            .with_latency(start.elapsed())
            .with_metadata("transport", self.client.transport().name())
            .with_metadata("availability", availability.as_str())
            .with_metadata("circuit", circuit.state.as_str());
        (availability, health)
    }
}

#[async_trait]
impl HealthChecker for BrokerHealthChecker {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> ComponentHealth {
        self.ping().await.1
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

pub struct StoreHealthChecker {
    store: Arc<dyn JobStore>,
}

impl StoreHealthChecker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthChecker for StoreHealthChecker {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let result = self.store.ping().await;
        if let Err(e) = &result {
            warn!(backend = self.store.name(), error = %e, "Job store health check failed");
        }
        ComponentHealth::from_result(self.name(), result, start.elapsed())
            .with_metadata("backend", self.store.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

pub struct CacheHealthChecker {
    cache: Arc<ComputationCache>,
}

impl CacheHealthChecker {
    pub fn new(cache: Arc<ComputationCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl HealthChecker for CacheHealthChecker {
    fn name(&self) -> &str {
        "cache"
    }

    async fn check(&self) -> ComponentHealth {
        match self.cache.stats().await {
            Ok(stats) => ComponentHealth::healthy(self.name())
                .with_metadata("backend", &stats.backend)
                .with_metadata("entries", stats.entries)
                .with_metadata("hit_rate", stats.hit_rate),
            // Handlers recompute on cache errors, so this only degrades.
            Err(e) => ComponentHealth::unhealthy(self.name())
                .with_error(e.to_string())
                .with_status(HealthStatus::Degraded)
                .with_metadata("backend", self.cache.backend_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::{BrokerConfig, CacheConfig};
    use crate::store::InMemoryJobStore;

    #[tokio::test]
    async fn test_broker_checker_degrades_when_unreachable() {
        let broker = Arc::new(InMemoryBroker::new());
        let checker = BrokerHealthChecker::new(Arc::new(BrokerClient::new(broker.clone(), &BrokerConfig::default())));

        let (availability, health) = checker.ping().await;
        assert_eq!(availability, Availability::Reachable);
        assert!(health.is_healthy());

        broker.set_reachable(false);
        let (availability, health) = checker.ping().await;
        assert_eq!(availability, Availability::Unreachable);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_store_checker() {
        let checker = StoreHealthChecker::new(Arc::new(InMemoryJobStore::new()));
        let health = checker.check_with_timeout(Duration::from_secs(1)).await;
        assert!(health.is_healthy());
        assert!(health.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_cache_checker() {
        let cache = Arc::new(ComputationCache::in_memory(&CacheConfig::default()));
        let health = CacheHealthChecker::new(cache).check().await;
        assert!(health.is_healthy());
        assert_eq!(health.metadata["backend"], "in_memory");
    }
}
