//! Health Reporter
//!
//! Aggregates broker availability, job store reachability, extra component
//! checks and job counters into one [`HealthSnapshot`]. `snapshot()` refreshes
//! on every call; the maintenance loop calls it on a timer so `latest()` stays
//! current for cheap readers.

mod check;
mod checker;

pub use check::{ComponentHealth, HealthStatus};
pub use checker::{BrokerHealthChecker, CacheHealthChecker, HealthChecker, StoreHealthChecker};

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::BrokerClient;
use crate::jobs::ExecutionMode;
use crate::store::{JobCounts, JobStore};

/// One health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// `true` when the broker answered its ping, or when `always_inline` is set
    pub broker_available: bool,
    pub store_available: bool,
    /// Where new submissions would run right now
    pub execution_mode: ExecutionMode,
    pub counts: JobCounts,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

pub struct HealthReporter {
    broker: BrokerHealthChecker,
    store: Arc<dyn JobStore>,
    store_checker: StoreHealthChecker,
    checkers: Vec<Arc<dyn HealthChecker>>,
    check_timeout: Duration,
    latest: RwLock<Option<HealthSnapshot>>,
}

impl HealthReporter {
    pub fn new(broker: Arc<BrokerClient>, store: Arc<dyn JobStore>) -> Self {
        Self {
            broker: BrokerHealthChecker::new(broker),
            store_checker: StoreHealthChecker::new(Arc::clone(&store)),
            store,
            checkers: Vec::new(),
            check_timeout: Duration::from_secs(5),
            latest: RwLock::new(None),
        }
    }

    /// Add a component to every snapshot.
    pub fn with_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Upper bound on each component check.
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Run every check now and remember the result.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let timeout = self.check_timeout;

        let broker_ping = async {
            match tokio::time::timeout(timeout, self.broker.ping()).await {
                Ok(ping) => Some(ping),
                Err(_) => None,
            }
        };
        let extra = futures::future::join_all(self.checkers.iter().map(|c| c.check_with_timeout(timeout)));
        let (broker_ping, store_health, extra) =
            tokio::join!(broker_ping, self.store_checker.check_with_timeout(timeout), extra);

        let (broker_available, execution_mode, broker_health) = match broker_ping {
            Some((availability, health)) => (
                availability.is_available(),
                if availability.use_broker() {
                    ExecutionMode::Broker
                } else {
                    ExecutionMode::Inline
                },
                health,
            ),
            None => (
                false,
                ExecutionMode::Inline,
                ComponentHealth::degraded(self.broker.name())
                    .with_message(format!("broker ping exceeded {:?}", timeout)),
            ),
        };

        let store_available = store_health.is_healthy();
        let counts = if store_available {
            match tokio::time::timeout(timeout, self.store.count_by_status()).await {
                Ok(Ok(counts)) => JobCounts::from_status_counts(&counts),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Could not count jobs for health snapshot");
                    JobCounts::default()
                }
                Err(_) => JobCounts::default(),
            }
        } else {
            JobCounts::default()
        };

        let mut components = vec![broker_health, store_health];
        components.extend(extra);
        let status = components
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| acc.combine(c.status));

        gauge!("taskline_broker_available").set(if broker_available { 1.0 } else { 0.0 });
        gauge!("taskline_store_available").set(if store_available { 1.0 } else { 0.0 });
        gauge!("taskline_jobs_active").set((counts.pending + counts.queued + counts.running + counts.retrying) as f64);

        let snapshot = HealthSnapshot {
            status,
            broker_available,
            store_available,
            execution_mode,
            counts,
            components,
            checked_at: Utc::now(),
        };

        if !status.is_healthy() {
            tracing::warn!(
                status = %status,
                broker_available,
                store_available,
                "Health degraded"
            );
        }

        *self.latest.write() = Some(snapshot.clone());
        snapshot
    }

    /// The last snapshot taken, if any.
    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.latest.read().clone()
    }
}
