//! Periodic maintenance loops.
//!
//! One tokio task per [`MaintenanceTask`], each ticking on its own interval
//! until the shared watch channel flips. A failing run is logged and the loop
//! carries on.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::ComputationCache;
use crate::config::MaintenanceConfig;
use crate::error::Result;
use crate::health::HealthReporter;
use crate::orchestrator::JobOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceTask {
    /// Delete job records past the retention age
    Cleanup,
    /// Refresh the cached health snapshot
    HealthRefresh,
    /// Pull broker state into active job records
    Reconcile,
    /// Evict expired cache entries
    CacheSweep,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 4] = [
        MaintenanceTask::Cleanup,
        MaintenanceTask::HealthRefresh,
        MaintenanceTask::Reconcile,
        MaintenanceTask::CacheSweep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::HealthRefresh => "health_refresh",
            Self::Reconcile => "reconcile",
            Self::CacheSweep => "cache_sweep",
        }
    }
}

impl std::fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to the running loops.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for every loop to exit.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Maintenance loop ended abnormally");
            }
        }
    }
}

pub struct MaintenanceScheduler {
    orchestrator: Arc<JobOrchestrator>,
    health: Arc<HealthReporter>,
    cache: Option<Arc<ComputationCache>>,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    pub fn new(orchestrator: Arc<JobOrchestrator>, health: Arc<HealthReporter>, config: MaintenanceConfig) -> Self {
        Self {
            orchestrator,
            health,
            cache: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<ComputationCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Tick period for `task`. The cache sweep shares the cleanup cadence.
    pub fn interval(&self, task: MaintenanceTask) -> Duration {
        match task {
            MaintenanceTask::Cleanup | MaintenanceTask::CacheSweep => self.config.cleanup_interval,
            MaintenanceTask::HealthRefresh => self.config.health_check_interval,
            MaintenanceTask::Reconcile => self.config.reconcile_interval,
        }
    }

    /// Run `task` once.
    pub async fn run_task(&self, task: MaintenanceTask) -> Result<()> {
        match task {
            MaintenanceTask::Cleanup => {
                let deleted = self.orchestrator.cleanup_expired().await?;
                if deleted > 0 {
                    tracing::info!(deleted, "Deleted expired job records");
                }
            }
            MaintenanceTask::HealthRefresh => {
                let snapshot = self.health.snapshot().await;
                tracing::debug!(
                    status = %snapshot.status,
                    broker_available = snapshot.broker_available,
                    "Health snapshot refreshed"
                );
            }
            MaintenanceTask::Reconcile => {
                let report = self.orchestrator.reconcile_active().await?;
                if report.updated > 0 || report.errors > 0 {
                    tracing::info!(
                        examined = report.examined,
                        updated = report.updated,
                        errors = report.errors,
                        "Reconciled active jobs"
                    );
                }
            }
            MaintenanceTask::CacheSweep => {
                if let Some(cache) = &self.cache {
                    let evicted = cache.sweep().await?;
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted expired cache entries");
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawn one loop per task.
    pub fn start(self) -> MaintenanceHandle {
        let (shutdown, rx) = watch::channel(false);
        let scheduler = Arc::new(self);

        let tasks = MaintenanceTask::ALL
            .into_iter()
            .filter(|task| *task != MaintenanceTask::CacheSweep || scheduler.cache.is_some())
            .map(|task| {
                let scheduler = Arc::clone(&scheduler);
                let rx = rx.clone();
                tokio::spawn(async move { scheduler.run_loop(task, rx).await })
            })
            .collect();

        tracing::info!(
            cleanup_interval = ?scheduler.config.cleanup_interval,
            health_check_interval = ?scheduler.config.health_check_interval,
            reconcile_interval = ?scheduler.config.reconcile_interval,
            "Maintenance loops started"
        );

        MaintenanceHandle { shutdown, tasks }
    }

    async fn run_loop(self: Arc<Self>, task: MaintenanceTask, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval(task));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.run_task(task).await {
                Ok(()) => {
                    counter!("taskline_maintenance_runs_total", "task" => task.as_str(), "result" => "ok").increment(1);
                }
                Err(e) => {
                    counter!("taskline_maintenance_runs_total", "task" => task.as_str(), "result" => "error").increment(1);
                    tracing::warn!(task = %task, error = %e, "Maintenance run failed");
                }
            }
        }

        tracing::debug!(task = %task, "Maintenance loop stopped");
    }
}
