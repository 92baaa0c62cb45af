//! Bounded, circuit-guarded access to a broker transport.

use metrics::counter;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{Broker, BrokerTaskInfo, CircuitBreaker, CircuitSnapshot, DispatchToken, TaskMessage};
use crate::config::BrokerConfig;
use crate::error::{Result, TasklineError};
use crate::jobs::JobId;

/// Result of the availability ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// The ping succeeded within its timeout
    Reachable,
    /// The ping failed, timed out, or the circuit is open
    Unreachable,
    /// `always_inline` is configured; the broker was not pinged
    InlineOverride,
}

impl Availability {
    /// `true` for `Reachable` and for the `InlineOverride` policy signal.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Reachable | Self::InlineOverride)
    }

    /// Whether jobs should be dispatched to the broker.
    pub fn use_broker(&self) -> bool {
        matches!(self, Self::Reachable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reachable => "reachable",
            Self::Unreachable => "unreachable",
            Self::InlineOverride => "inline_override",
        }
    }
}

/// The orchestrator's handle on the broker.
///
/// Every call is bounded: the ping by `ping_timeout`, everything else by
/// `connect_timeout`. A timeout surfaces as `BrokerUnavailable`.
pub struct BrokerClient {
    transport: Arc<dyn Broker>,
    connect_timeout: Duration,
    ping_timeout: Duration,
    always_inline: bool,
    breaker: CircuitBreaker,
}

impl BrokerClient {
    pub fn new(transport: Arc<dyn Broker>, config: &BrokerConfig) -> Self {
        Self {
            transport,
            connect_timeout: config.connect_timeout,
            ping_timeout: config.ping_timeout,
            always_inline: config.always_inline,
            breaker: CircuitBreaker::new(config.circuit_breaker_threshold)
                .with_recovery_timeout(config.circuit_breaker_recovery),
        }
    }

    pub fn with_always_inline(mut self, always_inline: bool) -> Self {
        self.always_inline = always_inline;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Broker> {
        &self.transport
    }

    pub fn always_inline(&self) -> bool {
        self.always_inline
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Ping the broker. Never fails.
    pub async fn availability(&self) -> Availability {
        if self.always_inline {
            return Availability::InlineOverride;
        }
        if !self.breaker.can_execute() {
            counter!("taskline_broker_ping_total", "result" => "circuit_open").increment(1);
            return Availability::Unreachable;
        }

        match tokio::time::timeout(self.ping_timeout, self.transport.ping()).await {
            Ok(Ok(())) => {
                counter!("taskline_broker_ping_total", "result" => "reachable").increment(1);
                Availability::Reachable
            }
            Ok(Err(e)) => {
                counter!("taskline_broker_ping_total", "result" => "error").increment(1);
                self.breaker.record_failure();
                tracing::warn!(broker = self.transport.name(), error = %e, "Broker ping failed");
                Availability::Unreachable
            }
            Err(_) => {
                counter!("taskline_broker_ping_total", "result" => "timeout").increment(1);
                self.breaker.record_failure();
                tracing::warn!(
                    broker = self.transport.name(),
                    timeout_ms = self.ping_timeout.as_millis() as u64,
                    "Broker ping timed out"
                );
                Availability::Unreachable
            }
        }
    }

    /// `true` when the broker answered the ping, and unconditionally when
    /// `always_inline` is set.
    pub async fn is_available(&self) -> bool {
        self.availability().await.is_available()
    }

    pub async fn enqueue(&self, message: TaskMessage) -> Result<DispatchToken> {
        let job_id = message.job_id;
        let result = self.bounded("enqueue", self.transport.enqueue(message)).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                self.breaker.record_failure();
                tracing::warn!(job_id = %job_id, error = %e, "Broker enqueue failed");
            }
        }
        result
    }

    pub async fn query_status(&self, job_id: JobId) -> Result<Option<BrokerTaskInfo>> {
        self.bounded("query_status", self.transport.query_status(job_id)).await
    }

    /// Best-effort revoke; see [`Broker::revoke`].
    pub async fn revoke(&self, job_id: JobId, force: bool) -> Result<()> {
        self.bounded("revoke", self.transport.revoke(job_id, force)).await
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.connect_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TasklineError::broker_unavailable(format!(
                "broker {} exceeded {:?}",
                operation, self.connect_timeout
            ))),
        }
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("transport", &self.transport.name())
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_timeout", &self.ping_timeout)
            .field("always_inline", &self.always_inline)
            .field("circuit", &self.breaker.state())
            .finish()
    }
}
