//! In-process broker.
//!
//! Implements the full transport contract on local data structures. Its
//! reachability and enqueue failures can be forced, which is how tests drive
//! the orchestrator down the fallback path.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use super::{Broker, BrokerState, BrokerTaskInfo, DispatchToken, Revocation, TaskMessage};
use crate::error::{Result, TasklineError};
use crate::jobs::JobId;

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<TaskMessage>>>,
    scheduled: Mutex<Vec<TaskMessage>>,
    states: DashMap<JobId, BrokerTaskInfo>,
    revoked: DashMap<JobId, Revocation>,
    unreachable: AtomicBool,
    fail_enqueue: AtomicBool,
    enqueued_total: AtomicU64,
    arrivals: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the broker were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make `enqueue` fail while `ping` keeps succeeding.
    pub fn set_fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    /// Messages currently waiting on `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map(VecDeque::len).unwrap_or(0)
    }

    /// Messages waiting for their eta.
    pub fn scheduled_len(&self) -> usize {
        self.scheduled.lock().len()
    }

    /// Successful enqueues since creation.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total.load(Ordering::Relaxed)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TasklineError::broker_unavailable("in-memory broker marked unreachable"));
        }
        Ok(())
    }

    fn push(&self, message: TaskMessage) {
        self.queues
            .lock()
            .entry(message.queue.clone())
            .or_default()
            .push_back(message);
        self.arrivals.notify_waiters();
    }

    fn pop(&self, queues: &[String]) -> Option<TaskMessage> {
        let mut guard = self.queues.lock();
        queues
            .iter()
            .find_map(|name| guard.get_mut(name).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, message: TaskMessage) -> Result<DispatchToken> {
        self.check_reachable()?;
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(TasklineError::broker("in-memory broker rejected the message"));
        }

        let job_id = message.job_id;
        let info = BrokerTaskInfo::new(BrokerState::Pending).with_retries(message.retries);
        self.states.insert(job_id, info);

        if message.is_due(Utc::now()) {
            self.push(message);
        } else {
            self.scheduled.lock().push(message);
        }
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        Ok(DispatchToken(job_id.to_string()))
    }

    async fn query_status(&self, job_id: JobId) -> Result<Option<BrokerTaskInfo>> {
        self.check_reachable()?;
        Ok(self.states.get(&job_id).map(|s| s.value().clone()))
    }

    async fn revoke(&self, job_id: JobId, force: bool) -> Result<()> {
        self.check_reachable()?;
        self.revoked.insert(
            job_id,
            Revocation {
                terminate: force,
                revoked_at: Utc::now(),
            },
        );

        let mut entry = self
            .states
            .entry(job_id)
            .or_insert_with(|| BrokerTaskInfo::new(BrokerState::Pending));
        if !entry.state.is_ready() {
            entry.state = BrokerState::Revoked;
            entry.completed_at = Some(Utc::now());
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn fetch(&self, queues: &[String], wait: Duration) -> Result<Option<TaskMessage>> {
        self.check_reachable()?;
        if let Some(message) = self.pop(queues) {
            return Ok(Some(message));
        }

        let arrived = self.arrivals.notified();
        tokio::pin!(arrived);
        arrived.as_mut().enable();
        if let Some(message) = self.pop(queues) {
            return Ok(Some(message));
        }

        let _ = tokio::time::timeout(wait, arrived).await;
        Ok(self.pop(queues))
    }

    async fn report(&self, job_id: JobId, info: BrokerTaskInfo) -> Result<()> {
        self.check_reachable()?;
        self.states.insert(job_id, info);
        Ok(())
    }

    async fn revocation(&self, job_id: JobId) -> Result<Option<Revocation>> {
        self.check_reachable()?;
        Ok(self.revoked.get(&job_id).map(|r| r.value().clone()))
    }

    async fn promote_due(&self) -> Result<usize> {
        self.check_reachable()?;
        let now = Utc::now();
        let due: Vec<TaskMessage> = {
            let mut scheduled = self.scheduled.lock();
            let (due, waiting): (Vec<_>, Vec<_>) = scheduled.drain(..).partition(|m| m.is_due(now));
            *scheduled = waiting;
            due
        };

        let promoted = due.len();
        for message in due {
            self.push(message);
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn message(queue: &str) -> TaskMessage {
        TaskMessage::new(JobId::new(), "noop", vec![], Map::new(), queue)
    }

    #[tokio::test]
    async fn test_fetch_respects_queue_order() {
        let broker = InMemoryBroker::new();
        let low = message("low");
        let critical = message("critical");
        broker.enqueue(low.clone()).await.unwrap();
        broker.enqueue(critical.clone()).await.unwrap();

        let queues = vec!["critical".to_string(), "low".to_string()];
        let first = broker.fetch(&queues, Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.job_id, critical.job_id);
        let second = broker.fetch(&queues, Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.job_id, low.job_id);
        assert!(broker.fetch(&queues, Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_arrival() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(message("normal")).await.unwrap();
        });

        let fetched = broker
            .fetch(&["normal".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        assert!(broker.ping().await.is_err());
        assert!(broker.enqueue(message("normal")).await.is_err());

        broker.set_reachable(true);
        broker.set_fail_enqueue(true);
        assert!(broker.ping().await.is_ok());
        assert!(broker.enqueue(message("normal")).await.is_err());
        assert_eq!(broker.enqueued_total(), 0);
    }

    #[tokio::test]
    async fn test_delayed_messages_are_promoted() {
        let broker = InMemoryBroker::new();
        let mut delayed = message("normal").with_countdown(Duration::from_secs(60));
        broker.enqueue(delayed.clone()).await.unwrap();
        assert_eq!(broker.scheduled_len(), 1);
        assert_eq!(broker.promote_due().await.unwrap(), 0);

        // Pretend the eta has passed.
        broker.scheduled.lock().clear();
        delayed.eta = Some(Utc::now() - chrono::Duration::seconds(1));
        broker.scheduled.lock().push(delayed);
        assert_eq!(broker.promote_due().await.unwrap(), 1);
        assert_eq!(broker.queue_len("normal"), 1);
    }

    #[tokio::test]
    async fn test_revoke_marks_state() {
        let broker = InMemoryBroker::new();
        let msg = message("normal");
        broker.enqueue(msg.clone()).await.unwrap();
        broker.revoke(msg.job_id, false).await.unwrap();

        let info = broker.query_status(msg.job_id).await.unwrap().unwrap();
        assert_eq!(info.state, BrokerState::Revoked);
        assert!(broker.is_revoked(msg.job_id).await.unwrap());
        assert!(!broker.revocation(msg.job_id).await.unwrap().unwrap().terminate);
    }
}
