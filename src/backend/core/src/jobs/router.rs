//! Priority routing.
//!
//! Maps a priority class to the broker queue it is dispatched on and to the
//! multiplier used for completion-time estimates. The estimate is display
//! only; nothing schedules on it.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::JobPriority;

/// Pure priority → queue / ETA mapping.
#[derive(Debug, Clone)]
pub struct PriorityRouter {
    queue_prefix: String,
    base_duration: Duration,
}

impl Default for PriorityRouter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl PriorityRouter {
    pub fn new(base_duration: Duration) -> Self {
        Self {
            queue_prefix: String::new(),
            base_duration,
        }
    }

    /// Prefix every queue name, e.g. `"billing."` → `"billing.high"`.
    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    /// Destination queue for a priority.
    pub fn queue_for(&self, priority: JobPriority) -> String {
        format!("{}{}", self.queue_prefix, base_queue_name(priority))
    }

    /// All queue names, most urgent first.
    pub fn queues(&self) -> Vec<String> {
        JobPriority::ALL.iter().map(|p| self.queue_for(*p)).collect()
    }

    /// Completion-time multiplier for a priority.
    pub fn completion_multiplier(&self, priority: JobPriority) -> f64 {
        match priority {
            JobPriority::Critical => 0.5,
            JobPriority::High => 0.75,
            JobPriority::Normal => 1.0,
            JobPriority::Low => 1.5,
            JobPriority::Bulk => 3.0,
        }
    }

    pub fn base_duration(&self) -> Duration {
        self.base_duration
    }

    /// `now + multiplier × base_duration`.
    pub fn estimate_completion(&self, priority: JobPriority, now: DateTime<Utc>) -> DateTime<Utc> {
        let millis = self.base_duration.as_millis() as f64 * self.completion_multiplier(priority);
        now + chrono::Duration::milliseconds(millis.round() as i64)
    }

    /// Priority served by a queue name, if it is one of ours.
    pub fn priority_for_queue(&self, queue: &str) -> Option<JobPriority> {
        let name = queue.strip_prefix(self.queue_prefix.as_str())?;
        JobPriority::ALL.into_iter().find(|p| base_queue_name(*p) == name)
    }
}

fn base_queue_name(priority: JobPriority) -> &'static str {
    match priority {
        JobPriority::Critical => "critical",
        JobPriority::High => "high",
        JobPriority::Normal => "normal",
        JobPriority::Low => "low",
        JobPriority::Bulk => "bulk",
    }
}
