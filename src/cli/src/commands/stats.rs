//! Per-priority queue statistics.

use anyhow::Result;
use tabled::Tabled;

use taskline_core::Taskline;

use crate::output::{self, OutputFormat};

#[derive(Tabled)]
struct StatsRow {
    #[tabled(rename = "Priority")]
    priority: String,
    #[tabled(rename = "Active")]
    active: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
    #[tabled(rename = "Avg time (s)")]
    avg_processing_time: String,
}

pub async fn execute(service: &Taskline, format: OutputFormat) -> Result<()> {
    let stats = service.orchestrator().get_queue_stats().await?;
    let rows: Vec<StatsRow> = stats
        .iter()
        .map(|(priority, s)| StatsRow {
            priority: priority.clone(),
            active: s.active,
            failed: s.failed,
            avg_processing_time: format!("{:.2}", s.avg_processing_time),
        })
        .collect();
    output::print_list(&rows, &stats, format)
}
