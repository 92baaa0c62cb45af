//! Retention cleanup.

use anyhow::Result;
use serde::Serialize;

use taskline_core::Taskline;

use crate::output::{self, OutputFormat};

#[derive(Serialize)]
struct CleanupReport {
    deleted: u64,
    retention_hours: u64,
    retain_active: bool,
}

pub async fn execute(service: &Taskline, format: OutputFormat) -> Result<()> {
    let deleted = service.orchestrator().cleanup_expired().await?;
    let maintenance = &service.config().maintenance;

    match format {
        OutputFormat::Table => output::print_success(&format!(
            "Deleted {} job record(s) older than {} hour(s)",
            deleted, maintenance.retention_hours
        )),
        _ => output::print_item(
            &CleanupReport {
                deleted,
                retention_hours: maintenance.retention_hours,
                retain_active: maintenance.retain_active,
            },
            format,
        )?,
    }
    Ok(())
}
