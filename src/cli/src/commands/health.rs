//! Health check command.
//!
//! Takes a fresh snapshot and displays component status.

use anyhow::Result;
use clap::Args;

use taskline_core::Taskline;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include detailed component checks
    #[arg(short, long)]
    pub detailed: bool,
}

pub async fn execute(args: HealthArgs, service: &Taskline, format: OutputFormat) -> Result<()> {
    let snapshot = service.health_snapshot().await;

    match format {
        OutputFormat::Table => {
            output::print_header("Taskline Health");
            output::print_detail("Status", &output::paint_status(snapshot.status.as_str()));
            output::print_detail("Broker available", &snapshot.broker_available.to_string());
            output::print_detail("Store available", &snapshot.store_available.to_string());
            output::print_detail("Execution mode", snapshot.execution_mode.as_str());
            output::print_detail("Checked at", &snapshot.checked_at.to_rfc3339());

            let c = &snapshot.counts;
            output::print_detail(
                "Jobs",
                &format!(
                    "{} total, {} pending, {} queued, {} running, {} retrying, {} succeeded, {} failed, {} timed out, {} cancelled",
                    c.total, c.pending, c.queued, c.running, c.retrying, c.succeeded, c.failed, c.timeout, c.cancelled
                ),
            );

            if args.detailed {
                output::print_header("Components");
                for component in &snapshot.components {
                    let mut line = output::paint_status(component.status.as_str());
                    if let Some(latency) = component.latency_ms {
                        line.push_str(&format!(" ({} ms)", latency));
                    }
                    if let Some(message) = component.error.as_ref().or(component.message.as_ref()) {
                        line.push_str(&format!(" {}", message));
                    }
                    output::print_detail(&component.name, &line);
                }
            }

            if snapshot.status.is_healthy() {
                output::print_success("All systems operational");
            } else if snapshot.status.is_operational() {
                output::print_warning(&format!("System status: {}", snapshot.status));
            } else {
                output::print_error(&format!("System status: {}", snapshot.status));
            }
        }
        _ => output::print_item(&snapshot, format)?,
    }

    Ok(())
}
