//! Taskline CLI - local administration for Taskline job queues.
//!
//! Builds the same service the worker runs and calls its operations directly.

mod commands;
mod context;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use commands::{cleanup, health, job, stats};
use output::OutputFormat;

/// Taskline - priority job queue with broker dispatch and inline fallback
#[derive(Parser)]
#[command(
    name = "taskline",
    version,
    about = "Taskline - priority job queue administration",
    long_about = "Submit, inspect, cancel and retry Taskline jobs, and check queue health.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "TASKLINE_CONFIG")]
    config: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job
    Submit(job::SubmitArgs),

    /// Show a job's status
    Status {
        id: Uuid,
    },

    /// Cancel a job
    Cancel {
        id: Uuid,

        /// Also terminate a running attempt
        #[arg(short, long)]
        force: bool,
    },

    /// Retry a failed or timed out job
    Retry {
        id: Uuid,

        /// Seconds to wait before the next attempt
        #[arg(short, long, default_value = "0")]
        delay: u64,
    },

    /// List jobs submitted by an owner
    List {
        #[arg(long)]
        owner: String,
    },

    /// Per-priority queue statistics
    Stats,

    /// Check system health
    Health(health::HealthArgs),

    /// Delete job records past the retention age
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let result = run(cli, format).await;

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli, format: OutputFormat) -> Result<()> {
    let service = context::connect(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Submit(args) => job::submit(args, &service, format).await,
        Commands::Status { id } => job::status(id, &service, format).await,
        Commands::Cancel { id, force } => job::cancel(id, force, &service, format).await,
        Commands::Retry { id, delay } => job::retry(id, delay, &service, format).await,
        Commands::List { owner } => job::list(&owner, &service, format).await,
        Commands::Stats => stats::execute(&service, format).await,
        Commands::Health(args) => health::execute(args, &service, format).await,
        Commands::Cleanup => cleanup::execute(&service, format).await,
    }
}
