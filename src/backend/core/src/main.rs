//! Taskline Worker - consumes broker queues and runs the maintenance loops.

use clap::Parser;

use taskline_core::{config::Config, jobs::JobRegistry, telemetry, Taskline};

#[derive(Parser, Debug)]
#[command(name = "taskline-worker")]
#[command(about = "Run Taskline jobs dispatched through the broker")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON); TASKLINE__* variables override it
    #[arg(short, long, env = "TASKLINE_CONFIG")]
    config: Option<String>,

    /// Concurrent jobs, overriding worker.concurrency
    #[arg(long)]
    concurrency: Option<usize>,

    /// Queues to consume in priority order, overriding worker.queues
    #[arg(long, value_delimiter = ',')]
    queues: Vec<String>,

    /// Do not run the cleanup, health, reconcile and cache loops
    #[arg(long)]
    no_maintenance: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if !args.queues.is_empty() {
        config.worker.queues = args.queues.clone();
    }

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %config.worker.name,
        concurrency = config.worker.concurrency,
        queues = ?config.worker.queues,
        "Starting Taskline worker"
    );

    let service = Taskline::connect(config, JobRegistry::with_builtins()).await?;

    let worker = service.worker().start();
    let maintenance = if args.no_maintenance {
        None
    } else {
        Some(service.maintenance().start())
    };

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    worker.shutdown();
    if let Some(maintenance) = &maintenance {
        maintenance.shutdown();
    }

    let stats = worker.stats().clone();
    worker.join().await;
    if let Some(maintenance) = maintenance {
        maintenance.join().await;
    }

    tracing::info!(
        processed = stats.processed(),
        succeeded = stats.succeeded(),
        failed = stats.failed(),
        retried = stats.retried(),
        "Worker shutdown complete"
    );
    telemetry.shutdown();

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
