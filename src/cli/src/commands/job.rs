//! Job commands: submit, status, cancel, retry and list.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tabled::Tabled;
use uuid::Uuid;

use taskline_core::jobs::SubmitParams;
use taskline_core::orchestrator::JobStatusView;
use taskline_core::Taskline;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct SubmitArgs {
    /// Registered handler name
    pub name: String,

    /// CRITICAL, HIGH, NORMAL, LOW or BULK
    #[arg(short, long, default_value = "NORMAL")]
    pub priority: String,

    /// Positional argument as JSON; repeat for more
    #[arg(short, long = "arg")]
    pub args: Vec<String>,

    /// Keyword arguments as a JSON object
    #[arg(short, long)]
    pub kwargs: Option<String>,

    #[arg(long)]
    pub owner: Option<String>,

    /// Time limit in seconds
    #[arg(long)]
    pub timeout: Option<i64>,

    #[arg(long)]
    pub max_retries: Option<i64>,

    /// Tag; repeat for more
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Serialize)]
struct Submitted {
    id: String,
    status: JobStatusView,
}

#[derive(Serialize)]
struct Changed {
    id: String,
    changed: bool,
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Priority")]
    priority: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Retries")]
    retries: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&JobStatusView> for JobRow {
    fn from(view: &JobStatusView) -> Self {
        Self {
            id: view.id.to_string()[..8].to_string(),
            name: view.name.clone(),
            priority: view.priority.to_string(),
            status: output::paint_status(view.status.as_str()),
            mode: output::or_dash(view.execution_mode.map(|m| m.as_str())),
            retries: format!("{}/{}", view.retry_count, view.max_retries),
            created_at: view.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

fn parse_args(raw: &[String]) -> Result<Vec<Value>> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).with_context(|| format!("--arg is not valid JSON: {}", arg)))
        .collect()
}

fn parse_kwargs(raw: Option<&str>) -> Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(raw).context("--kwargs is not valid JSON")? {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("--kwargs must be a JSON object"),
        },
    }
}

fn print_view(view: &JobStatusView) {
    output::print_header(&format!("Job: {}", view.id));
    output::print_detail("Name", &view.name);
    output::print_detail("Priority", view.priority.as_str());
    output::print_detail("Status", &output::paint_status(view.status.as_str()));
    output::print_detail("Queue", &view.queue);
    output::print_detail("Mode", &output::or_dash(view.execution_mode.map(|m| m.as_str())));
    output::print_detail("Retries", &format!("{}/{}", view.retry_count, view.max_retries));
    output::print_detail("Owner", &output::or_dash(view.owner_id.as_deref()));
    output::print_detail("Created", &view.created_at.to_rfc3339());
    output::print_detail("Started", &output::or_dash(view.started_at.map(|t| t.to_rfc3339())));
    output::print_detail("Completed", &output::or_dash(view.completed_at.map(|t| t.to_rfc3339())));
    if let Some(eta) = view.estimated_completion {
        output::print_detail("Estimated completion", &eta.to_rfc3339());
    }
    if !view.tags.is_empty() {
        output::print_detail("Tags", &view.tags.iter().cloned().collect::<Vec<_>>().join(", "));
    }
    if let Some(error) = &view.error_message {
        output::print_detail("Error", error);
    }
    if let Some(result) = &view.result {
        output::print_detail("Result", &result.to_string());
    }
}

pub async fn submit(args: SubmitArgs, service: &Taskline, format: OutputFormat) -> Result<()> {
    let params = SubmitParams {
        name: args.name,
        args: parse_args(&args.args)?,
        kwargs: parse_kwargs(args.kwargs.as_deref())?,
        priority: args.priority,
        owner_id: args.owner,
        timeout_seconds: args.timeout,
        max_retries: args.max_retries,
        tags: args.tags,
    };

    let id = service.orchestrator().submit_params(params).await?;
    let view = service.orchestrator().get_status(id).await?;

    match format {
        OutputFormat::Table => {
            output::print_success("Job submitted");
            print_view(&view);
        }
        _ => output::print_item(
            &Submitted {
                id: id.to_string(),
                status: view,
            },
            format,
        )?,
    }
    Ok(())
}

pub async fn status(id: Uuid, service: &Taskline, format: OutputFormat) -> Result<()> {
    let view = service.orchestrator().get_status(id.into()).await?;
    match format {
        OutputFormat::Table => print_view(&view),
        _ => output::print_item(&view, format)?,
    }
    Ok(())
}

pub async fn cancel(id: Uuid, force: bool, service: &Taskline, format: OutputFormat) -> Result<()> {
    let changed = service.orchestrator().cancel(id.into(), force).await?;
    match format {
        OutputFormat::Table if changed => output::print_success(&format!("Job {} cancelled", id)),
        OutputFormat::Table => output::print_warning(&format!("Job {} already finished", id)),
        _ => output::print_item(
            &Changed {
                id: id.to_string(),
                changed,
            },
            format,
        )?,
    }
    Ok(())
}

pub async fn retry(id: Uuid, delay_secs: u64, service: &Taskline, format: OutputFormat) -> Result<()> {
    let changed = service
        .orchestrator()
        .retry(id.into(), Duration::from_secs(delay_secs))
        .await?;
    match format {
        OutputFormat::Table if changed => output::print_success(&format!("Job {} scheduled for retry", id)),
        OutputFormat::Table => output::print_warning(&format!("Job {} cannot be retried", id)),
        _ => output::print_item(
            &Changed {
                id: id.to_string(),
                changed,
            },
            format,
        )?,
    }
    Ok(())
}

pub async fn list(owner: &str, service: &Taskline, format: OutputFormat) -> Result<()> {
    let views = service.orchestrator().list_jobs(owner).await?;
    let rows: Vec<JobRow> = views.iter().map(JobRow::from).collect();
    output::print_list(&rows, &views, format)
}
