//! PostgreSQL job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{JobStore, PriorityStats};
use crate::config::StoreConfig;
use crate::error::{Result, TasklineError};
use crate::jobs::{Job, JobId, JobPriority, JobStatus};

const JOB_COLUMNS: &str = r#"
    id, name, args, kwargs, priority, status, queue, execution_mode, dispatch_token,
    created_at, started_at, completed_at, updated_at, retry_count, max_retries,
    timeout_seconds, owner_id, error_message, error_trace, result, tags, version
"#;

/// Job store backed by a `jobs` table.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Open a connection pool against `config.url`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| TasklineError::configuration("store.url is required for the PostgreSQL store"))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await?;

        tracing::info!(max_connections = config.max_connections, "Connected to job store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, id: JobId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn insert(&self, job: &Job) -> Result<Job> {
        let sql = format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, 1)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = bind_job(sqlx::query_as::<_, JobRow>(&sql), job)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn compare_and_set(&self, job: &Job) -> Result<Job> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET name = $2, args = $3, kwargs = $4, priority = $5, status = $6, queue = $7,
                execution_mode = $8, dispatch_token = $9, created_at = $10, started_at = $11,
                completed_at = $12, updated_at = $13, retry_count = $14, max_retries = $15,
                timeout_seconds = $16, owner_id = $17, error_message = $18, error_trace = $19,
                result = $20, tags = $21, version = version + 1
            WHERE id = $1 AND version = $22
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = bind_job(sqlx::query_as::<_, JobRow>(&sql), job)
            .bind(job.version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None if self.exists(job.id).await? => {
                Err(TasklineError::concurrent_modification(job.id, job.version))
            }
            None => Err(TasklineError::job_not_found(job.id)),
        }
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = $1 ORDER BY created_at DESC");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn list_active(&self, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status IN ('PENDING', 'QUEUED', 'RUNNING', 'RETRYING')
            ORDER BY created_at
            LIMIT $1
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(status.parse::<JobStatus>()?, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn stats_by_priority(&self) -> Result<HashMap<JobPriority, PriorityStats>> {
        let rows = sqlx::query_as::<_, PriorityStatsRow>(
            r#"
            SELECT
                priority,
                COUNT(*) FILTER (WHERE status IN ('PENDING', 'QUEUED', 'RUNNING', 'RETRYING')) AS active,
                COUNT(*) FILTER (WHERE status IN ('FAILED', 'TIMEOUT')) AS failed,
                AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))::float8 AS avg_processing_time
            FROM jobs
            GROUP BY priority
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let priority = priority_from_ordinal(row.priority)?;
                Ok((
                    priority,
                    PriorityStats {
                        active: row.active.max(0) as u64,
                        failed: row.failed.max(0) as u64,
                        avg_processing_time: row.avg_processing_time.unwrap_or(0.0),
                    },
                ))
            })
            .collect()
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>, terminal_only: bool) -> Result<u64> {
        let result = if terminal_only {
            sqlx::query(
                r#"
                DELETE FROM jobs
                WHERE created_at < $1
                  AND status IN ('SUCCESS', 'FAILED', 'CANCELLED', 'TIMEOUT')
                "#,
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("DELETE FROM jobs WHERE created_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

type JobQuery<'q> = sqlx::query::QueryAs<'q, sqlx::Postgres, JobRow, sqlx::postgres::PgArguments>;

/// Bind `$1..$21` in `JOB_COLUMNS` order, version excluded.
fn bind_job<'q>(query: JobQuery<'q>, job: &'q Job) -> JobQuery<'q> {
    query
        .bind(job.id.0)
        .bind(&job.name)
        .bind(Value::Array(job.args.clone()))
        .bind(Value::Object(job.kwargs.clone()))
        .bind(job.priority.ordinal() as i16)
        .bind(job.status.as_str())
        .bind(&job.queue)
        .bind(job.execution_mode.map(|m| m.as_str()))
        .bind(job.dispatch_token.as_deref())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.timeout_seconds as i64)
        .bind(job.owner_id.as_deref())
        .bind(job.error_message.as_deref())
        .bind(job.error_trace.as_deref())
        .bind(job.result.clone())
        .bind(job.tags.iter().cloned().collect::<Vec<String>>())
}

#[derive(Debug, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub name: String,
    pub args: Value,
    pub kwargs: Value,
    pub priority: i16,
    pub status: String,
    pub queue: String,
    pub execution_mode: Option<String>,
    pub dispatch_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_seconds: i64,
    pub owner_id: Option<String>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub result: Option<Value>,
    pub tags: Vec<String>,
    pub version: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = TasklineError;

    fn try_from(row: JobRow) -> Result<Self> {
        let args = match row.args {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let kwargs = match row.kwargs {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Ok(Job {
            id: JobId(row.id),
            name: row.name,
            args,
            kwargs,
            priority: priority_from_ordinal(row.priority)?,
            status: row.status.parse()?,
            queue: row.queue,
            execution_mode: row.execution_mode.map(|m| m.parse()).transpose()?,
            dispatch_token: row.dispatch_token,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            timeout_seconds: row.timeout_seconds.max(0) as u64,
            owner_id: row.owner_id,
            error_message: row.error_message,
            error_trace: row.error_trace,
            result: row.result,
            tags: row.tags.into_iter().collect(),
            version: row.version,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PriorityStatsRow {
    priority: i16,
    active: i64,
    failed: i64,
    avg_processing_time: Option<f64>,
}

fn priority_from_ordinal(ordinal: i16) -> Result<JobPriority> {
    JobPriority::ALL
        .into_iter()
        .find(|p| p.ordinal() as i16 == ordinal)
        .ok_or_else(|| TasklineError::store(format!("stored priority {} is out of range", ordinal)))
}
