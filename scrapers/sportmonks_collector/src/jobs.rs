//! One `etl_jobs` row per finished run, built from its [`RunSummary`].

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{postgres::PgPool, types::Json};
use std::{fmt, sync::Mutex};
use tracing::{debug, info};

use crate::error::Result;
use crate::pipeline::{RunState, RunSummary};
use crate::types::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_name: String,
    /// `sync` or `enrich`.
    pub job_type: String,
    pub entity_type: EntityType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Logical upstream requests (pages or id batches); retries are not
    /// counted.
    pub api_requests_made: u64,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_failed: u64,
    pub error_message: Option<String>,
    pub input_parameters: Value,
    pub output_summary: Value,
}

impl JobRecord {
    pub fn from_summary(job_type: &str, summary: &RunSummary, input_parameters: Value) -> Self {
        let completed_at = Utc::now();
        let elapsed = Duration::from_std(summary.elapsed).unwrap_or(Duration::zero());

        let status = match summary.state {
            _ if summary.is_failure() => JobStatus::Failed,
            RunState::Interrupted => JobStatus::Cancelled,
            _ => JobStatus::Completed,
        };
        let error_message = summary.abort_reason.clone().or_else(|| {
            (summary.batches_errored > 0).then(|| format!("{} batches failed", summary.batches_errored))
        });

        Self {
            job_name: format!("{} {}", job_type, summary.entity_type),
            job_type: job_type.to_string(),
            entity_type: summary.entity_type,
            status,
            started_at: completed_at - elapsed,
            completed_at,
            duration_seconds: summary.elapsed.as_secs_f64(),
            api_requests_made: summary.batches_attempted,
            records_processed: summary.records_fetched,
            records_inserted: summary.report.inserted,
            records_updated: summary.report.updated,
            records_failed: summary.report.errored,
            error_message,
            input_parameters,
            output_summary: serde_json::to_value(summary).unwrap_or(Value::Null),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait JobLog {
    async fn record(&self, job: &JobRecord) -> Result<()>;
}

fn as_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Job records in the `etl_jobs` table.
#[derive(Clone)]
pub struct PgJobLog {
    pool: PgPool,
}

impl PgJobLog {
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS etl_jobs (
                id BIGSERIAL PRIMARY KEY,
                job_name TEXT NOT NULL,
                job_type TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ NOT NULL,
                duration_seconds DOUBLE PRECISION NOT NULL,
                api_requests_made BIGINT NOT NULL DEFAULT 0,
                records_processed BIGINT NOT NULL DEFAULT 0,
                records_inserted BIGINT NOT NULL DEFAULT 0,
                records_updated BIGINT NOT NULL DEFAULT 0,
                records_failed BIGINT NOT NULL DEFAULT 0,
                error_message TEXT,
                input_parameters JSONB NOT NULL DEFAULT '{}',
                output_summary JSONB NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

impl JobLog for PgJobLog {
    async fn record(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO etl_jobs (
                job_name, job_type, entity_type, status, started_at, completed_at, duration_seconds,
                api_requests_made, records_processed, records_inserted, records_updated, records_failed,
                error_message, input_parameters, output_summary
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&job.job_name)
        .bind(&job.job_type)
        .bind(job.entity_type.as_str())
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.duration_seconds)
        .bind(as_i64(job.api_requests_made))
        .bind(as_i64(job.records_processed))
        .bind(as_i64(job.records_inserted))
        .bind(as_i64(job.records_updated))
        .bind(as_i64(job.records_failed))
        .bind(job.error_message.as_deref())
        .bind(Json(&job.input_parameters))
        .bind(Json(&job.output_summary))
        .execute(&self.pool)
        .await?;

        info!("Recorded {} job '{}' as {}", job.job_type, job.job_name, job.status);
        Ok(())
    }
}

/// Keeps records in process, for dry runs.
#[derive(Debug, Default)]
pub struct MemoryJobLog {
    jobs: Mutex<Vec<JobRecord>>,
}

impl MemoryJobLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl JobLog for MemoryJobLog {
    async fn record(&self, job: &JobRecord) -> Result<()> {
        debug!("Job '{}' finished as {}", job.job_name, job.status);
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(job.clone());
        Ok(())
    }
}
