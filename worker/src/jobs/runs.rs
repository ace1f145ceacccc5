// JobRun audit trail - append-only record of every trigger outcome

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::scheduler::{JobError, JobResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
    SkippedOverlap,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Failure => "failure",
            JobOutcome::SkippedOverlap => "skipped_overlap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(JobOutcome::Success),
            "failure" => Some(JobOutcome::Failure),
            "skipped_overlap" => Some(JobOutcome::SkippedOverlap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: JobOutcome,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[async_trait]
pub trait RunLog: Send + Sync {
    /// Persists one completed run. Rows are never mutated afterwards.
    async fn record(&self, run: &JobRun) -> JobResult<()>;

    /// Runs for one job within a time range, newest first.
    async fn runs_for(
        &self,
        job_name: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> JobResult<Vec<JobRun>>;
}

pub struct PgRunLog {
    pool: PgPool,
}

impl PgRunLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct JobRunRow {
    id: Uuid,
    job_name: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    outcome: String,
    items_processed: i32,
    errors: Vec<String>,
    duration_ms: Option<i64>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = JobError;

    fn try_from(row: JobRunRow) -> Result<Self, Self::Error> {
        let outcome = JobOutcome::parse(&row.outcome)
            .ok_or_else(|| JobError::Execution(format!("unknown outcome '{}'", row.outcome)))?;

        Ok(JobRun {
            id: row.id,
            job_name: row.job_name,
            started_at: row.started_at,
            finished_at: row.finished_at,
            outcome,
            items_processed: row.items_processed,
            errors: row.errors,
            duration_ms: row.duration_ms,
        })
    }
}

#[async_trait]
impl RunLog for PgRunLog {
    async fn record(&self, run: &JobRun) -> JobResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_runs
            (id, job_name, started_at, finished_at, outcome, items_processed, errors, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.id)
        .bind(&run.job_name)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.outcome.as_str())
        .bind(run.items_processed)
        .bind(&run.errors)
        .bind(run.duration_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn runs_for(
        &self,
        job_name: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> JobResult<Vec<JobRun>> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            r#"
            SELECT id, job_name, started_at, finished_at, outcome,
                   items_processed, errors, duration_ms
            FROM job_runs
            WHERE job_name = $1 AND started_at >= $2 AND started_at < $3
            ORDER BY started_at DESC
            "#,
        )
        .bind(job_name)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRun::try_from).collect()
    }
}

pub struct MemoryRunLog {
    runs: Mutex<Vec<JobRun>>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn all(&self) -> Vec<JobRun> {
        self.runs.lock().await.clone()
    }
}

impl Default for MemoryRunLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunLog for MemoryRunLog {
    async fn record(&self, run: &JobRun) -> JobResult<()> {
        self.runs.lock().await.push(run.clone());
        Ok(())
    }

    async fn runs_for(
        &self,
        job_name: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> JobResult<Vec<JobRun>> {
        let mut runs: Vec<JobRun> = self
            .runs
            .lock()
            .await
            .iter()
            .filter(|run| {
                run.job_name == job_name && run.started_at >= since && run.started_at < until
            })
            .cloned()
            .collect();

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}
