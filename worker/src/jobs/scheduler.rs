// Job Scheduler / Dispatcher - cadences, mutual exclusion, and run audit
//
// Each job walks the same state machine: acquire the lock named after the
// job, run the body, record the JobRun, release the lock. Busy means a prior
// run (possibly in another worker process) is still active; the tick is
// recorded as skipped_overlap and dropped.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::locks::{LockError, LockStore};
use crate::queue::{QueueError, WorkKind};
use crate::sync::SyncError;

use super::runs::{JobOutcome, JobRun, RunLog};
use super::{
    billing, dispatch, maintenance, notices, session_sync, WorkerContext, BILLING_GENERATION,
    EMAIL_DISPATCH, EMAIL_RETRY, JOB_NAMES, MAINTENANCE, OVERDUE_NOTICES, PAYMENT_PROCESSING,
    SESSION_SYNC, SMS_DISPATCH,
};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Job execution error: {0}")]
    Execution(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type JobResult<T> = Result<T, JobError>;

/// What a job body hands back: how much it processed and the item-level
/// errors it isolated along the way. A non-empty error list still counts as
/// a completed run (outcome=success); only a body-level error is a failure.
#[derive(Debug, Default)]
pub struct JobReport {
    pub items_processed: i32,
    pub errors: Vec<String>,
}

pub type RecentRuns = Arc<RwLock<Vec<JobRun>>>;

const RECENT_RUNS_CAP: usize = 100;

/// The lock-guarded dispatch path every trigger goes through.
pub async fn run_guarded<F>(
    locks: &dyn LockStore,
    run_log: &dyn RunLog,
    recent: &RecentRuns,
    job_name: &str,
    ttl: Duration,
    body: F,
) -> JobOutcome
where
    F: Future<Output = JobResult<JobReport>>,
{
    let started_at = Utc::now();

    let token = match locks.acquire(job_name, ttl).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            info!(job = job_name, "Previous run still holds the lock; skipping this tick");
            let run = JobRun {
                id: Uuid::new_v4(),
                job_name: job_name.to_string(),
                started_at,
                finished_at: Some(started_at),
                outcome: JobOutcome::SkippedOverlap,
                items_processed: 0,
                errors: Vec::new(),
                duration_ms: Some(0),
            };
            record_run(run_log, recent, run).await;
            return JobOutcome::SkippedOverlap;
        }
        Err(e) => {
            error!(job = job_name, error = %e, "Lock acquisition failed");
            let run = JobRun {
                id: Uuid::new_v4(),
                job_name: job_name.to_string(),
                started_at,
                finished_at: Some(started_at),
                outcome: JobOutcome::Failure,
                items_processed: 0,
                errors: vec![format!("lock acquisition failed: {}", e)],
                duration_ms: Some(0),
            };
            record_run(run_log, recent, run).await;
            return JobOutcome::Failure;
        }
    };

    let result = body.await;

    // Guaranteed-cleanup path: the lock is released whatever the body did.
    // If release itself fails the TTL reclaims the lock.
    match locks.release(job_name, &token).await {
        Ok(true) => {}
        Ok(false) => warn!(job = job_name, "Lock was no longer held at release (TTL expired mid-run?)"),
        Err(e) => warn!(job = job_name, error = %e, "Lock release failed; TTL will reclaim it"),
    }

    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_milliseconds();

    let run = match result {
        Ok(report) => {
            info!(
                job = job_name,
                items = report.items_processed,
                item_errors = report.errors.len(),
                duration_ms,
                "Job completed"
            );
            JobRun {
                id: Uuid::new_v4(),
                job_name: job_name.to_string(),
                started_at,
                finished_at: Some(finished_at),
                outcome: JobOutcome::Success,
                items_processed: report.items_processed,
                errors: report.errors,
                duration_ms: Some(duration_ms),
            }
        }
        Err(e) => {
            error!(job = job_name, error = %e, duration_ms, "Job failed; next cadence tick retries");
            JobRun {
                id: Uuid::new_v4(),
                job_name: job_name.to_string(),
                started_at,
                finished_at: Some(finished_at),
                outcome: JobOutcome::Failure,
                items_processed: 0,
                errors: vec![e.to_string()],
                duration_ms: Some(duration_ms),
            }
        }
    };

    let outcome = run.outcome;
    record_run(run_log, recent, run).await;
    outcome
}

async fn record_run(run_log: &dyn RunLog, recent: &RecentRuns, run: JobRun) {
    if let Err(e) = run_log.record(&run).await {
        error!(job = %run.job_name, error = %e, "Could not persist job run");
    }

    let mut runs = recent.write().await;
    runs.push(run);
    if runs.len() > RECENT_RUNS_CAP {
        runs.remove(0);
    }
}

async fn execute_body(ctx: &WorkerContext, job_name: &str) -> JobResult<JobReport> {
    match job_name {
        BILLING_GENERATION => billing::run(ctx).await,
        OVERDUE_NOTICES => notices::run(ctx).await,
        EMAIL_DISPATCH => {
            dispatch::run(
                ctx,
                WorkKind::Email,
                &ctx.email,
                ctx.config.policy.email_batch_size,
                false,
            )
            .await
        }
        EMAIL_RETRY => {
            dispatch::run(
                ctx,
                WorkKind::Email,
                &ctx.email,
                ctx.config.policy.email_retry_batch_size,
                true,
            )
            .await
        }
        SMS_DISPATCH => {
            dispatch::run(
                ctx,
                WorkKind::Sms,
                &ctx.sms,
                ctx.config.policy.sms_batch_size,
                false,
            )
            .await
        }
        PAYMENT_PROCESSING => {
            dispatch::run(
                ctx,
                WorkKind::Payment,
                &ctx.payment,
                ctx.config.policy.payment_batch_size,
                false,
            )
            .await
        }
        SESSION_SYNC => session_sync::run(ctx).await,
        MAINTENANCE => maintenance::run(ctx).await,
        other => Err(JobError::Config(format!("Unknown job: {}", other))),
    }
}

/// One trigger of a named job through the guarded path.
pub async fn trigger(ctx: Arc<WorkerContext>, recent: RecentRuns, job_name: &str) -> JobOutcome {
    let ttl = Duration::seconds(ctx.config.policy.lock_ttl_secs);
    run_guarded(
        ctx.locks.as_ref(),
        ctx.run_log.as_ref(),
        &recent,
        job_name,
        ttl,
        execute_body(&ctx, job_name),
    )
    .await
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    ctx: Arc<WorkerContext>,
    recent: RecentRuns,
}

impl JobScheduler {
    pub async fn new(ctx: Arc<WorkerContext>) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            ctx,
            recent: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!(worker_id = %self.ctx.worker_id, "Starting background job scheduler");

        let schedule = &self.ctx.config.schedule;
        self.add_job(BILLING_GENERATION, daily_cron(schedule.billing_hour)).await?;
        self.add_job(OVERDUE_NOTICES, daily_cron(schedule.notice_hour)).await?;
        self.add_job(EMAIL_DISPATCH, minutes_cron(schedule.email_dispatch_minutes)).await?;
        self.add_job(EMAIL_RETRY, minutes_cron(schedule.email_retry_minutes)).await?;
        self.add_job(SMS_DISPATCH, minutes_cron(schedule.sms_dispatch_minutes)).await?;
        self.add_job(PAYMENT_PROCESSING, minutes_cron(schedule.payment_minutes)).await?;
        self.add_job(SESSION_SYNC, minutes_cron(schedule.sync_minutes)).await?;
        self.add_job(MAINTENANCE, minutes_cron(schedule.maintenance_minutes)).await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started");
        Ok(())
    }

    async fn add_job(&self, name: &'static str, cron: String) -> JobResult<()> {
        let ctx = self.ctx.clone();
        let recent = self.recent.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let ctx = ctx.clone();
            let recent = recent.clone();

            Box::pin(async move {
                trigger(ctx, recent, name).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!(job = name, cron = %cron, "Scheduled job");

        Ok(())
    }

    /// Manual trigger for operators; runs through the same lock-guarded path
    /// as a cadence tick.
    pub async fn run_job_now(&self, job_name: &str) -> JobResult<JobOutcome> {
        if !JOB_NAMES.contains(&job_name) {
            return Err(JobError::Config(format!("Unknown job: {}", job_name)));
        }

        Ok(trigger(self.ctx.clone(), self.recent.clone(), job_name).await)
    }

    pub async fn recent_runs(&self) -> Vec<JobRun> {
        self.recent.read().await.clone()
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }
}

/// Six-field cron for "every N minutes"; N of an hour or more degrades to an
/// hourly tick (cron's */N minute field cannot express it).
fn minutes_cron(minutes: u32) -> String {
    if minutes == 0 || minutes >= 60 {
        "0 0 * * * *".to_string()
    } else {
        format!("0 */{} * * * *", minutes)
    }
}

fn daily_cron(hour: u32) -> String {
    format!("0 0 {} * * *", hour.min(23))
}
