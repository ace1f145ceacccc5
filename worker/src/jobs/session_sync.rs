// Session-sync job - one sync engine cycle over the active subscriber
// usernames.

use tracing::info;

use crate::sync::SyncEngine;

use super::scheduler::{JobReport, JobResult};
use super::WorkerContext;

pub async fn run(ctx: &WorkerContext) -> JobResult<JobReport> {
    let subjects: Vec<String> = sqlx::query_scalar(
        "SELECT radius_username FROM accounts WHERE status = 'active' ORDER BY radius_username",
    )
    .fetch_all(&ctx.db)
    .await?;

    let engine = SyncEngine::new(
        ctx.sync_store.clone(),
        ctx.sessions.clone(),
        ctx.events.clone(),
    );

    let sync_report = engine.run(&subjects).await?;

    info!(
        checked = sync_report.checked,
        changed = sync_report.changed,
        unchanged = sync_report.unchanged,
        failed = sync_report.failed,
        "Session sync cycle finished"
    );

    let mut report = JobReport {
        items_processed: sync_report.checked as i32,
        errors: Vec::new(),
    };
    if sync_report.failed > 0 {
        report.errors.push(format!(
            "{} subjects unreachable; retrying next cycle",
            sync_report.failed
        ));
    }

    Ok(report)
}
