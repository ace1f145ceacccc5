// Maintenance job - hourly housekeeping over the shared worker tables:
// expired-lock sweep, stuck in_flight reaper, and succeeded-item pruning.

use chrono::Duration;
use tracing::{info, warn};

use crate::locks::LockStore;
use crate::queue::WorkQueue;

use super::scheduler::{JobReport, JobResult};
use super::WorkerContext;

pub async fn run(ctx: &WorkerContext) -> JobResult<JobReport> {
    let mut report = JobReport::default();

    let swept = ctx.locks.sweep_expired().await?;
    if swept > 0 {
        info!(swept, "Deleted expired lock records");
    }

    let requeued = ctx
        .queue
        .requeue_stuck(Duration::seconds(ctx.config.policy.claim_timeout_secs))
        .await?;
    if requeued > 0 {
        warn!(requeued, "Requeued work items stuck in_flight past the claim timeout");
    }

    let pruned = ctx
        .queue
        .prune_succeeded(Duration::days(ctx.config.policy.succeeded_retention_days))
        .await?;
    if pruned > 0 {
        info!(pruned, "Pruned succeeded work items past retention");
    }

    let counts = ctx.queue.counts().await?;
    info!(
        pending = counts.pending,
        in_flight = counts.in_flight,
        succeeded = counts.succeeded,
        failed_permanent = counts.failed_permanent,
        "Work queue totals"
    );
    if counts.failed_permanent > 0 {
        warn!(
            count = counts.failed_permanent,
            "Work items in failed_permanent awaiting operator review"
        );
    }

    report.items_processed = (swept + requeued + pruned) as i32;
    Ok(report)
}
