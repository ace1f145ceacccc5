// The lock-guarded dispatch path: overlap skipping, lock release across
// success and failure, and the run audit trail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;

use crate::jobs::scheduler::{run_guarded, JobError, JobReport};
use crate::jobs::{JobOutcome, MemoryRunLog};
use crate::locks::{LockStore, MemoryLockStore};
use crate::tests::helpers::recent_runs;

#[tokio::test]
async fn overlapping_trigger_is_skipped_without_running_the_body() {
    let locks = MemoryLockStore::new();
    let run_log = MemoryRunLog::new();
    let recent = recent_runs();

    // A prior run (another worker, say) still holds the lock.
    let _held = locks
        .acquire("billing-generation", Duration::seconds(3600))
        .await
        .unwrap()
        .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let ran_flag = ran.clone();
    let outcome = run_guarded(
        &locks,
        &run_log,
        &recent,
        "billing-generation",
        Duration::seconds(3600),
        async move {
            ran_flag.store(true, Ordering::SeqCst);
            Ok(JobReport::default())
        },
    )
    .await;

    assert_eq!(outcome, JobOutcome::SkippedOverlap);
    assert!(!ran.load(Ordering::SeqCst), "body must not run on a busy lock");

    let runs = run_log.all().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, JobOutcome::SkippedOverlap);
    assert_eq!(runs[0].items_processed, 0);
}

#[tokio::test]
async fn successful_run_releases_the_lock_for_the_next_tick() {
    let locks = MemoryLockStore::new();
    let run_log = MemoryRunLog::new();
    let recent = recent_runs();

    for _ in 0..2 {
        let outcome = run_guarded(
            &locks,
            &run_log,
            &recent,
            "session-sync",
            Duration::seconds(3600),
            async {
                Ok(JobReport {
                    items_processed: 5,
                    errors: Vec::new(),
                })
            },
        )
        .await;
        assert_eq!(outcome, JobOutcome::Success);
    }

    let runs = run_log.all().await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|run| run.outcome == JobOutcome::Success));
    assert!(runs.iter().all(|run| run.items_processed == 5));
}

#[tokio::test]
async fn body_error_records_a_failure_and_still_releases_the_lock() {
    let locks = MemoryLockStore::new();
    let run_log = MemoryRunLog::new();
    let recent = recent_runs();

    let outcome = run_guarded(
        &locks,
        &run_log,
        &recent,
        "email-dispatch",
        Duration::seconds(3600),
        async { Err(JobError::Execution("batch load failed".into())) },
    )
    .await;
    assert_eq!(outcome, JobOutcome::Failure);

    let runs = run_log.all().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, JobOutcome::Failure);
    assert!(runs[0].errors[0].contains("batch load failed"));

    // The lock must be free again after the failed run.
    let token = locks
        .acquire("email-dispatch", Duration::seconds(3600))
        .await
        .unwrap();
    assert!(token.is_some());
}

#[tokio::test]
async fn item_level_errors_still_count_as_a_completed_run() {
    let locks = MemoryLockStore::new();
    let run_log = MemoryRunLog::new();
    let recent = recent_runs();

    let outcome = run_guarded(
        &locks,
        &run_log,
        &recent,
        "overdue-notices",
        Duration::seconds(3600),
        async {
            Ok(JobReport {
                items_processed: 9,
                errors: vec!["sms send failed for one account".into()],
            })
        },
    )
    .await;

    assert_eq!(outcome, JobOutcome::Success);

    let runs = run_log.all().await;
    assert_eq!(runs[0].outcome, JobOutcome::Success);
    assert_eq!(runs[0].errors.len(), 1);
}

#[tokio::test]
async fn recent_runs_buffer_mirrors_the_run_log() {
    let locks = MemoryLockStore::new();
    let run_log = MemoryRunLog::new();
    let recent = recent_runs();

    run_guarded(
        &locks,
        &run_log,
        &recent,
        "maintenance",
        Duration::seconds(60),
        async { Ok(JobReport::default()) },
    )
    .await;

    let buffered = recent.read().await.clone();
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].job_name, "maintenance");
    assert_eq!(buffered[0].outcome, JobOutcome::Success);
    assert!(buffered[0].finished_at.is_some());
}
