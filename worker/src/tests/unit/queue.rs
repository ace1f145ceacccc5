// Work queue semantics: claim ordering, retry exhaustion, terminal-state
// immutability, and the reaper paths. Runs against the in-memory store with a
// manual clock; the Postgres store expresses the same transitions in SQL.

use chrono::Duration;

use crate::queue::{
    BackoffPolicy, ItemOutcome, MemoryWorkQueue, WorkKind, WorkQueue, WorkStatus,
};
use crate::tests::helpers::{email_payload, manual_clock};

fn queue_with_clock() -> (MemoryWorkQueue, std::sync::Arc<crate::clock::ManualClock>) {
    let clock = manual_clock();
    let queue = MemoryWorkQueue::with_clock(BackoffPolicy::Fixed { secs: 300 }, clock.clone());
    (queue, clock)
}

#[tokio::test]
async fn claim_takes_the_earliest_due_items_up_to_the_limit() {
    let (queue, clock) = queue_with_clock();

    // 120 items enqueued a second apart; the first 50 are the oldest due.
    let mut ids = Vec::new();
    for i in 0..120 {
        let id = queue
            .enqueue(WorkKind::Email, email_payload(&format!("u{}@example.com", i)), 3)
            .await
            .unwrap();
        ids.push(id);
        clock.advance(Duration::seconds(1));
    }

    let claimed = queue.claim_batch(WorkKind::Email, 50).await.unwrap();
    assert_eq!(claimed.len(), 50);

    let claimed_ids: Vec<_> = claimed.iter().map(|item| item.id).collect();
    assert_eq!(claimed_ids, ids[..50].to_vec());
    for item in &claimed {
        assert_eq!(item.status, WorkStatus::InFlight);
        assert!(item.claimed_at.is_some());
    }

    // A second claim never hands out items already in flight.
    let second = queue.claim_batch(WorkKind::Email, 200).await.unwrap();
    assert_eq!(second.len(), 70);
    for item in &second {
        assert!(!claimed_ids.contains(&item.id));
    }
}

#[tokio::test]
async fn claim_is_scoped_to_the_requested_kind() {
    let (queue, _clock) = queue_with_clock();

    queue
        .enqueue(WorkKind::Email, email_payload("a@example.com"), 3)
        .await
        .unwrap();
    queue
        .enqueue(WorkKind::Sms, serde_json::json!({"to": "+15550100", "message": "hi"}), 3)
        .await
        .unwrap();

    let claimed = queue.claim_batch(WorkKind::Sms, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].kind, WorkKind::Sms);
}

#[tokio::test]
async fn transient_failures_back_off_then_exhaust_to_failed_permanent() {
    let (queue, clock) = queue_with_clock();
    let id = queue
        .enqueue(WorkKind::Email, email_payload("a@example.com"), 3)
        .await
        .unwrap();

    for attempt in 1..=2 {
        let claimed = queue.claim_batch(WorkKind::Email, 10).await.unwrap();
        assert_eq!(claimed.len(), 1, "attempt {} should claim the item", attempt);

        let status = queue
            .report_result(id, ItemOutcome::TransientFailure("smtp 451".into()))
            .await
            .unwrap();
        assert_eq!(status, WorkStatus::Pending);

        // Not due again until the backoff elapses.
        assert!(queue.claim_batch(WorkKind::Email, 10).await.unwrap().is_empty());
        clock.advance(Duration::seconds(301));
    }

    // Third transient failure hits max_attempts.
    let claimed = queue.claim_batch(WorkKind::Email, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let status = queue
        .report_result(id, ItemOutcome::TransientFailure("smtp 451".into()))
        .await
        .unwrap();
    assert_eq!(status, WorkStatus::FailedPermanent);

    // No fourth attempt, not even through the retry claim.
    clock.advance(Duration::days(1));
    assert!(queue.claim_batch(WorkKind::Email, 10).await.unwrap().is_empty());
    assert!(queue.claim_retry_batch(WorkKind::Email, 10).await.unwrap().is_empty());

    let item = queue.get(id).await.unwrap();
    assert_eq!(item.attempt_count, 3);
    assert_eq!(item.last_error.as_deref(), Some("smtp 451"));
}

#[tokio::test]
async fn permanent_failure_skips_remaining_attempts() {
    let (queue, _clock) = queue_with_clock();
    let id = queue
        .enqueue(WorkKind::Email, email_payload("nobody"), 3)
        .await
        .unwrap();

    queue.claim_batch(WorkKind::Email, 1).await.unwrap();
    let status = queue
        .report_result(id, ItemOutcome::PermanentFailure("invalid recipient".into()))
        .await
        .unwrap();

    assert_eq!(status, WorkStatus::FailedPermanent);
    assert_eq!(queue.get(id).await.unwrap().attempt_count, 1);
}

#[tokio::test]
async fn terminal_states_never_change() {
    let (queue, _clock) = queue_with_clock();
    let id = queue
        .enqueue(WorkKind::Email, email_payload("a@example.com"), 3)
        .await
        .unwrap();

    queue.claim_batch(WorkKind::Email, 1).await.unwrap();
    queue.report_result(id, ItemOutcome::Succeeded).await.unwrap();

    // A late duplicate report is a no-op.
    let status = queue
        .report_result(id, ItemOutcome::TransientFailure("late".into()))
        .await
        .unwrap();
    assert_eq!(status, WorkStatus::Succeeded);

    let item = queue.get(id).await.unwrap();
    assert_eq!(item.status, WorkStatus::Succeeded);
    assert_eq!(item.attempt_count, 0);
    assert!(item.last_error.is_none());
}

#[tokio::test]
async fn retry_claim_only_returns_previously_attempted_items() {
    let (queue, clock) = queue_with_clock();

    let fresh = queue
        .enqueue(WorkKind::Email, email_payload("fresh@example.com"), 3)
        .await
        .unwrap();
    let retried = queue
        .enqueue(WorkKind::Email, email_payload("retried@example.com"), 3)
        .await
        .unwrap();

    queue.claim_batch(WorkKind::Email, 10).await.unwrap();
    queue.report_result(fresh, ItemOutcome::Succeeded).await.unwrap();
    queue
        .report_result(retried, ItemOutcome::TransientFailure("502".into()))
        .await
        .unwrap();
    clock.advance(Duration::seconds(301));

    let retry_batch = queue.claim_retry_batch(WorkKind::Email, 10).await.unwrap();
    assert_eq!(retry_batch.len(), 1);
    assert_eq!(retry_batch[0].id, retried);
}

#[tokio::test]
async fn reaper_returns_stuck_items_exactly_once() {
    let (queue, clock) = queue_with_clock();
    let id = queue
        .enqueue(WorkKind::Payment, serde_json::json!({"invoice_id": "x"}), 3)
        .await
        .unwrap();

    queue.claim_batch(WorkKind::Payment, 1).await.unwrap();

    // Within the claim window nothing is stuck.
    assert_eq!(queue.requeue_stuck(Duration::minutes(15)).await.unwrap(), 0);

    clock.advance(Duration::minutes(16));
    assert_eq!(queue.requeue_stuck(Duration::minutes(15)).await.unwrap(), 1);
    assert_eq!(queue.get(id).await.unwrap().status, WorkStatus::Pending);

    // A second sweep finds nothing left to requeue.
    assert_eq!(queue.requeue_stuck(Duration::minutes(15)).await.unwrap(), 0);

    // The item is claimable again and can still finish normally.
    let claimed = queue.claim_batch(WorkKind::Payment, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
}

#[tokio::test]
async fn prune_removes_only_aged_out_successes() {
    let (queue, clock) = queue_with_clock();

    let old_done = queue
        .enqueue(WorkKind::Email, email_payload("old@example.com"), 3)
        .await
        .unwrap();
    let old_pending = queue
        .enqueue(WorkKind::Sms, serde_json::json!({"to": "+1", "message": "m"}), 3)
        .await
        .unwrap();

    queue.claim_batch(WorkKind::Email, 1).await.unwrap();
    queue.report_result(old_done, ItemOutcome::Succeeded).await.unwrap();

    clock.advance(Duration::days(8));
    let fresh_done = queue
        .enqueue(WorkKind::Email, email_payload("new@example.com"), 3)
        .await
        .unwrap();
    queue.claim_batch(WorkKind::Email, 1).await.unwrap();
    queue.report_result(fresh_done, ItemOutcome::Succeeded).await.unwrap();

    assert_eq!(queue.prune_succeeded(Duration::days(7)).await.unwrap(), 1);
    assert!(queue.get(old_done).await.is_none());
    assert!(queue.get(old_pending).await.is_some());
    assert!(queue.get(fresh_done).await.is_some());

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.succeeded, 1);
}

#[tokio::test]
async fn prune_measures_retention_from_completion_not_enqueue() {
    let (queue, clock) = queue_with_clock();

    // Enqueued long before the retention window, but only just completed.
    let slow_finisher = queue
        .enqueue(WorkKind::Email, email_payload("slow@example.com"), 3)
        .await
        .unwrap();

    clock.advance(Duration::days(30));
    queue.claim_batch(WorkKind::Email, 1).await.unwrap();
    queue
        .report_result(slow_finisher, ItemOutcome::Succeeded)
        .await
        .unwrap();

    assert_eq!(queue.prune_succeeded(Duration::days(7)).await.unwrap(), 0);
    assert!(queue.get(slow_finisher).await.is_some());

    clock.advance(Duration::days(8));
    assert_eq!(queue.prune_succeeded(Duration::days(7)).await.unwrap(), 1);
    assert!(queue.get(slow_finisher).await.is_none());
}
