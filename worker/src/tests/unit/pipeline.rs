// Notification pipeline: per-account isolation, retry queueing, missing
// contact handling, disconnection, and the deferred-notice path.

use std::sync::Arc;

use uplink_shared::NoticeKind;

use crate::config::AttachmentPolicy;
use crate::gateways::GatewayError;
use crate::notify::{NoticePayload, NotificationPipeline};
use crate::queue::{
    BackoffPolicy, ItemOutcome, MemoryWorkQueue, WorkKind, WorkQueue, WorkStatus,
};
use crate::tests::fixtures::{overdue_account, FakeGateway, FakeRadius, FakeRenderer};
use crate::tests::helpers::thresholds;

struct Harness {
    queue: Arc<MemoryWorkQueue>,
    email: Arc<FakeGateway>,
    sms: Arc<FakeGateway>,
    radius: Arc<FakeRadius>,
    renderer: Arc<FakeRenderer>,
}

impl Harness {
    fn new() -> Self {
        Self {
            queue: Arc::new(MemoryWorkQueue::new(BackoffPolicy::Fixed { secs: 300 })),
            email: FakeGateway::succeeding(WorkKind::Email),
            sms: FakeGateway::succeeding(WorkKind::Sms),
            radius: FakeRadius::succeeding(),
            renderer: FakeRenderer::succeeding(),
        }
    }

    fn pipeline(&self, policy: AttachmentPolicy) -> NotificationPipeline {
        NotificationPipeline::new(
            self.queue.clone(),
            self.email.clone(),
            self.sms.clone(),
            self.radius.clone(),
            self.renderer.clone(),
            thresholds(),
            policy,
            3,
        )
    }
}

#[tokio::test]
async fn one_failing_channel_never_stops_the_batch() {
    let mut harness = Harness::new();
    // Second SMS send fails transiently; everything else succeeds.
    harness.sms = FakeGateway::scripted(
        WorkKind::Sms,
        vec![
            Ok(Default::default()),
            Err(GatewayError::Http { status: 503 }),
            Ok(Default::default()),
        ],
    );
    let pipeline = harness.pipeline(AttachmentPolicy::Skip);

    let accounts = vec![
        overdue_account("Alice", 3),
        overdue_account("Bob", 3),
        overdue_account("Carol", 3),
    ];
    let report = pipeline.run(accounts).await;

    assert_eq!(report.accounts_processed, 3);
    assert_eq!(report.sms_sent, 2);
    assert_eq!(report.emails_sent, 3);
    assert_eq!(report.retries_enqueued, 1);
    assert_eq!(report.notified.len(), 3);

    // Exactly one retry item, and it is the failed SMS.
    let queued = harness.queue.claim_batch(WorkKind::Sms, 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert!(harness.queue.claim_batch(WorkKind::Email, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn queued_sms_retry_is_drained_by_the_sms_claim_cycle() {
    let mut harness = Harness::new();
    harness.sms = FakeGateway::scripted(
        WorkKind::Sms,
        vec![Err(GatewayError::Timeout)],
    );
    let pipeline = harness.pipeline(AttachmentPolicy::Skip);

    let report = pipeline.run(vec![overdue_account("Alice", 3)]).await;
    assert_eq!(report.retries_enqueued, 1);

    // The sms-dispatch cycle claims kind=sms; after a successful send and
    // report, nothing is left pending for any kind.
    let claimed = harness.queue.claim_batch(WorkKind::Sms, 50).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let status = harness
        .queue
        .report_result(claimed[0].id, ItemOutcome::Succeeded)
        .await
        .unwrap();
    assert_eq!(status, WorkStatus::Succeeded);

    let counts = harness.queue.counts().await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.in_flight, 0);
}

#[tokio::test]
async fn data_errors_are_not_queued_for_retry() {
    let mut harness = Harness::new();
    harness.email = FakeGateway::scripted(
        WorkKind::Email,
        vec![Err(GatewayError::Data("invalid recipient".into()))],
    );
    let pipeline = harness.pipeline(AttachmentPolicy::Skip);

    let report = pipeline.run(vec![overdue_account("Alice", 1)]).await;

    assert_eq!(report.emails_sent, 0);
    assert_eq!(report.retries_enqueued, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(harness.queue.claim_batch(WorkKind::Email, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_contact_is_logged_not_retried() {
    let harness = Harness::new();
    let pipeline = harness.pipeline(AttachmentPolicy::Skip);

    let mut account = overdue_account("Alice", 3);
    account.phone = None;
    let report = pipeline.run(vec![account]).await;

    assert_eq!(report.sms_sent, 0);
    assert_eq!(report.emails_sent, 1);
    assert_eq!(report.retries_enqueued, 0);
    assert!(report.errors[0].contains("no phone"));
    assert_eq!(harness.sms.sent_count().await, 0);
}

#[tokio::test]
async fn accounts_off_threshold_are_skipped_entirely() {
    let harness = Harness::new();
    let pipeline = harness.pipeline(AttachmentPolicy::Skip);

    // Day 2 is not a reminder day, and a day-3 reminder was already sent.
    let off_day = overdue_account("Alice", 2);
    let mut deduped = overdue_account("Bob", 3);
    deduped.last_notice_days = Some(3);

    let report = pipeline.run(vec![off_day, deduped]).await;

    assert_eq!(report.accounts_processed, 0);
    assert_eq!(harness.email.sent_count().await, 0);
    assert_eq!(harness.sms.sent_count().await, 0);
}

#[tokio::test]
async fn disconnection_notice_disconnects_the_session() {
    let harness = Harness::new();
    let pipeline = harness.pipeline(AttachmentPolicy::Skip);

    let account = overdue_account("Alice", 20);
    let account_id = account.account_id;
    let report = pipeline.run(vec![account]).await;

    assert_eq!(report.disconnected, vec![account_id]);
    assert_eq!(harness.radius.disconnected().await, vec!["alice01".to_string()]);
}

#[tokio::test]
async fn failed_disconnect_leaves_the_account_for_the_next_run() {
    let mut harness = Harness::new();
    harness.radius = FakeRadius::scripted(vec![Err(GatewayError::Timeout)]);
    let pipeline = harness.pipeline(AttachmentPolicy::Skip);

    let report = pipeline.run(vec![overdue_account("Alice", 20)]).await;

    assert!(report.disconnected.is_empty());
    assert!(report.errors.iter().any(|e| e.contains("disconnect failed")));
}

#[tokio::test]
async fn render_failure_with_skip_policy_sends_without_attachment() {
    let mut harness = Harness::new();
    harness.renderer = FakeRenderer::scripted(vec![Err(GatewayError::Timeout)]);
    let pipeline = harness.pipeline(AttachmentPolicy::Skip);

    let report = pipeline.run(vec![overdue_account("Alice", 7)]).await;

    assert_eq!(report.emails_sent, 1);
    let sent = harness.email.sent().await;
    assert!(sent[0]["attachment"].is_null());
}

#[tokio::test]
async fn render_failure_with_defer_policy_queues_a_notice_item() {
    let mut harness = Harness::new();
    harness.renderer = FakeRenderer::scripted(vec![Err(GatewayError::Timeout)]);
    let pipeline = harness.pipeline(AttachmentPolicy::Defer);

    let report = pipeline.run(vec![overdue_account("Alice", 7)]).await;

    // The email is deferred, not sent; SMS still goes out directly.
    assert_eq!(report.emails_sent, 0);
    assert_eq!(report.sms_sent, 1);
    assert_eq!(report.retries_enqueued, 1);
    assert_eq!(harness.email.sent_count().await, 0);

    let queued = harness.queue.claim_batch(WorkKind::Notice, 10).await.unwrap();
    assert_eq!(queued.len(), 1);

    let payload: NoticePayload = serde_json::from_value(queued[0].payload.clone()).unwrap();
    assert_eq!(payload.kind, NoticeKind::Reminder);
}

#[tokio::test]
async fn deferred_notice_replays_through_render_and_email() {
    let mut harness = Harness::new();
    harness.renderer = FakeRenderer::scripted(vec![Err(GatewayError::Timeout)]);
    let pipeline = harness.pipeline(AttachmentPolicy::Defer);

    pipeline.run(vec![overdue_account("Alice", 7)]).await;
    let queued = harness.queue.claim_batch(WorkKind::Notice, 10).await.unwrap();
    let item = &queued[0];

    // Renderer recovered; the replay sends the email with its attachment.
    let outcome = pipeline.run_deferred(&item.payload).await;
    assert!(matches!(outcome, ItemOutcome::Succeeded));
    assert_eq!(harness.renderer.rendered().await.len(), 2);
    assert_eq!(harness.email.sent_count().await, 1);
    let sent = harness.email.sent().await;
    assert!(sent[0]["attachment"].is_object());

    let status = harness.queue.report_result(item.id, outcome).await.unwrap();
    assert_eq!(status, WorkStatus::Succeeded);
}

#[tokio::test]
async fn deferred_replay_with_transient_render_failure_stays_retryable() {
    let mut harness = Harness::new();
    harness.renderer = FakeRenderer::scripted(vec![
        Err(GatewayError::Timeout),
        Err(GatewayError::Http { status: 502 }),
    ]);
    let pipeline = harness.pipeline(AttachmentPolicy::Defer);

    pipeline.run(vec![overdue_account("Alice", 7)]).await;
    let queued = harness.queue.claim_batch(WorkKind::Notice, 10).await.unwrap();

    let outcome = pipeline.run_deferred(&queued[0].payload).await;
    assert!(matches!(outcome, ItemOutcome::TransientFailure(_)));
}
