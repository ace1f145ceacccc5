// In-memory work queue for tests and local runs. One mutex over the item list
// stands in for the row locks the Postgres store takes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

use super::{
    BackoffPolicy, ItemOutcome, QueueCounts, QueueError, QueueResult, WorkItem, WorkKind,
    WorkQueue, WorkStatus,
};

pub struct MemoryWorkQueue {
    items: Mutex<Vec<WorkItem>>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl MemoryWorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self::with_clock(backoff, Arc::new(SystemClock))
    }

    pub fn with_clock(backoff: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            backoff,
            clock,
        }
    }

    /// Test helper: a snapshot of one item.
    pub async fn get(&self, id: Uuid) -> Option<WorkItem> {
        self.items.lock().await.iter().find(|i| i.id == id).cloned()
    }

    async fn claim(
        &self,
        kind: WorkKind,
        limit: i64,
        min_attempts: i32,
    ) -> QueueResult<Vec<WorkItem>> {
        let now = self.clock.now();
        let mut items = self.items.lock().await;

        let mut due: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                item.kind == kind
                    && item.status == WorkStatus::Pending
                    && item.next_attempt_at <= now
                    && item.attempt_count >= min_attempts
            })
            .map(|(idx, _)| idx)
            .collect();

        due.sort_by_key(|&idx| items[idx].next_attempt_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for idx in due {
            let item = &mut items[idx];
            item.status = WorkStatus::InFlight;
            item.claimed_at = Some(now);
            item.updated_at = now;
            claimed.push(item.clone());
        }

        Ok(claimed)
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(
        &self,
        kind: WorkKind,
        payload: serde_json::Value,
        max_attempts: i32,
    ) -> QueueResult<Uuid> {
        let now = self.clock.now();
        let id = Uuid::new_v4();

        self.items.lock().await.push(WorkItem {
            id,
            kind,
            payload,
            attempt_count: 0,
            max_attempts,
            next_attempt_at: now,
            status: WorkStatus::Pending,
            claimed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        });

        Ok(id)
    }

    async fn claim_batch(&self, kind: WorkKind, limit: i64) -> QueueResult<Vec<WorkItem>> {
        self.claim(kind, limit, 0).await
    }

    async fn claim_retry_batch(&self, kind: WorkKind, limit: i64) -> QueueResult<Vec<WorkItem>> {
        self.claim(kind, limit, 1).await
    }

    async fn report_result(&self, id: Uuid, outcome: ItemOutcome) -> QueueResult<WorkStatus> {
        let now = self.clock.now();
        let mut items = self.items.lock().await;

        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(QueueError::NotFound(id))?;

        if item.status.is_terminal() {
            return Ok(item.status);
        }

        item.updated_at = now;
        match outcome {
            ItemOutcome::Succeeded => {
                item.status = WorkStatus::Succeeded;
                item.claimed_at = None;
                item.last_error = None;
            }
            ItemOutcome::TransientFailure(message) => {
                item.attempt_count += 1;
                item.claimed_at = None;
                item.last_error = Some(message.clone());
                if item.attempt_count >= item.max_attempts {
                    error!(
                        item = %id,
                        kind = item.kind.as_str(),
                        attempts = item.attempt_count,
                        error = %message,
                        "Work item exhausted its attempts; marking failed_permanent"
                    );
                    item.status = WorkStatus::FailedPermanent;
                } else {
                    item.status = WorkStatus::Pending;
                    item.next_attempt_at = now + self.backoff.delay_after(item.attempt_count);
                }
            }
            ItemOutcome::PermanentFailure(message) => {
                error!(
                    item = %id,
                    kind = item.kind.as_str(),
                    error = %message,
                    "Work item failed permanently; not retrying"
                );
                item.attempt_count += 1;
                item.claimed_at = None;
                item.last_error = Some(message);
                item.status = WorkStatus::FailedPermanent;
            }
        }

        Ok(item.status)
    }

    async fn requeue_stuck(&self, claim_timeout: Duration) -> QueueResult<u64> {
        let now = self.clock.now();
        let mut items = self.items.lock().await;

        let mut requeued = 0;
        for item in items.iter_mut() {
            if item.status == WorkStatus::InFlight {
                if let Some(claimed_at) = item.claimed_at {
                    if claimed_at <= now - claim_timeout {
                        item.status = WorkStatus::Pending;
                        item.claimed_at = None;
                        item.updated_at = now;
                        requeued += 1;
                    }
                }
            }
        }

        Ok(requeued)
    }

    async fn prune_succeeded(&self, retention: Duration) -> QueueResult<u64> {
        let cutoff = self.clock.now() - retention;
        let mut items = self.items.lock().await;

        let before = items.len();
        // Retention is measured from completion, not enqueue.
        items.retain(|item| !(item.status == WorkStatus::Succeeded && item.updated_at < cutoff));

        Ok((before - items.len()) as u64)
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let items = self.items.lock().await;

        let mut counts = QueueCounts::default();
        for item in items.iter() {
            match item.status {
                WorkStatus::Pending => counts.pending += 1,
                WorkStatus::InFlight => counts.in_flight += 1,
                WorkStatus::Succeeded => counts.succeeded += 1,
                WorkStatus::FailedPermanent => counts.failed_permanent += 1,
            }
        }

        Ok(counts)
    }
}
