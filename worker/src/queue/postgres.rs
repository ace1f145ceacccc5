// Postgres work queue. Claims use FOR UPDATE SKIP LOCKED so concurrent worker
// processes never pick the same item; result reporting runs in a transaction
// with the row locked.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use tracing::error;
use uuid::Uuid;

use super::{
    BackoffPolicy, ItemOutcome, QueueCounts, QueueError, QueueResult, WorkItem, WorkKind,
    WorkQueue, WorkStatus,
};

pub struct PgWorkQueue {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }
}

#[derive(Debug, FromRow)]
struct WorkItemRow {
    id: Uuid,
    kind: String,
    payload: serde_json::Value,
    attempt_count: i32,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
    status: String,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = QueueError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let kind = WorkKind::parse(&row.kind)
            .ok_or_else(|| QueueError::Decode(format!("unknown kind '{}'", row.kind)))?;
        let status = WorkStatus::parse(&row.status)
            .ok_or_else(|| QueueError::Decode(format!("unknown status '{}'", row.status)))?;

        Ok(WorkItem {
            id: row.id,
            kind,
            payload: row.payload,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            next_attempt_at: row.next_attempt_at,
            status,
            claimed_at: row.claimed_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl PgWorkQueue {
    async fn claim(
        &self,
        kind: WorkKind,
        limit: i64,
        min_attempts: i32,
    ) -> QueueResult<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            r#"
            UPDATE work_items
            SET status = 'in_flight', claimed_at = NOW(), updated_at = NOW()
            WHERE id IN (
                SELECT id FROM work_items
                WHERE kind = $1
                    AND status = 'pending'
                    AND next_attempt_at <= NOW()
                    AND attempt_count >= $2
                ORDER BY next_attempt_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, payload, attempt_count, max_attempts,
                      next_attempt_at, status, claimed_at, last_error, created_at, updated_at
            "#,
        )
        .bind(kind.as_str())
        .bind(min_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(WorkItem::try_from)
            .collect::<QueueResult<Vec<_>>>()?;

        // RETURNING does not guarantee order; restore oldest-due-first.
        items.sort_by_key(|item| item.next_attempt_at);

        Ok(items)
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn enqueue(
        &self,
        kind: WorkKind,
        payload: serde_json::Value,
        max_attempts: i32,
    ) -> QueueResult<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO work_items
            (id, kind, payload, attempt_count, max_attempts, next_attempt_at, status, created_at, updated_at)
            VALUES ($1, $2, $3, 0, $4, NOW(), 'pending', NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(payload)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_batch(&self, kind: WorkKind, limit: i64) -> QueueResult<Vec<WorkItem>> {
        self.claim(kind, limit, 0).await
    }

    async fn claim_retry_batch(&self, kind: WorkKind, limit: i64) -> QueueResult<Vec<WorkItem>> {
        self.claim(kind, limit, 1).await
    }

    async fn report_result(&self, id: Uuid, outcome: ItemOutcome) -> QueueResult<WorkStatus> {
        let mut tx = self.pool.begin().await?;

        let row: Option<WorkItemRow> = sqlx::query_as(
            r#"
            SELECT id, kind, payload, attempt_count, max_attempts,
                   next_attempt_at, status, claimed_at, last_error, created_at, updated_at
            FROM work_items WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let item: WorkItem = row.ok_or(QueueError::NotFound(id))?.try_into()?;

        if item.status.is_terminal() {
            tx.commit().await?;
            return Ok(item.status);
        }

        let status = match outcome {
            ItemOutcome::Succeeded => {
                sqlx::query(
                    "UPDATE work_items
                     SET status = 'succeeded', claimed_at = NULL, last_error = NULL, updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                WorkStatus::Succeeded
            }
            ItemOutcome::TransientFailure(message) => {
                let attempts = item.attempt_count + 1;
                if attempts >= item.max_attempts {
                    error!(
                        item = %id,
                        kind = item.kind.as_str(),
                        attempts,
                        error = %message,
                        "Work item exhausted its attempts; marking failed_permanent"
                    );
                    sqlx::query(
                        "UPDATE work_items
                         SET status = 'failed_permanent', attempt_count = $2, claimed_at = NULL,
                             last_error = $3, updated_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(id)
                    .bind(attempts)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;
                    WorkStatus::FailedPermanent
                } else {
                    let delay = self.backoff.delay_after(attempts);
                    sqlx::query(
                        "UPDATE work_items
                         SET status = 'pending', attempt_count = $2, claimed_at = NULL,
                             next_attempt_at = NOW() + ($3 || ' seconds')::interval,
                             last_error = $4, updated_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(id)
                    .bind(attempts)
                    .bind(delay.num_seconds().to_string())
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;
                    WorkStatus::Pending
                }
            }
            ItemOutcome::PermanentFailure(message) => {
                error!(
                    item = %id,
                    kind = item.kind.as_str(),
                    error = %message,
                    "Work item failed permanently; not retrying"
                );
                sqlx::query(
                    "UPDATE work_items
                     SET status = 'failed_permanent', attempt_count = attempt_count + 1,
                         claimed_at = NULL, last_error = $2, updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&message)
                .execute(&mut *tx)
                .await?;
                WorkStatus::FailedPermanent
            }
        };

        tx.commit().await?;
        Ok(status)
    }

    async fn requeue_stuck(&self, claim_timeout: Duration) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'pending', claimed_at = NULL, updated_at = NOW()
            WHERE status = 'in_flight'
                AND claimed_at <= NOW() - ($1 || ' seconds')::interval
            "#,
        )
        .bind(claim_timeout.num_seconds().to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_succeeded(&self, retention: Duration) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM work_items
            WHERE status = 'succeeded'
                AND updated_at < NOW() - ($1 || ' seconds')::interval
            "#,
        )
        .bind(retention.num_seconds().to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM work_items GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match WorkStatus::parse(&status) {
                Some(WorkStatus::Pending) => counts.pending = count,
                Some(WorkStatus::InFlight) => counts.in_flight = count,
                Some(WorkStatus::Succeeded) => counts.succeeded = count,
                Some(WorkStatus::FailedPermanent) => counts.failed_permanent = count,
                None => return Err(QueueError::Decode(format!("unknown status '{}'", status))),
            }
        }

        Ok(counts)
    }
}
