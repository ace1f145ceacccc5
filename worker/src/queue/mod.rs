// Retry Queue - durable queue of external-dispatch work with bounded retries
//
// Work items are the unit of partial failure: one email, one payment, one
// notice. Jobs claim due batches, hand each item to a gateway adapter, and
// report the per-item outcome back; transient failures are rescheduled with
// backoff until max_attempts, data errors go permanent immediately.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryWorkQueue;
pub use postgres::PgWorkQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Work item not found: {0}")]
    NotFound(Uuid),
    #[error("Corrupt work item row: {0}")]
    Decode(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkKind {
    Email,
    Sms,
    Payment,
    Notice,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Email => "email",
            WorkKind::Sms => "sms",
            WorkKind::Payment => "payment",
            WorkKind::Notice => "notice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(WorkKind::Email),
            "sms" => Some(WorkKind::Sms),
            "payment" => Some(WorkKind::Payment),
            "notice" => Some(WorkKind::Notice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    InFlight,
    Succeeded,
    FailedPermanent,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::InFlight => "in_flight",
            WorkStatus::Succeeded => "succeeded",
            WorkStatus::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WorkStatus::Pending),
            "in_flight" => Some(WorkStatus::InFlight),
            "succeeded" => Some(WorkStatus::Succeeded),
            "failed_permanent" => Some(WorkStatus::FailedPermanent),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Succeeded | WorkStatus::FailedPermanent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub kind: WorkKind,
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: WorkStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Touched on every state change; pruning keys off completion time.
    pub updated_at: DateTime<Utc>,
}

/// Per-item result reported by the job that dispatched it.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Succeeded,
    /// Timeout, 5xx, network: eligible for another attempt.
    TransientFailure(String),
    /// Malformed payload or rejected data: retrying cannot fix it.
    PermanentFailure(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub in_flight: i64,
    pub succeeded: i64,
    pub failed_permanent: i64,
}

/// Delay schedule applied to transient failures.
#[derive(Debug, Clone, Copy)]
pub enum BackoffPolicy {
    /// Same delay every time, matching the calling job's retry cadence.
    Fixed { secs: i64 },
    /// base * 2^(attempt - 1), capped.
    Exponential { base_secs: i64, cap_secs: i64 },
}

impl BackoffPolicy {
    /// Delay before the next attempt, given the attempt count *after* the
    /// failure being recorded (so the first failure passes 1).
    pub fn delay_after(&self, attempt_count: i32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { secs } => Duration::seconds(secs),
            BackoffPolicy::Exponential { base_secs, cap_secs } => {
                let exponent = (attempt_count - 1).clamp(0, 30) as u32;
                let delay = base_secs.saturating_mul(1i64 << exponent);
                Duration::seconds(delay.min(cap_secs))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed { secs: 300 }
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(
        &self,
        kind: WorkKind,
        payload: serde_json::Value,
        max_attempts: i32,
    ) -> QueueResult<Uuid>;

    /// Claims up to `limit` due pending items of `kind`, oldest due first,
    /// transitioning them to in_flight. Claim-if-pending is atomic across
    /// worker processes.
    async fn claim_batch(&self, kind: WorkKind, limit: i64) -> QueueResult<Vec<WorkItem>>;

    /// Same selection as `claim_batch` but restricted to items that already
    /// failed at least once; used by the dedicated retry cycles.
    async fn claim_retry_batch(&self, kind: WorkKind, limit: i64) -> QueueResult<Vec<WorkItem>>;

    /// Records the outcome of a claimed item and returns its resulting
    /// status. Reporting against a terminal item is a no-op.
    async fn report_result(&self, id: Uuid, outcome: ItemOutcome) -> QueueResult<WorkStatus>;

    /// Reaper: items claimed longer than `claim_timeout` ago without a
    /// reported result go back to pending. Returns how many were requeued.
    async fn requeue_stuck(&self, claim_timeout: Duration) -> QueueResult<u64>;

    /// Deletes succeeded items older than `retention`.
    async fn prune_succeeded(&self, retention: Duration) -> QueueResult<u64>;

    async fn counts(&self) -> QueueResult<QueueCounts>;
}

// Typed payloads carried inside WorkItem.payload. A payload that fails to
// deserialize at dispatch time is a data error, never retried.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub attachment: Option<EmailAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub filename: String,
    /// Base64-encoded file content.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsPayload {
    pub to: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub invoice_id: Uuid,
    pub account_id: Uuid,
    pub amount: rust_decimal::Decimal,
    pub currency: String,
}
