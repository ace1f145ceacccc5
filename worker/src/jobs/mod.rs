// Background job pipeline
//
// The dispatcher fires each named job on its cadence; every trigger goes
// through the lock-guarded path in scheduler::run_guarded, so cadence ticks
// that land while a prior run still holds the lock are dropped, not queued.

pub mod billing;
pub mod dispatch;
pub mod maintenance;
pub mod notices;
pub mod runs;
pub mod scheduler;
pub mod session_sync;

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::events::EventBus;
use crate::gateways::{DocumentRenderer, Gateway, RadiusControl, SessionAuthority};
use crate::locks::LockStore;
use crate::queue::WorkQueue;
use crate::sync::SyncStore;

pub use runs::{JobOutcome, JobRun, MemoryRunLog, PgRunLog, RunLog};
pub use scheduler::{JobError, JobReport, JobResult, JobScheduler};

pub const BILLING_GENERATION: &str = "billing-generation";
pub const OVERDUE_NOTICES: &str = "overdue-notices";
pub const EMAIL_DISPATCH: &str = "email-dispatch";
pub const EMAIL_RETRY: &str = "email-retry";
pub const SMS_DISPATCH: &str = "sms-dispatch";
pub const PAYMENT_PROCESSING: &str = "payment-processing";
pub const SESSION_SYNC: &str = "session-sync";
pub const MAINTENANCE: &str = "maintenance";

pub const JOB_NAMES: &[&str] = &[
    BILLING_GENERATION,
    OVERDUE_NOTICES,
    EMAIL_DISPATCH,
    EMAIL_RETRY,
    SMS_DISPATCH,
    PAYMENT_PROCESSING,
    SESSION_SYNC,
    MAINTENANCE,
];

/// Everything a job body needs, shared across the scheduler's closures.
pub struct WorkerContext {
    pub db: PgPool,
    pub locks: Arc<dyn LockStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub run_log: Arc<dyn RunLog>,
    pub sync_store: Arc<dyn SyncStore>,
    pub email: Arc<dyn Gateway>,
    pub sms: Arc<dyn Gateway>,
    pub payment: Arc<dyn Gateway>,
    pub radius: Arc<dyn RadiusControl>,
    pub sessions: Arc<dyn SessionAuthority>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub events: EventBus,
    pub config: Config,
    /// Per-process identity, logged with claims for observability.
    pub worker_id: Uuid,
}
