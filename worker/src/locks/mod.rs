// Distributed Lock Manager - named mutual-exclusion locks with TTL
//
// Every scheduled job acquires a lock named after itself before running, which
// is what gives the dispatcher its "without overlapping" guarantee across
// worker processes. A held-but-expired lock is treated as free and may be
// stolen by the next acquirer, so a crashed holder can never leak a lock
// forever.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryLockStore;
pub use postgres::PgLockStore;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type LockResult<T> = Result<T, LockError>;

/// Opaque proof of lock ownership; release and renew must present it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempts to take the named lock. Returns `None` when an unexpired lock
    /// with the same name is already held (Busy); callers skip, never queue.
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Option<LockToken>>;

    /// Compare-and-delete release. `false` means the token no longer owns the
    /// lock (expired and stolen, or never held).
    async fn release(&self, name: &str, token: &LockToken) -> LockResult<bool>;

    /// Extends a held lock. `false` means the lock already expired.
    async fn renew(&self, name: &str, token: &LockToken, ttl: Duration) -> LockResult<bool>;

    /// Deletes all expired lock rows; safe to run concurrently with
    /// acquisition. Returns the number of rows removed.
    async fn sweep_expired(&self) -> LockResult<u64>;
}
