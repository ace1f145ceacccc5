// In-memory lock store for tests and single-process local runs. The single
// mutex is the critical section that the Postgres store expresses as a
// conditional upsert.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};

use super::{LockResult, LockStore, LockToken};

#[derive(Debug, Clone)]
struct LockRow {
    holder_token: LockToken,
    expires_at: DateTime<Utc>,
}

pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, LockRow>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Option<LockToken>> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().await;

        if let Some(existing) = locks.get(name) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }

        let token = LockToken::generate();
        locks.insert(
            name.to_string(),
            LockRow {
                holder_token: token.clone(),
                expires_at: now + ttl,
            },
        );

        Ok(Some(token))
    }

    async fn release(&self, name: &str, token: &LockToken) -> LockResult<bool> {
        let mut locks = self.locks.lock().await;

        match locks.get(name) {
            Some(row) if row.holder_token == *token => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew(&self, name: &str, token: &LockToken, ttl: Duration) -> LockResult<bool> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().await;

        match locks.get_mut(name) {
            Some(row) if row.holder_token == *token && row.expires_at > now => {
                row.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sweep_expired(&self) -> LockResult<u64> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().await;

        let before = locks.len();
        locks.retain(|_, row| row.expires_at > now);

        Ok((before - locks.len()) as u64)
    }
}
