// Sync record storage. Records append; the latest observation per subject is
// what reconciliation diffs against (last-observed-wins).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tokio::sync::Mutex;

use uplink_shared::SessionState;

use super::{SyncError, SyncResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub subject_id: String,
    pub local_state: SessionState,
    pub remote_state: SessionState,
    pub observed_at: DateTime<Utc>,
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn latest(&self, subject_id: &str) -> SyncResult<Option<SyncRecord>>;

    async fn record(&self, record: SyncRecord) -> SyncResult<()>;
}

pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct SyncRecordRow {
    subject_id: String,
    local_state: String,
    remote_state: String,
    observed_at: DateTime<Utc>,
}

impl From<SyncRecordRow> for SyncRecord {
    fn from(row: SyncRecordRow) -> Self {
        SyncRecord {
            subject_id: row.subject_id,
            local_state: SessionState::parse(&row.local_state).unwrap_or(SessionState::Unknown),
            remote_state: SessionState::parse(&row.remote_state).unwrap_or(SessionState::Unknown),
            observed_at: row.observed_at,
        }
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn latest(&self, subject_id: &str) -> SyncResult<Option<SyncRecord>> {
        let row: Option<SyncRecordRow> = sqlx::query_as(
            r#"
            SELECT subject_id, local_state, remote_state, observed_at
            FROM sync_records
            WHERE subject_id = $1
            ORDER BY observed_at DESC
            LIMIT 1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SyncError::Database)?;

        Ok(row.map(SyncRecord::from))
    }

    async fn record(&self, record: SyncRecord) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (subject_id, local_state, remote_state, observed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.subject_id)
        .bind(record.local_state.as_str())
        .bind(record.remote_state.as_str())
        .bind(record.observed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory store keeping only the latest record per subject.
pub struct MemorySyncStore {
    records: Mutex<HashMap<String, SyncRecord>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for MemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn latest(&self, subject_id: &str) -> SyncResult<Option<SyncRecord>> {
        Ok(self.records.lock().await.get(subject_id).cloned())
    }

    async fn record(&self, record: SyncRecord) -> SyncResult<()> {
        self.records
            .lock()
            .await
            .insert(record.subject_id.clone(), record);
        Ok(())
    }
}
