// Postgres lock store. All mutation is single-statement compare-and-set so two
// worker processes can never both hold the same name.

use async_trait::async_trait;
use chrono::Duration;
use sqlx::PgPool;
use uuid::Uuid;

use super::{LockError, LockResult, LockStore, LockToken};

pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Option<LockToken>> {
        let token = LockToken::generate();

        // Insert-or-steal: the DO UPDATE arm only fires when the existing row
        // has expired, so an unexpired holder makes this return no row.
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO job_locks (name, holder_token, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + ($3 || ' seconds')::interval)
            ON CONFLICT (name) DO UPDATE
            SET holder_token = EXCLUDED.holder_token,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE job_locks.expires_at <= NOW()
            RETURNING holder_token
            "#,
        )
        .bind(name)
        .bind(token.0)
        .bind(ttl.num_seconds().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(LockError::Database)?;

        Ok(row.map(|(holder,)| LockToken(holder)))
    }

    async fn release(&self, name: &str, token: &LockToken) -> LockResult<bool> {
        let result = sqlx::query("DELETE FROM job_locks WHERE name = $1 AND holder_token = $2")
            .bind(name)
            .bind(token.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn renew(&self, name: &str, token: &LockToken, ttl: Duration) -> LockResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_locks
            SET expires_at = NOW() + ($3 || ' seconds')::interval
            WHERE name = $1 AND holder_token = $2 AND expires_at > NOW()
            "#,
        )
        .bind(name)
        .bind(token.0)
        .bind(ttl.num_seconds().to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn sweep_expired(&self) -> LockResult<u64> {
        let result = sqlx::query("DELETE FROM job_locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
