use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(max) = std::env::var("DB_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                config.max_connections = n;
            }
        }

        if let Ok(min) = std::env::var("DB_MIN_CONNECTIONS") {
            if let Ok(n) = min.parse() {
                config.min_connections = n;
            }
        }

        if let Ok(timeout) = std::env::var("DB_ACQUIRE_TIMEOUT") {
            if let Ok(n) = timeout.parse() {
                config.acquire_timeout = Duration::from_secs(n);
            }
        }

        config
    }
}

pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let config = PoolConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    tracing::info!(
        max = config.max_connections,
        min = config.min_connections,
        "Database pool created"
    );

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}
