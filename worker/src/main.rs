use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod clock;
mod config;
mod database;
mod events;
mod gateways;
mod jobs;
mod locks;
mod notify;
mod queue;
mod sync;

#[cfg(test)]
mod tests;

use gateways::email::SmtpEmailGateway;
use gateways::payment::PaymentGateway;
use gateways::radius::RadiusGateway;
use gateways::render::HttpDocumentRenderer;
use gateways::sms::SmsGateway;
use jobs::{JobScheduler, PgRunLog, WorkerContext};
use locks::postgres::PgLockStore;
use queue::postgres::PgWorkQueue;
use queue::BackoffPolicy;
use sync::store::PgSyncStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    if !config.smtp.is_configured() {
        tracing::warn!("SMTP is not fully configured; email dispatch will fail until it is");
    }

    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let worker_id = Uuid::new_v4();
    tracing::info!(worker_id = %worker_id, "Starting uplink worker");

    let backoff = BackoffPolicy::Fixed {
        secs: config.policy.retry_backoff_secs,
    };

    let radius = Arc::new(RadiusGateway::new(&config.radius));

    let ctx = Arc::new(WorkerContext {
        db: db_pool.clone(),
        locks: Arc::new(PgLockStore::new(db_pool.clone())),
        queue: Arc::new(PgWorkQueue::new(db_pool.clone(), backoff)),
        run_log: Arc::new(PgRunLog::new(db_pool.clone())),
        sync_store: Arc::new(PgSyncStore::new(db_pool)),
        email: Arc::new(SmtpEmailGateway::new(&config.smtp)),
        sms: Arc::new(SmsGateway::new(&config.sms)),
        payment: Arc::new(PaymentGateway::new(&config.payment)),
        radius: radius.clone(),
        sessions: radius,
        renderer: Arc::new(HttpDocumentRenderer::new(config.render_api_url.clone())),
        events: events::EventBus::new(),
        config,
        worker_id,
    });

    let scheduler = JobScheduler::new(ctx).await?;
    scheduler.start().await?;

    tracing::info!("Worker started, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
