use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use persistence::PgAllocationStore;
use seatlease_api::app::{self, AppState};
use seatlease_api::config::Config;
use seatlease_api::jobs::{JobScheduler, LeaseExpiryJob, PendingStockRetryJob, StalledInvitationJob};
use seatlease_api::middleware::{init_metrics, logging::init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging)?;
    init_metrics()?;

    info!("Starting seat lease API v{}", env!("CARGO_PKG_VERSION"));

    // Create database pool
    let pool = persistence::db::create_pool(&(&config.database).into()).await?;

    // Run migrations
    info!("Running database migrations...");
    persistence::db::run_migrations(&pool).await?;
    info!("Migrations completed");

    let addr = config.socket_addr()?;
    let jobs = config.jobs.clone();
    let store = Arc::new(PgAllocationStore::new(pool));
    let state = AppState::from_config(config, store)?;

    let mut scheduler = JobScheduler::new();
    scheduler.register(LeaseExpiryJob::new(
        state.sweeper.clone(),
        jobs.lease_expiry_interval_minutes,
    ));
    scheduler.register(PendingStockRetryJob::new(
        state.reconciler.clone(),
        jobs.stock_retry_interval_minutes,
    ));
    scheduler.register(StalledInvitationJob::new(
        state.invitations.clone(),
        jobs.invitation_resume_interval_minutes,
    ));
    scheduler.start();

    let app = app::create_app(state);

    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    scheduler.wait_for_shutdown(Duration::from_secs(30)).await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        // Without a signal handler, keep serving.
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
