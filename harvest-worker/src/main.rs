//! Harvest Worker
//!
//! A long-running worker that claims scraper jobs from PostgreSQL, runs their
//! payload scripts as child processes and stores the scraped products.
//!
//! Architecture:
//! - Configuration: Load settings from environment (and an optional `.env`)
//! - Repository: PostgreSQL job store behind the `JobStore` trait
//! - Services: Claiming, context building, execution, persistence, reporting
//! - Scheduler: Polling loop, failure backoff and health checks
//!
//! Any number of workers may share one database; the claim protocol ensures
//! each job is run by exactly one of them.

mod config;
mod db;
mod error;
mod repository;
mod retry;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LogFormat};
use crate::db::ConnectionGuard;
use crate::repository::{JobStore, PgJobStore};
use crate::scheduler::{WorkerLoop, WorkerState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Harvest Worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    info!(
        "Loaded configuration: worker_id={}, poll_interval={:?}, script_timeout={:?}",
        config.worker_id, config.poll_interval, config.script_timeout
    );

    let guard = ConnectionGuard::new(
        config.database_url.clone(),
        config.worker_id.clone(),
        config.connect_timeout,
    );
    let pool = connect_with_retry(&guard).await?;
    info!("Database connection established");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(guard, pool));
    let (state_tx, _state_rx) = watch::channel(WorkerState::Idle);
    let mut worker = WorkerLoop::new(&config, store, Arc::new(state_tx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown requested, finishing current job");
        shutdown_tx.send_replace(true);
    });

    info!("Worker initialized successfully");
    worker.run(shutdown_rx).await;

    info!("Harvest Worker stopped in state {:?}", worker.state());
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "harvest_worker=info,harvest_payload=info".into());

    match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

/// Opens the first connection with exponential backoff
///
/// The database may still be starting when the worker comes up (common in
/// container environments).
async fn connect_with_retry(guard: &ConnectionGuard) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const MAX_DELAY_SECS: u64 = 30;

    let mut attempt = 0;
    let mut delay_secs = 1;

    loop {
        attempt += 1;

        match guard.open().await {
            Ok(pool) => {
                if attempt > 1 {
                    info!("Connected to database after {} attempt(s)", attempt);
                }
                return Ok(pool);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to connect to database after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Failed to connect to database: {}", e));
                }

                delay_secs = (delay_secs * 2).min(MAX_DELAY_SECS);
                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} s...", delay_secs);

                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
