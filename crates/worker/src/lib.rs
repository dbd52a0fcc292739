//! Continuous worker process: one long-lived loop over the shared job store.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use fulfillment_infra::{
    FulfillmentConfig,
    db,
    jobs::{JobRunner, PostgresJobStore, Worker},
    runs::PostgresRunTracker,
    stages,
};

/// Connect, migrate, and run the loop until SIGINT/SIGTERM.
///
/// The in-flight job finishes before the pool is closed.
pub async fn run(config: FulfillmentConfig) -> anyhow::Result<()> {
    let pool = db::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    db::migrate(&pool).await.context("failed to run migrations")?;

    let dispatcher = stages::dispatcher_from_config(&config.stages)
        .context("failed to build stage dispatcher")?;

    let jobs = Arc::new(PostgresJobStore::new(pool.clone()).with_backoff(config.backoff()));
    let runs = Arc::new(PostgresRunTracker::new(pool.clone()));
    let runner = JobRunner::new(jobs, runs, Arc::new(dispatcher), config.runner());

    info!(
        worker_id = %config.worker.worker_id,
        breaker_cooldown_ms = config.worker.breaker_cooldown.as_millis() as u64,
        "starting fulfillment worker"
    );

    let handle = Worker::new(runner, config.worker_settings()).spawn();

    shutdown_signal().await;
    warn!("shutdown requested; waiting for in-flight job");

    let result = handle.shutdown().await;
    pool.close().await;

    let stats = result.context("worker task panicked")?;
    info!(
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        breaker_trips = stats.breaker_trips,
        "fulfillment worker stopped"
    );
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
