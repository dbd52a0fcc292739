use std::sync::Arc;

use sqlx::PgPool;

use fulfillment_infra::{
    FulfillmentConfig,
    db,
    jobs::{Dispatcher, InMemoryJobStore, JobRunner, PostgresJobStore},
    runs::{InMemoryRunTracker, PostgresRunTracker},
    stages,
};

/// Everything the handlers need.
#[derive(Debug)]
pub struct AppServices {
    pub config: FulfillmentConfig,
    pub runner: JobRunner,
    /// Present when backed by Postgres; closed on shutdown
    pub pool: Option<PgPool>,
}

/// Wire Postgres stores when `DATABASE_URL` is set, in-memory stores otherwise.
pub async fn build_services(config: FulfillmentConfig) -> anyhow::Result<AppServices> {
    let dispatcher = stages::dispatcher_from_config(&config.stages)?;

    if config.database.url.is_some() {
        return build_persistent_services(config, dispatcher).await;
    }

    tracing::warn!("DATABASE_URL not set; using in-memory job and run stores");
    Ok(AppServices::in_memory(config, dispatcher))
}

async fn build_persistent_services(
    config: FulfillmentConfig,
    dispatcher: Dispatcher,
) -> anyhow::Result<AppServices> {
    let pool = db::connect(&config.database).await?;
    db::migrate(&pool).await?;

    let jobs = Arc::new(PostgresJobStore::new(pool.clone()).with_backoff(config.backoff()));
    let runs = Arc::new(PostgresRunTracker::new(pool.clone()));
    let runner = JobRunner::new(jobs, runs, Arc::new(dispatcher), config.runner());

    Ok(AppServices {
        config,
        runner,
        pool: Some(pool),
    })
}

impl AppServices {
    /// In-memory wiring (dev/test).
    pub fn in_memory(config: FulfillmentConfig, dispatcher: Dispatcher) -> Self {
        let jobs = Arc::new(InMemoryJobStore::new().with_backoff(config.backoff()));
        Self::with_stores(config, jobs, Arc::new(InMemoryRunTracker::new()), dispatcher)
    }

    /// Wire explicit stores (tests seed jobs through their own handle).
    pub fn with_stores(
        config: FulfillmentConfig,
        jobs: Arc<dyn fulfillment_infra::jobs::JobStore>,
        runs: Arc<dyn fulfillment_infra::runs::RunTracker>,
        dispatcher: Dispatcher,
    ) -> Self {
        let runner = JobRunner::new(jobs, runs, Arc::new(dispatcher), config.runner());
        Self {
            config,
            runner,
            pool: None,
        }
    }
}
