use std::sync::Arc;

use anyhow::Context;

use fulfillment_infra::FulfillmentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fulfillment_observability::init();

    let config = FulfillmentConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.api.bind_addr;
    if config.api.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET not set; trigger endpoints are unauthenticated");
    }

    let services = Arc::new(
        fulfillment_api::app::services::build_services(config)
            .await
            .context("failed to wire services")?,
    );
    let app = fulfillment_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    if let Some(pool) = &services.pool {
        pool.close().await;
    }
    Ok(())
}
