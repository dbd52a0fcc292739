use anyhow::Context;

use fulfillment_infra::FulfillmentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fulfillment_observability::init();

    let config = FulfillmentConfig::from_env().context("invalid configuration")?;
    fulfillment_worker::run(config).await
}
