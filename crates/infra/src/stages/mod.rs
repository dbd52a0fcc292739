//! Stage processors backed by the web application hosting the domain logic.

pub mod http;

pub use http::{HttpStageProcessor, classify};

use std::sync::Arc;

use tracing::{info, warn};

use fulfillment_core::Stage;

use crate::config::StagesConfig;
use crate::jobs::Dispatcher;

/// Build a dispatcher with one HTTP processor per configured `STAGE_ENDPOINT_*`.
///
/// Stages without an endpoint stay unregistered; their jobs fail as unknown stages.
pub fn dispatcher_from_config(config: &StagesConfig) -> Result<Dispatcher, reqwest::Error> {
    let client = reqwest::Client::builder().timeout(config.timeout).build()?;

    let mut dispatcher = Dispatcher::new();
    for (stage, endpoint) in &config.endpoints {
        info!(stage = %stage, endpoint = %endpoint, "registered http stage processor");
        dispatcher.register(
            *stage,
            Arc::new(HttpStageProcessor::new(client.clone(), endpoint.clone())),
        );
    }

    for stage in Stage::ALL {
        if !config.endpoints.contains_key(&stage) {
            warn!(stage = %stage, "no processor configured for stage");
        }
    }

    Ok(dispatcher)
}
