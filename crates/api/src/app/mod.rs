//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store/runner wiring (Postgres or in-memory)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: query/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let auth = middleware::CronAuth::new(services.config.api.cron_secret.clone());

    // Trigger routes: require the scheduler's bearer secret when configured.
    let protected = routes::router().layer(
        ServiceBuilder::new()
            .layer(Extension(services))
            .layer(axum::middleware::from_fn_with_state(
                auth,
                middleware::cron_auth_middleware,
            )),
    );

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
}
