use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use fulfillment_core::WorkerId;
use fulfillment_infra::jobs::drain;

use crate::app::dto::RunQuery;
use crate::app::errors::store_error_to_response;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/run", get(run).post(run))
        .route("/stats", get(stats))
}

/// Drain up to `max` jobs (capped by `JOBS_MAX_PER_INVOCATION`).
///
/// Job failures are reported per job with `200`; a store outage stops the
/// drain and answers `503` with the partial report.
pub async fn run(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<RunQuery>,
) -> Response {
    let opts = services.config.drain_options(query.max);
    let worker_id = WorkerId::generate("trigger");

    let report = drain(&services.runner, &worker_id, opts).await;
    let status = if report.store_error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(report)).into_response()
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.runner.jobs().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_error_to_response(e),
    }
}
