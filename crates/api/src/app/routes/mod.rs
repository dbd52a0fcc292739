use axum::Router;

pub mod jobs;
pub mod system;

/// Router for all scheduler-facing endpoints.
pub fn router() -> Router {
    Router::new().nest("/jobs", jobs::router())
}
