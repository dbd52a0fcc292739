use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use constant_time_eq::constant_time_eq;

/// Shared secret schedulers present as a bearer token.
#[derive(Clone, Default)]
pub struct CronAuth {
    /// `None` disables the check (local development).
    pub secret: Option<Arc<str>>,
}

impl CronAuth {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.map(Arc::from),
        }
    }
}

pub async fn cron_auth_middleware(
    State(auth): State<CronAuth>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(secret) = auth.secret.as_deref() {
        let token = extract_bearer(req.headers())?;
        if !secret_matches(token, secret) {
            tracing::warn!("rejected trigger request with invalid bearer token");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    Ok(next.run(req).await)
}

/// Compares in time independent of where the first mismatching byte is.
fn secret_matches(token: &str, secret: &str) -> bool {
    constant_time_eq(token.as_bytes(), secret.as_bytes())
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}
