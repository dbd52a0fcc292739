//! HTTP stage processor.
//!
//! POSTs `{payload, context}` to the stage endpoint and classifies the response:
//!
//! | Response | Outcome |
//! |----------|---------|
//! | 2xx | success |
//! | non-2xx carrying `x-stage-outcome: fatal` | fatal |
//! | any other non-2xx, transport error | retryable (429/503 honour `Retry-After` seconds) |
//!
//! A 404 or 401 from a misconfigured endpoint is retried like any other
//! failure; only the endpoint itself marks a job fatal.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::jobs::{RunContext, StageError, StageProcessor};

/// Response header a stage endpoint sets to `fatal` to stop retries.
pub const STAGE_OUTCOME_HEADER: &str = "x-stage-outcome";

/// Longest response body echoed into an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct StageRequest<'a> {
    payload: &'a Value,
    context: &'a RunContext,
}

/// Calls one stage endpoint.
#[derive(Debug, Clone)]
pub struct HttpStageProcessor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpStageProcessor {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl StageProcessor for HttpStageProcessor {
    async fn process(&self, payload: &Value, ctx: &RunContext) -> Result<(), StageError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-correlation-id", ctx.correlation_id.as_str())
            .header("x-job-id", ctx.job_id.to_string())
            .json(&StageRequest {
                payload,
                context: ctx,
            })
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timed out" } else { "request failed" };
                StageError::retryable(format!("{} {}: {}", ctx.stage, kind, e))
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let fatal = response
            .headers()
            .get(STAGE_OUTCOME_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("fatal"));
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        debug!(job_id = %ctx.job_id, stage = %ctx.stage, status = status.as_u16(), "stage endpoint responded");
        classify(status, retry_after, fatal, &body)
    }
}

/// Map an endpoint response onto a stage outcome.
pub fn classify(
    status: StatusCode,
    retry_after: Option<Duration>,
    fatal: bool,
    body: &str,
) -> Result<(), StageError> {
    if status.is_success() {
        return Ok(());
    }

    let message = error_message(status, body);
    if fatal {
        return Err(StageError::Fatal(message));
    }

    let honours_retry_after =
        status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE;
    Err(StageError::Retryable {
        message,
        retry_after: retry_after.filter(|_| honours_retry_after),
    })
}

fn error_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return format!("stage endpoint returned {}", status);
    }

    let mut end = body.len().min(MAX_ERROR_BODY);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("stage endpoint returned {}: {}", status, &body[..end])
}
