//! Run tracker abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use fulfillment_core::CorrelationId;

use super::types::{ErrorLabel, MarkRunning, Run, RunStatus, merge_context};

/// Upserts on the per-correlation-id run record.
///
/// Every write merges context additively; no update ever removes a key.
#[async_trait]
pub trait RunTracker: Send + Sync {
    /// Create the run if absent, set `running`, merge context, optionally bump attempts.
    async fn mark_running(
        &self,
        correlation_id: &CorrelationId,
        update: MarkRunning,
    ) -> Result<Run, RunStoreError>;

    /// Set `error` and record the message and its label.
    async fn mark_error(
        &self,
        correlation_id: &CorrelationId,
        error: &str,
        label: ErrorLabel,
    ) -> Result<Run, RunStoreError>;

    /// Set `completed`. Called by the final stage of the pipeline.
    async fn mark_completed(&self, correlation_id: &CorrelationId) -> Result<Run, RunStoreError>;

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<Run>, RunStoreError>;
}

/// Run store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunStoreError {
    #[error("failed to decode run row: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory run tracker for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRunTracker {
    runs: Mutex<HashMap<CorrelationId, Run>>,
}

impl InMemoryRunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<CorrelationId, Run>>, RunStoreError> {
        self.runs
            .lock()
            .map_err(|_| RunStoreError::Storage("in-memory run store lock poisoned".to_string()))
    }

    fn upsert<F>(&self, correlation_id: &CorrelationId, status: RunStatus, apply: F) -> Result<Run, RunStoreError>
    where
        F: FnOnce(&mut Run),
    {
        let now = Utc::now();
        let mut runs = self.lock()?;
        let run = runs
            .entry(correlation_id.clone())
            .or_insert_with(|| Run::new(correlation_id.clone(), status, now));

        run.status = status;
        apply(run);
        run.updated_at = now;

        Ok(run.clone())
    }
}

#[async_trait]
impl RunTracker for InMemoryRunTracker {
    async fn mark_running(
        &self,
        correlation_id: &CorrelationId,
        update: MarkRunning,
    ) -> Result<Run, RunStoreError> {
        self.upsert(correlation_id, RunStatus::Running, |run| {
            if update.increment_attempts {
                run.attempts += 1;
            }
            if update.resumed_at.is_some() {
                run.resumed_at = update.resumed_at;
            }
            merge_context(&mut run.context, update.context);
        })
    }

    async fn mark_error(
        &self,
        correlation_id: &CorrelationId,
        error: &str,
        label: ErrorLabel,
    ) -> Result<Run, RunStoreError> {
        self.upsert(correlation_id, RunStatus::Error, |run| {
            run.last_error = Some(error.to_string());
            run.last_error_stage = Some(label.to_string());
        })
    }

    async fn mark_completed(&self, correlation_id: &CorrelationId) -> Result<Run, RunStoreError> {
        self.upsert(correlation_id, RunStatus::Completed, |_| {})
    }

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<Run>, RunStoreError> {
        Ok(self.lock()?.get(correlation_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fulfillment_core::Stage;
    use serde_json::{Value, json};

    fn cid(s: &str) -> CorrelationId {
        CorrelationId::new(s).unwrap()
    }

    fn ctx(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn mark_running_creates_missing_run() {
        let tracker = InMemoryRunTracker::new();
        let run = tracker
            .mark_running(&cid("C1"), MarkRunning::default())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.attempts, 0);
        assert!(tracker.get(&cid("C1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn context_is_merged_across_updates() {
        let tracker = InMemoryRunTracker::new();
        let id = cid("C1");

        tracker
            .mark_running(&id, MarkRunning { context: ctx(json!({"a": 1})), ..Default::default() })
            .await
            .unwrap();
        let run = tracker
            .mark_running(&id, MarkRunning { context: ctx(json!({"b": 2})), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(Value::Object(run.context), json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn attempts_accumulate_only_when_requested() {
        let tracker = InMemoryRunTracker::new();
        let id = cid("C1");
        let now = Utc::now();

        tracker.mark_running(&id, MarkRunning::claimed(now, Default::default())).await.unwrap();
        tracker.mark_running(&id, MarkRunning::default()).await.unwrap();
        let run = tracker
            .mark_running(&id, MarkRunning::claimed(now, Default::default()))
            .await
            .unwrap();

        assert_eq!(run.attempts, 2);
        assert_eq!(run.resumed_at, Some(now));
    }

    #[tokio::test]
    async fn mark_error_records_label_and_keeps_context() {
        let tracker = InMemoryRunTracker::new();
        let id = cid("C1");

        tracker
            .mark_running(&id, MarkRunning::claimed(Utc::now(), ctx(json!({"event_id": "e1"}))))
            .await
            .unwrap();
        let run = tracker
            .mark_error(&id, "boom", ErrorLabel::worker(Stage::Ingest))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.last_error.as_deref(), Some("boom"));
        assert_eq!(run.last_error_stage.as_deref(), Some("ingest:worker-error"));
        assert_eq!(run.attempts, 1);
        assert_eq!(run.context.get("event_id"), Some(&json!("e1")));
    }

    #[tokio::test]
    async fn mark_completed_after_error() {
        let tracker = InMemoryRunTracker::new();
        let id = cid("C1");

        tracker.mark_error(&id, "boom", ErrorLabel::worker(Stage::Payment)).await.unwrap();
        let run = tracker.mark_completed(&id).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.last_error.as_deref(), Some("boom"));
    }
}
