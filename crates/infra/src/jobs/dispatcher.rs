//! Stage dispatcher: maps a job's stage to exactly one processor.
//!
//! Processors report a typed outcome. `Retryable` follows the attempts rule
//! (optionally overriding the backoff delay), `Fatal` ends the job at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use fulfillment_core::{CorrelationId, JobId, Stage, TriggerType};

use super::types::Job;

/// Normalized execution context handed to every processor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub correlation_id: CorrelationId,
    pub trigger_type: TriggerType,
    pub stage: Stage,
    pub job_id: JobId,
    /// 1-based attempt number of this claim
    pub attempt: u32,
    pub originating_event_id: Option<String>,
    pub originating_event_type: Option<String>,
    /// The job's full context map (tenant identifiers etc.)
    pub context: Map<String, Value>,
}

impl RunContext {
    pub fn for_job(job: &Job) -> Self {
        Self {
            correlation_id: job.correlation_id.clone(),
            trigger_type: job.trigger_type.clone(),
            stage: job.stage,
            job_id: job.id,
            attempt: job.attempts,
            originating_event_id: job.event_id().map(str::to_string),
            originating_event_type: job.event_type().map(str::to_string),
            context: job.context.clone(),
        }
    }
}

/// Failure reported by a stage processor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Transient; the job is requeued while attempts remain.
    #[error("{message}")]
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Permanent; the job goes straight to `error`.
    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    pub fn retryable(message: impl Into<String>) -> Self {
        StageError::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn retry_after(message: impl Into<String>, delay: Duration) -> Self {
        StageError::Retryable {
            message: message.into(),
            retry_after: Some(delay),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StageError::Fatal(message.into())
    }
}

/// One external processor per stage.
///
/// Delivery is at-least-once; implementations should be idempotent or dedupe
/// on `ctx.correlation_id`.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(&self, payload: &Value, ctx: &RunContext) -> Result<(), StageError>;
}

/// Adapts an async closure into a [`StageProcessor`].
pub struct FnProcessor<F>(F);

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> StageProcessor for FnProcessor<F>
where
    F: Fn(Value, RunContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StageError>> + Send,
{
    async fn process(&self, payload: &Value, ctx: &RunContext) -> Result<(), StageError> {
        (self.0)(payload.clone(), ctx.clone()).await
    }
}

/// Dispatch error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no processor registered for stage {0}")]
    UnknownStage(Stage),
    #[error(transparent)]
    Stage(#[from] StageError),
}

impl DispatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Stage(StageError::Fatal(_)))
    }

    /// Delay requested by the processor, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DispatchError::Stage(StageError::Retryable { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }
}

/// Stage → processor registry.
#[derive(Default, Clone)]
pub struct Dispatcher {
    processors: HashMap<Stage, Arc<dyn StageProcessor>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the processor for a stage.
    pub fn register(&mut self, stage: Stage, processor: Arc<dyn StageProcessor>) -> &mut Self {
        self.processors.insert(stage, processor);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, stage: Stage, f: F) -> &mut Self
    where
        F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        self.register(stage, Arc::new(FnProcessor::new(f)))
    }

    /// Stages with a registered processor.
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .iter()
            .copied()
            .filter(|s| self.processors.contains_key(s))
            .collect()
    }

    /// Invoke the processor for `job.stage` with its payload and context.
    pub async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        let processor = self
            .processors
            .get(&job.stage)
            .ok_or(DispatchError::UnknownStage(job.stage))?;

        let ctx = RunContext::for_job(job);
        processor.process(&job.payload, &ctx).await?;
        Ok(())
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stages", &self.stages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::NewJob;
    use chrono::Utc;
    use fulfillment_core::WorkerId;
    use serde_json::json;
    use std::sync::Mutex;

    fn claimed_job(stage: Stage) -> Job {
        let mut job = NewJob::new(
            CorrelationId::new("C1").unwrap(),
            TriggerType::CustomerCreated,
            stage,
            json!({"customer": 7}),
        )
        .with_event("evt_1", "customer.created")
        .with_context("tenant", "t1")
        .into_job(Utc::now());
        job.claim(&WorkerId::new("w1").unwrap(), Utc::now(), Duration::from_secs(60));
        job
    }

    #[tokio::test]
    async fn dispatch_invokes_processor_with_normalized_context() {
        let seen: Arc<Mutex<Option<(Value, RunContext)>>> = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn(Stage::Ingest, move |payload, ctx| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = Some((payload, ctx));
                Ok(())
            }
        });

        let job = claimed_job(Stage::Ingest);
        dispatcher.dispatch(&job).await.unwrap();

        let (payload, ctx) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(payload, json!({"customer": 7}));
        assert_eq!(ctx.job_id, job.id);
        assert_eq!(ctx.stage, Stage::Ingest);
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.originating_event_id.as_deref(), Some("evt_1"));
        assert_eq!(ctx.originating_event_type.as_deref(), Some("customer.created"));
        assert_eq!(ctx.context.get("tenant"), Some(&json!("t1")));
    }

    #[tokio::test]
    async fn unknown_stage_is_a_retryable_dispatch_error() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher.dispatch(&claimed_job(Stage::Payment)).await.unwrap_err();

        assert_eq!(err, DispatchError::UnknownStage(Stage::Payment));
        assert!(!err.is_fatal());
        assert_eq!(err.retry_after(), None);
    }

    #[tokio::test]
    async fn processor_errors_keep_their_classification() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_fn(Stage::Booking, |_, _| async {
                Err(StageError::retry_after("rate limited", Duration::from_secs(30)))
            })
            .register_fn(Stage::Payment, |_, _| async { Err(StageError::fatal("card declined")) });

        let err = dispatcher.dispatch(&claimed_job(Stage::Booking)).await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(err.to_string(), "rate limited");

        let err = dispatcher.dispatch(&claimed_job(Stage::Payment)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn stages_lists_registered_in_pipeline_order() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_fn(Stage::PaymentSave, |_, _| async { Ok(()) })
            .register_fn(Stage::Ingest, |_, _| async { Ok(()) });

        assert_eq!(dispatcher.stages(), vec![Stage::Ingest, Stage::PaymentSave]);
    }

    #[test]
    fn run_context_serializes_camel_case() {
        let ctx = RunContext::for_job(&claimed_job(Stage::Ingest));
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["correlationId"], json!("C1"));
        assert_eq!(value["triggerType"], json!("customer-created"));
        assert_eq!(value["originatingEventId"], json!("evt_1"));
    }
}
