//! The claim → dispatch → complete/fail cycle.
//!
//! Both execution modes call [`JobRunner::run_once`]: the scheduler-triggered
//! drain calls it in a bounded loop, the continuous worker in an endless one.
//! Bookkeeping always lands on both the job row and the run record before the
//! retry/terminal decision is applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fulfillment_core::{CorrelationId, JobId, Stage, WorkerId};

use super::breaker::BreakerPolicy;
use super::dispatcher::{DispatchError, Dispatcher};
use super::store::{JobStore, JobStoreError};
use super::types::{FailOptions, FailOutcome, Job, ReapReport};
use crate::runs::{ErrorLabel, MarkRunning, RunStoreError, RunTracker};

/// Run-context keys the runner stamps on every claim.
pub const CONTEXT_LAST_JOB_ID: &str = "last_job_id";
pub const CONTEXT_LAST_STAGE: &str = "last_stage";

/// Runner configuration.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Lease granted on claim and on every heartbeat
    pub lease_ttl: Duration,
    /// Heartbeat cadence while a job is in flight; zero disables heartbeats
    pub heartbeat_interval: Duration,
    pub breaker: BreakerPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            breaker: BreakerPolicy::default(),
        }
    }
}

/// Result of one `run_once` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOnce {
    pub processed: bool,
    pub job_id: Option<JobId>,
    pub stage: Option<Stage>,
}

impl RunOnce {
    pub fn idle() -> Self {
        Self {
            processed: false,
            job_id: None,
            stage: None,
        }
    }

    fn processed(job: &Job) -> Self {
        Self {
            processed: true,
            job_id: Some(job.id),
            stage: Some(job.stage),
        }
    }
}

/// A claimed job whose stage failed, after bookkeeping.
#[derive(Debug, Clone, thiserror::Error)]
#[error("job {job_id} ({stage}) failed on attempt {attempts}: {error}")]
pub struct JobFailure {
    pub job_id: JobId,
    pub correlation_id: CorrelationId,
    pub stage: Stage,
    pub attempts: u32,
    pub outcome: FailOutcome,
    /// The failure reached the breaker threshold
    pub breaker_tripped: bool,
    #[source]
    pub error: DispatchError,
}

/// Runner error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error("run tracker error: {0}")]
    Runs(#[from] RunStoreError),
    #[error("{0}")]
    Job(Box<JobFailure>),
}

impl RunnerError {
    /// The job-level failure, if this error is one.
    pub fn job_failure(&self) -> Option<&JobFailure> {
        match self {
            RunnerError::Job(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Claims and processes one job at a time.
#[derive(Clone)]
pub struct JobRunner {
    jobs: Arc<dyn JobStore>,
    runs: Arc<dyn RunTracker>,
    dispatcher: Arc<Dispatcher>,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        runs: Arc<dyn RunTracker>,
        dispatcher: Arc<Dispatcher>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            jobs,
            runs,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn runs(&self) -> &Arc<dyn RunTracker> {
        &self.runs
    }

    /// Claim one eligible job and run it to completion or failure.
    ///
    /// Returns `processed = false` when nothing is eligible. A stage failure is
    /// returned as [`RunnerError::Job`] once it has been recorded.
    pub async fn run_once(
        &self,
        worker_id: &WorkerId,
        exclude_stages: &[Stage],
    ) -> Result<RunOnce, RunnerError> {
        let Some(job) = self
            .jobs
            .claim_next(worker_id, exclude_stages, self.config.lease_ttl)
            .await?
        else {
            return Ok(RunOnce::idle());
        };

        debug!(
            job_id = %job.id,
            correlation_id = %job.correlation_id,
            stage = %job.stage,
            attempts = job.attempts,
            worker_id = %worker_id,
            "claimed job"
        );

        if let Err(err) = self.mark_running(&job).await {
            self.release_after_bookkeeping_error(&job, &err).await;
            return Err(err.into());
        }

        let result = {
            let _heartbeat = self.spawn_heartbeat(&job, worker_id);
            self.dispatcher.dispatch(&job).await
        };

        match result {
            Ok(()) => {
                if !self.jobs.complete(&job).await? {
                    warn!(
                        job_id = %job.id,
                        worker_id = %worker_id,
                        "job finished after ownership was lost; completion skipped"
                    );
                }
                debug!(job_id = %job.id, stage = %job.stage, "job completed");
                Ok(RunOnce::processed(&job))
            }
            Err(err) => Err(self.record_failure(&job, err).await),
        }
    }

    /// One reaper pass over expired leases.
    pub async fn reap(&self) -> Result<ReapReport, JobStoreError> {
        let report = self.jobs.reap_expired().await?;
        if report.total() > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                "released jobs with expired leases"
            );
        }
        Ok(report)
    }

    async fn mark_running(&self, job: &Job) -> Result<(), RunStoreError> {
        let mut context: Map<String, Value> = job.context.clone();
        context.insert(CONTEXT_LAST_JOB_ID.to_string(), Value::String(job.id.to_string()));
        context.insert(CONTEXT_LAST_STAGE.to_string(), Value::String(job.stage.to_string()));

        self.runs
            .mark_running(&job.correlation_id, MarkRunning::claimed(Utc::now(), context))
            .await?;
        Ok(())
    }

    /// The run record could not be updated; hand the job back instead of
    /// processing it untracked.
    async fn release_after_bookkeeping_error(&self, job: &Job, err: &RunStoreError) {
        let message = format!("run tracker unavailable: {}", err);
        match self.jobs.fail(job, &message, FailOptions::default()).await {
            Ok(outcome) => warn!(
                job_id = %job.id,
                correlation_id = %job.correlation_id,
                error = %err,
                outcome = ?outcome,
                "released job after run tracker error"
            ),
            Err(store_err) => error!(
                job_id = %job.id,
                error = %err,
                store_error = %store_err,
                "failed to release job after run tracker error"
            ),
        }
    }

    async fn record_failure(&self, job: &Job, err: DispatchError) -> RunnerError {
        let message = err.to_string();
        let label = if err.is_fatal() {
            ErrorLabel::stage(job.stage)
        } else {
            ErrorLabel::worker(job.stage)
        };

        // The job row carries the divergence when the run record cannot follow.
        let row_error = match self.runs.mark_error(&job.correlation_id, &message, label).await {
            Ok(_) => message.clone(),
            Err(run_err) => {
                error!(
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    error = %run_err,
                    "failed to record run error"
                );
                format!("{} (run record not updated: {})", message, run_err)
            }
        };

        let breaker_tripped = self.config.breaker.trips(job.attempts);
        let opts = FailOptions {
            delay: if breaker_tripped {
                Some(self.config.breaker.cooldown)
            } else {
                err.retry_after()
            },
            terminal: err.is_fatal(),
            ..Default::default()
        };

        let outcome = match self.jobs.fail(job, &row_error, opts).await {
            Ok(outcome) => outcome,
            Err(store_err) => {
                error!(
                    job_id = %job.id,
                    error = %message,
                    store_error = %store_err,
                    "failed to record job failure"
                );
                return RunnerError::Store(store_err);
            }
        };

        if outcome.is_terminal() {
            error!(
                job_id = %job.id,
                correlation_id = %job.correlation_id,
                stage = %job.stage,
                attempts = job.attempts,
                error = %message,
                "job failed permanently"
            );
        } else {
            warn!(
                job_id = %job.id,
                correlation_id = %job.correlation_id,
                stage = %job.stage,
                attempts = job.attempts,
                breaker_tripped,
                outcome = ?outcome,
                error = %message,
                "job failed"
            );
        }

        RunnerError::Job(Box::new(JobFailure {
            job_id: job.id,
            correlation_id: job.correlation_id.clone(),
            stage: job.stage,
            attempts: job.attempts,
            outcome,
            breaker_tripped,
            error: err,
        }))
    }

    fn spawn_heartbeat(&self, job: &Job, worker_id: &WorkerId) -> Option<HeartbeatGuard> {
        let every = self.config.heartbeat_interval;
        if every.is_zero() {
            return None;
        }

        let jobs = self.jobs.clone();
        let job_id = job.id;
        let worker_id = worker_id.clone();
        let lease_ttl = self.config.lease_ttl;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match jobs.heartbeat(job_id, &worker_id, lease_ttl).await {
                    Ok(true) => debug!(job_id = %job_id, "lease extended"),
                    Ok(false) => {
                        warn!(job_id = %job_id, worker_id = %worker_id, "lease lost");
                        break;
                    }
                    Err(err) => warn!(job_id = %job_id, error = %err, "heartbeat failed"),
                }
            }
        });

        Some(HeartbeatGuard(handle))
    }
}

impl core::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish()
    }
}

/// Stops the heartbeat task when the dispatch scope ends, even on panic or cancel.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::dispatcher::StageError;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, NewJob};
    use crate::runs::{InMemoryRunTracker, Run, RunStatus};
    use async_trait::async_trait;
    use fulfillment_core::TriggerType;
    use serde_json::json;

    struct Harness {
        jobs: Arc<InMemoryJobStore>,
        runs: Arc<InMemoryRunTracker>,
        worker: WorkerId,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                jobs: Arc::new(InMemoryJobStore::new()),
                runs: Arc::new(InMemoryRunTracker::new()),
                worker: WorkerId::new("w1").unwrap(),
            }
        }

        fn runner(&self, dispatcher: Dispatcher) -> JobRunner {
            self.runner_with(dispatcher, RunnerConfig::default())
        }

        fn runner_with(&self, dispatcher: Dispatcher, config: RunnerConfig) -> JobRunner {
            JobRunner::new(self.jobs.clone(), self.runs.clone(), Arc::new(dispatcher), config)
        }

        async fn enqueue(&self, stage: Stage, max_attempts: u32) -> Job {
            self.jobs
                .enqueue(
                    NewJob::new(cid(), TriggerType::CustomerCreated, stage, json!({}))
                        .with_max_attempts(max_attempts)
                        .with_event("evt_1", "customer.created"),
                )
                .await
                .unwrap()
        }

        async fn run(&self) -> Run {
            self.runs.get(&cid()).await.unwrap().unwrap()
        }
    }

    fn cid() -> CorrelationId {
        CorrelationId::new("C1").unwrap()
    }

    fn failing(stage: Stage, err: StageError) -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn(stage, move |_, _| {
            let err = err.clone();
            async move { Err(err) }
        });
        dispatcher
    }

    #[tokio::test]
    async fn idle_run_has_no_side_effects() {
        let h = Harness::new();
        let result = h.runner(Dispatcher::new()).run_once(&h.worker, &[]).await.unwrap();

        assert_eq!(result, RunOnce::idle());
        assert!(h.runs.get(&cid()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn success_completes_job_and_marks_run_running() {
        let h = Harness::new();
        let job = h.enqueue(Stage::Ingest, 3).await;

        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn(Stage::Ingest, |_, _| async { Ok(()) });

        let result = h.runner(dispatcher).run_once(&h.worker, &[]).await.unwrap();
        assert!(result.processed);
        assert_eq!(result.job_id, Some(job.id));
        assert_eq!(result.stage, Some(Stage::Ingest));

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.lock_owner.is_none());

        let run = h.run().await;
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.attempts, 1);
        assert!(run.resumed_at.is_some());
        assert_eq!(run.context.get("event_id"), Some(&json!("evt_1")));
        assert_eq!(run.context.get(CONTEXT_LAST_STAGE), Some(&json!("ingest")));
    }

    #[tokio::test]
    async fn retryable_failure_is_recorded_on_job_and_run() {
        let h = Harness::new();
        let job = h.enqueue(Stage::Ingest, 3).await;
        let runner = h.runner(failing(Stage::Ingest, StageError::retryable("downstream 502")));

        let err = runner.run_once(&h.worker, &[]).await.unwrap_err();
        let failure = err.job_failure().unwrap();
        assert_eq!(failure.job_id, job.id);
        assert_eq!(failure.attempts, 1);
        assert!(!failure.breaker_tripped);
        assert!(matches!(failure.outcome, FailOutcome::Requeued { .. }));

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.last_error.as_deref(), Some("downstream 502"));
        assert!(stored.scheduled_at > Utc::now());

        let run = h.run().await;
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.last_error.as_deref(), Some("downstream 502"));
        assert_eq!(run.last_error_stage.as_deref(), Some("ingest:worker-error"));
    }

    #[tokio::test]
    async fn fatal_failure_is_terminal_on_first_attempt() {
        let h = Harness::new();
        let job = h.enqueue(Stage::Payment, 3).await;
        let runner = h.runner(failing(Stage::Payment, StageError::fatal("card declined")));

        let err = runner.run_once(&h.worker, &[]).await.unwrap_err();
        assert_eq!(err.job_failure().unwrap().outcome, FailOutcome::Terminal);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.attempts, 1);
        assert_eq!(
            h.run().await.last_error_stage.as_deref(),
            Some("payment:stage-error")
        );
    }

    #[tokio::test]
    async fn processor_retry_after_overrides_backoff() {
        let h = Harness::new();
        let job = h.enqueue(Stage::Booking, 3).await;
        let runner = h.runner(failing(
            Stage::Booking,
            StageError::retry_after("rate limited", Duration::from_secs(120)),
        ));

        let before = Utc::now();
        runner.run_once(&h.worker, &[]).await.unwrap_err();

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        let delay = stored.scheduled_at - before;
        assert!(delay >= chrono::Duration::seconds(119));
        assert!(delay <= chrono::Duration::seconds(121));
    }

    #[tokio::test]
    async fn breaker_threshold_elevates_retry_delay() {
        let h = Harness::new();
        let job = h.enqueue(Stage::Booking, 5).await;
        let config = RunnerConfig {
            breaker: BreakerPolicy {
                threshold: 3,
                cooldown: Duration::from_secs(600),
            },
            ..Default::default()
        };
        let runner = h.runner_with(failing(Stage::Booking, StageError::retryable("down")), config);

        for attempt in 1..=3u32 {
            let mut stored = h.jobs.get(job.id).await.unwrap().unwrap();
            stored.scheduled_at = Utc::now();
            h.jobs.insert(stored).unwrap();

            let err = runner.run_once(&h.worker, &[]).await.unwrap_err();
            assert_eq!(err.job_failure().unwrap().breaker_tripped, attempt >= 3);
        }

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(stored.scheduled_at - Utc::now() > chrono::Duration::seconds(590));
    }

    #[tokio::test]
    async fn unknown_stage_follows_retry_path() {
        let h = Harness::new();
        let job = h.enqueue(Stage::PaymentSave, 3).await;

        let err = h.runner(Dispatcher::new()).run_once(&h.worker, &[]).await.unwrap_err();
        let failure = err.job_failure().unwrap();
        assert!(matches!(failure.error, DispatchError::UnknownStage(Stage::PaymentSave)));

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn excluded_stage_is_not_claimed() {
        let h = Harness::new();
        h.enqueue(Stage::Booking, 3).await;

        let result = h
            .runner(Dispatcher::new())
            .run_once(&h.worker, &[Stage::Booking])
            .await
            .unwrap();
        assert!(!result.processed);
    }

    struct UnavailableRuns;

    #[async_trait]
    impl RunTracker for UnavailableRuns {
        async fn mark_running(&self, _: &CorrelationId, _: MarkRunning) -> Result<Run, RunStoreError> {
            Err(RunStoreError::Unavailable("down".into()))
        }

        async fn mark_error(&self, _: &CorrelationId, _: &str, _: ErrorLabel) -> Result<Run, RunStoreError> {
            Err(RunStoreError::Unavailable("down".into()))
        }

        async fn mark_completed(&self, _: &CorrelationId) -> Result<Run, RunStoreError> {
            Err(RunStoreError::Unavailable("down".into()))
        }

        async fn get(&self, _: &CorrelationId) -> Result<Option<Run>, RunStoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn run_tracker_error_releases_job_without_dispatch() {
        let h = Harness::new();
        let job = h.enqueue(Stage::Ingest, 3).await;

        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn(Stage::Ingest, |_, _| async {
            Err(StageError::fatal("dispatched without a run record"))
        });
        let runner = JobRunner::new(
            h.jobs.clone(),
            Arc::new(UnavailableRuns),
            Arc::new(dispatcher),
            RunnerConfig::default(),
        );

        let err = runner.run_once(&h.worker, &[]).await.unwrap_err();
        assert!(matches!(err, RunnerError::Runs(_)));

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(stored.lock_owner.is_none());
    }

    /// Tracks runs normally but cannot record errors.
    struct ErrorsNotRecorded(InMemoryRunTracker);

    #[async_trait]
    impl RunTracker for ErrorsNotRecorded {
        async fn mark_running(&self, id: &CorrelationId, update: MarkRunning) -> Result<Run, RunStoreError> {
            self.0.mark_running(id, update).await
        }

        async fn mark_error(&self, _: &CorrelationId, _: &str, _: ErrorLabel) -> Result<Run, RunStoreError> {
            Err(RunStoreError::Unavailable("runs table locked".into()))
        }

        async fn mark_completed(&self, id: &CorrelationId) -> Result<Run, RunStoreError> {
            self.0.mark_completed(id).await
        }

        async fn get(&self, id: &CorrelationId) -> Result<Option<Run>, RunStoreError> {
            self.0.get(id).await
        }
    }

    #[tokio::test]
    async fn unrecorded_run_error_is_noted_on_job_row() {
        let h = Harness::new();
        let job = h.enqueue(Stage::Payment, 3).await;
        let runner = JobRunner::new(
            h.jobs.clone(),
            Arc::new(ErrorsNotRecorded(InMemoryRunTracker::new())),
            Arc::new(failing(Stage::Payment, StageError::retryable("gateway 502"))),
            RunnerConfig::default(),
        );

        let err = runner.run_once(&h.worker, &[]).await.unwrap_err();
        assert!(matches!(
            err.job_failure().map(|f| f.outcome),
            Some(FailOutcome::Requeued { .. })
        ));

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        let last_error = stored.last_error.unwrap();
        assert!(last_error.starts_with("gateway 502"));
        assert!(last_error.contains("run record not updated"));
        assert!(last_error.contains("runs table locked"));
    }

    #[tokio::test]
    async fn heartbeat_extends_lease_while_in_flight() {
        let h = Harness::new();
        let job = h.enqueue(Stage::Ingest, 3).await;

        let jobs = h.jobs.clone();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn(Stage::Ingest, move |_, ctx| {
            let jobs = jobs.clone();
            async move {
                let first = jobs.get(ctx.job_id).await.unwrap().unwrap().lease_expires_at;
                tokio::time::sleep(Duration::from_millis(80)).await;
                let later = jobs.get(ctx.job_id).await.unwrap().unwrap().lease_expires_at;
                if later > first {
                    Ok(())
                } else {
                    Err(StageError::fatal("lease was not extended"))
                }
            }
        });

        let config = RunnerConfig {
            heartbeat_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let result = h.runner_with(dispatcher, config).run_once(&h.worker, &[]).await;

        assert!(result.unwrap().processed);
        assert_eq!(
            h.jobs.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
