//! Continuous worker loop.
//!
//! Repeats the shared runner cycle until a stop flag is raised. Job failures
//! are logged and fed into the stage breaker; they never end the loop. Store
//! errors count as "no progress" and back off for one poll interval.
//! Shutdown is observed between jobs and during the idle sleep, so an
//! in-flight job always runs to completion.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, warn};

use fulfillment_core::{Stage, WorkerId};

use super::breaker::CircuitBreaker;
use super::runner::{JobRunner, RunOnce, RunnerError};

/// Worker loop settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: WorkerId,
    /// Idle sleep when nothing is claimable
    pub poll_interval: Duration,
    /// Cadence of the expired-lease reaper
    pub reap_interval: Duration,
}

impl WorkerSettings {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            poll_interval: Duration::from_secs(2),
            reap_interval: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_failed_permanently: u64,
    pub idle_polls: u64,
    pub store_errors: u64,
    pub breaker_trips: u64,
    pub leases_reaped: u64,
}

impl WorkerStats {
    pub fn jobs_processed(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed
    }
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Processed(RunOnce),
    Failed { stage: Stage, breaker_tripped: bool },
    Idle,
    StoreError,
}

impl Tick {
    /// Whether the loop should sleep before the next iteration.
    fn should_sleep(&self) -> bool {
        matches!(self, Tick::Idle | Tick::StoreError)
    }
}

/// Long-lived worker owning its breaker state.
#[derive(Debug)]
pub struct Worker {
    runner: JobRunner,
    breaker: CircuitBreaker,
    settings: WorkerSettings,
    stats: WorkerStats,
    next_reap: Instant,
}

impl Worker {
    pub fn new(runner: JobRunner, settings: WorkerSettings) -> Self {
        let breaker = CircuitBreaker::new(runner.config().breaker.cooldown);
        Self {
            runner,
            breaker,
            settings,
            stats: WorkerStats::default(),
            next_reap: Instant::now(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One iteration: reap if due, claim with open stages excluded, process.
    pub async fn tick(&mut self) -> Tick {
        self.reap_if_due().await;

        let exclude = self.breaker.excluded(Utc::now());
        match self.runner.run_once(&self.settings.worker_id, &exclude).await {
            Ok(result) if result.processed => {
                self.stats.jobs_succeeded += 1;
                Tick::Processed(result)
            }
            Ok(_) => {
                self.stats.idle_polls += 1;
                Tick::Idle
            }
            Err(RunnerError::Job(failure)) => {
                self.stats.jobs_failed += 1;
                if failure.outcome.is_terminal() {
                    self.stats.jobs_failed_permanently += 1;
                }
                if failure.breaker_tripped {
                    self.stats.breaker_trips += 1;
                    self.breaker.trip(failure.stage, Utc::now());
                }
                Tick::Failed {
                    stage: failure.stage,
                    breaker_tripped: failure.breaker_tripped,
                }
            }
            Err(err) => {
                self.stats.store_errors += 1;
                error!(
                    worker_id = %self.settings.worker_id,
                    error = %err,
                    "worker cycle failed"
                );
                Tick::StoreError
            }
        }
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        info!(
            worker_id = %self.settings.worker_id,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "worker started"
        );

        while !*shutdown.borrow() {
            let tick = self.tick().await;
            if !tick.should_sleep() || *shutdown.borrow() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            worker_id = %self.settings.worker_id,
            processed = self.stats.jobs_processed(),
            failed = self.stats.jobs_failed,
            "worker stopped"
        );
        self.stats
    }

    /// Spawn the loop on the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn reap_if_due(&mut self) {
        let now = Instant::now();
        if now < self.next_reap {
            return;
        }
        self.next_reap = now + self.settings.reap_interval;

        match self.runner.reap().await {
            Ok(report) => self.stats.leases_reaped += report.total(),
            Err(err) => warn!(worker_id = %self.settings.worker_id, error = %err, "reaper pass failed"),
        }
    }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    /// Raise the stop flag without waiting.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop claiming new work and wait for the in-flight job to finish.
    pub async fn shutdown(self) -> Result<WorkerStats, JoinError> {
        self.request_shutdown();
        self.join.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::breaker::BreakerPolicy;
    use crate::jobs::dispatcher::{Dispatcher, StageError};
    use crate::jobs::store::{InMemoryJobStore, JobStore, JobStoreError};
    use crate::jobs::types::{FailOptions, FailOutcome, Job, JobStats, JobStatus, NewJob, ReapReport};
    use crate::jobs::RunnerConfig;
    use crate::runs::InMemoryRunTracker;
    use async_trait::async_trait;
    use fulfillment_core::{CorrelationId, JobId, TriggerType};
    use serde_json::json;
    use std::sync::Arc;

    fn new_job(correlation: &str, stage: Stage) -> NewJob {
        NewJob::new(
            CorrelationId::new(correlation).unwrap(),
            TriggerType::BookingCreated,
            stage,
            json!({}),
        )
        .with_max_attempts(5)
    }

    fn worker_with(jobs: Arc<dyn JobStore>, dispatcher: Dispatcher) -> Worker {
        let config = RunnerConfig {
            breaker: BreakerPolicy {
                threshold: 3,
                cooldown: Duration::from_secs(60),
            },
            ..Default::default()
        };
        let runner = JobRunner::new(
            jobs,
            Arc::new(InMemoryRunTracker::new()),
            Arc::new(dispatcher),
            config,
        );
        Worker::new(
            runner,
            WorkerSettings::new(WorkerId::new("loop-1").unwrap())
                .with_poll_interval(Duration::from_millis(10)),
        )
    }

    fn booking_fails_ingest_succeeds() -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_fn(Stage::Booking, |_, _| async { Err(StageError::retryable("booking api down")) })
            .register_fn(Stage::Ingest, |_, _| async { Ok(()) });
        dispatcher
    }

    #[tokio::test]
    async fn idle_tick_when_queue_is_empty() {
        let mut worker = worker_with(Arc::new(InMemoryJobStore::new()), Dispatcher::new());
        assert_eq!(worker.tick().await, Tick::Idle);
        assert_eq!(worker.stats().idle_polls, 1);
    }

    #[tokio::test]
    async fn tripped_stage_is_skipped_while_other_stages_progress() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let mut worker = worker_with(jobs.clone(), booking_fails_ingest_succeeds());

        let mut flaky = new_job("B1", Stage::Booking).into_job(Utc::now());
        flaky.attempts = 2;
        jobs.insert(flaky).unwrap();

        assert_eq!(
            worker.tick().await,
            Tick::Failed {
                stage: Stage::Booking,
                breaker_tripped: true
            }
        );
        assert!(worker.breaker().is_open(Stage::Booking, Utc::now()));

        let blocked = jobs.enqueue(new_job("B2", Stage::Booking)).await.unwrap();
        let ingest = jobs.enqueue(new_job("I1", Stage::Ingest)).await.unwrap();

        match worker.tick().await {
            Tick::Processed(result) => assert_eq!(result.job_id, Some(ingest.id)),
            other => panic!("expected ingest job to run, got {:?}", other),
        }
        assert_eq!(worker.tick().await, Tick::Idle);

        let blocked = jobs.get(blocked.id).await.unwrap().unwrap();
        assert_eq!(blocked.status, JobStatus::Queued);
        assert_eq!(blocked.attempts, 0);
        assert_eq!(worker.stats().breaker_trips, 1);
    }

    #[tokio::test]
    async fn failures_below_threshold_keep_breaker_closed() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let mut worker = worker_with(jobs.clone(), booking_fails_ingest_succeeds());
        jobs.enqueue(new_job("B1", Stage::Booking)).await.unwrap();

        assert_eq!(
            worker.tick().await,
            Tick::Failed {
                stage: Stage::Booking,
                breaker_tripped: false
            }
        );
        assert!(!worker.breaker().is_open(Stage::Booking, Utc::now()));
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_job() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let job = jobs.enqueue(new_job("S1", Stage::Ingest)).await.unwrap();

        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn(Stage::Ingest, |_, _| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        });

        let handle = worker_with(jobs.clone(), dispatcher).spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = handle.shutdown().await.unwrap();

        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(
            jobs.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_idle_sleep() {
        let mut worker = worker_with(Arc::new(InMemoryJobStore::new()), Dispatcher::new());
        worker.settings.poll_interval = Duration::from_secs(3600);

        let handle = worker.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("worker did not stop")
            .unwrap();
        assert!(stats.idle_polls <= 1);
    }

    struct UnavailableStore;

    #[async_trait]
    impl JobStore for UnavailableStore {
        async fn enqueue(&self, _: NewJob) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Unavailable("down".into()))
        }
        async fn get(&self, _: JobId) -> Result<Option<Job>, JobStoreError> {
            Err(JobStoreError::Unavailable("down".into()))
        }
        async fn claim_next(&self, _: &WorkerId, _: &[Stage], _: Duration) -> Result<Option<Job>, JobStoreError> {
            Err(JobStoreError::Unavailable("down".into()))
        }
        async fn heartbeat(&self, _: JobId, _: &WorkerId, _: Duration) -> Result<bool, JobStoreError> {
            Err(JobStoreError::Unavailable("down".into()))
        }
        async fn complete(&self, _: &Job) -> Result<bool, JobStoreError> {
            Err(JobStoreError::Unavailable("down".into()))
        }
        async fn fail(&self, _: &Job, _: &str, _: FailOptions) -> Result<FailOutcome, JobStoreError> {
            Err(JobStoreError::Unavailable("down".into()))
        }
        async fn reap_expired(&self) -> Result<ReapReport, JobStoreError> {
            Err(JobStoreError::Unavailable("down".into()))
        }
        async fn stats(&self) -> Result<JobStats, JobStoreError> {
            Err(JobStoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_errors_do_not_stop_the_loop() {
        let handle = worker_with(Arc::new(UnavailableStore), Dispatcher::new()).spawn();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stats = handle.shutdown().await.unwrap();
        assert!(stats.store_errors >= 2);
        assert_eq!(stats.jobs_processed(), 0);
    }
}
