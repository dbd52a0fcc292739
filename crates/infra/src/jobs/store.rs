//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use fulfillment_core::{JobId, Stage, WorkerId};

use super::types::{
    BackoffPolicy, FailOptions, FailOutcome, Job, JobStats, JobStatus, NewJob, ReapReport,
    to_chrono,
};

/// Persistence and atomic state transitions over job rows.
///
/// Implementations must make `claim_next` a single atomic step: two concurrent
/// callers never receive the same row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `queued` row.
    async fn enqueue(&self, job: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim the oldest eligible row (`queued`, `scheduled_at <= now`, stage
    /// not excluded), ordered by `scheduled_at` then `created_at`.
    ///
    /// Returns `None` when nothing is eligible; that is not an error.
    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        exclude_stages: &[Stage],
        lease_ttl: Duration,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Extend the lease of a job still running under `worker_id`.
    ///
    /// `false` means the worker no longer owns the row.
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        lease_ttl: Duration,
    ) -> Result<bool, JobStoreError>;

    /// Mark a claimed job `completed`. A second call is a no-op returning `false`.
    async fn complete(&self, job: &Job) -> Result<bool, JobStoreError>;

    /// Requeue with backoff, or move to terminal `error` once attempts are exhausted
    /// (or `opts.terminal` is set).
    async fn fail(
        &self,
        job: &Job,
        error: &str,
        opts: FailOptions,
    ) -> Result<FailOutcome, JobStoreError>;

    /// Release every running row whose lease has expired.
    async fn reap_expired(&self) -> Result<ReapReport, JobStoreError>;

    /// Job counts by status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("failed to decode job row: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

pub(crate) const LEASE_EXPIRED: &str = "lease expired";

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    backoff: BackoffPolicy,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Replace the default backoff applied by `fail` when no delay is given.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Insert a fully-formed row, bypassing `enqueue` (tests and fixtures).
    pub fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        self.lock()?.insert(job.id, job);
        Ok(())
    }

    /// Snapshot of every row for a correlation id, oldest first.
    pub fn jobs_for(&self, correlation_id: &str) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<_> = self
            .lock()?
            .values()
            .filter(|j| j.correlation_id.as_str() == correlation_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory job store lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let job = job.into_job(Utc::now());
        self.lock()?.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        exclude_stages: &[Stage],
        lease_ttl: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        // Select and transition under one guard; that is the atomic step.
        let mut jobs = self.lock()?;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now, exclude_stages))
            .min_by_key(|j| (j.scheduled_at, j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.claim(worker_id, now, lease_ttl);
                job.clone()
            })
        }))
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        lease_ttl: Duration,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.lock()?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.is_owned_by(worker_id) => {
                let now = Utc::now();
                job.lease_expires_at = Some(now + to_chrono(lease_ttl));
                job.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    async fn complete(&self, job: &Job) -> Result<bool, JobStoreError> {
        let mut jobs = self.lock()?;
        let row = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;

        match &job.lock_owner {
            Some(owner) if row.is_owned_by(owner) => {
                row.release(JobStatus::Completed, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        job: &Job,
        error: &str,
        opts: FailOptions,
    ) -> Result<FailOutcome, JobStoreError> {
        let mut jobs = self.lock()?;
        let row = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;

        let owned = job.lock_owner.as_ref().is_some_and(|owner| row.is_owned_by(owner));
        if !owned {
            return Ok(FailOutcome::NotOwned);
        }

        let now = Utc::now();
        row.last_error = Some(error.to_string());
        row.context.extend(opts.context);

        if row.has_attempts_left() && !opts.terminal {
            let delay = opts
                .delay
                .unwrap_or_else(|| self.backoff.delay_for_attempt(row.attempts));
            row.scheduled_at = now + to_chrono(delay);
            row.release(JobStatus::Queued, now);
            Ok(FailOutcome::Requeued {
                scheduled_at: row.scheduled_at,
            })
        } else {
            row.release(JobStatus::Error, now);
            Ok(FailOutcome::Terminal)
        }
    }

    async fn reap_expired(&self) -> Result<ReapReport, JobStoreError> {
        let mut jobs = self.lock()?;
        let now = Utc::now();
        let mut report = ReapReport::default();

        for row in jobs.values_mut().filter(|j| j.lease_expired(now)) {
            let owner = row
                .lock_owner
                .as_ref()
                .map(|w| w.to_string())
                .unwrap_or_default();
            row.last_error = Some(format!("{LEASE_EXPIRED} (owner {owner})"));

            if row.has_attempts_left() {
                row.scheduled_at = now;
                row.release(JobStatus::Queued, now);
                report.requeued += 1;
            } else {
                row.release(JobStatus::Error, now);
                report.failed += 1;
            }
        }

        Ok(report)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.lock()?;
        let mut stats = JobStats::default();

        for job in jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Error => stats.error += 1,
            }
        }

        Ok(stats)
    }
}
