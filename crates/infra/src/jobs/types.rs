//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use fulfillment_core::{CorrelationId, DomainError, JobId, Stage, TriggerType, WorkerId};

/// Ceiling used when the enqueue path does not pick one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Context key holding the originating external event id.
pub const CONTEXT_EVENT_ID: &str = "event_id";
/// Context key holding the originating external event type.
pub const CONTEXT_EVENT_TYPE: &str = "event_type";

/// Job execution status.
///
/// `Queued` is initial, `Completed` and `Error` are terminal. `Running` is
/// transient and always paired with lock ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` and a worker
    Queued,
    /// Claimed by a worker
    Running,
    /// Stage processor succeeded
    Completed,
    /// Attempts exhausted or fatal failure
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            other => Err(DomainError::unknown_variant("job status", other)),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Default delay applied by `fail` when the caller does not pass one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately; mostly useful in tests.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // Clamp the exponent; 2^31 ms is already far past any sane cap.
                let exp = 2_f64.powi((attempt - 1).min(31) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * (attempt as f64)).min(max_ms),
        };

        // Deterministic "jitter" based on attempt
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// One unit of work for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Groups every job of one fulfillment run
    pub correlation_id: CorrelationId,
    /// Originating external event category
    pub trigger_type: TriggerType,
    /// Which stage processor handles this job
    pub stage: Stage,
    /// Opaque to the queue; consumed by the stage processor
    pub payload: Value,
    /// External event id/type, tenant identifiers, retry breadcrumbs
    pub context: Map<String, Value>,
    pub status: JobStatus,
    /// Incremented on every claim
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed
    pub scheduled_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_owner: Option<WorkerId>,
    /// Claims without a heartbeat past this point are reaped
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether `claim_next` may pick this row at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>, exclude_stages: &[Stage]) -> bool {
        self.status == JobStatus::Queued
            && self.scheduled_at <= now
            && !exclude_stages.contains(&self.stage)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_owned_by(&self, worker_id: &WorkerId) -> bool {
        self.status == JobStatus::Running && self.lock_owner.as_ref() == Some(worker_id)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.context.get(CONTEXT_EVENT_ID).and_then(Value::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.context.get(CONTEXT_EVENT_TYPE).and_then(Value::as_str)
    }

    /// Transition to `Running` under `worker_id`.
    pub(crate) fn claim(&mut self, worker_id: &WorkerId, now: DateTime<Utc>, lease_ttl: Duration) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.locked_at = Some(now);
        self.lock_owner = Some(worker_id.clone());
        self.lease_expires_at = Some(now + to_chrono(lease_ttl));
        self.updated_at = now;
    }

    pub(crate) fn release(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.locked_at = None;
        self.lock_owner = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }
}

/// A job as produced by the enqueue path.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub correlation_id: CorrelationId,
    pub trigger_type: TriggerType,
    pub stage: Stage,
    pub payload: Value,
    pub context: Map<String, Value>,
    pub max_attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(
        correlation_id: CorrelationId,
        trigger_type: TriggerType,
        stage: Stage,
        payload: Value,
    ) -> Self {
        Self {
            correlation_id,
            trigger_type,
            stage,
            payload,
            context: Map::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Record the originating external event.
    pub fn with_event(self, event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        self.with_context(CONTEXT_EVENT_ID, event_id.into())
            .with_context(CONTEXT_EVENT_TYPE, event_type.into())
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + to_chrono(delay));
        self
    }

    /// Materialize the queued row.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            correlation_id: self.correlation_id,
            trigger_type: self.trigger_type,
            stage: self.stage,
            payload: self.payload,
            context: self.context,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: self.max_attempts.max(1),
            scheduled_at: self.scheduled_at.unwrap_or(now),
            locked_at: None,
            lock_owner: None,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Caller-side knobs for `JobStore::fail`.
#[derive(Debug, Clone, Default)]
pub struct FailOptions {
    /// Overrides the store's default backoff
    pub delay: Option<Duration>,
    /// Skip remaining attempts and go straight to `Error`
    pub terminal: bool,
    /// Merged into the job's context
    pub context: Map<String, Value>,
}

impl FailOptions {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn terminal() -> Self {
        Self {
            terminal: true,
            ..Default::default()
        }
    }
}

/// What `fail` did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FailOutcome {
    /// Back to `Queued`, eligible again at `scheduled_at`
    Requeued { scheduled_at: DateTime<Utc> },
    /// Moved to terminal `Error`
    Terminal,
    /// Row was no longer running under this owner; nothing changed
    NotOwned,
}

impl FailOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Terminal)
    }
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub requeued: u64,
    pub failed: u64,
}

impl ReapReport {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub error: u64,
}

/// Saturates at a century instead of overflowing timestamp arithmetic.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    const CEILING_DAYS: i64 = 36_500;
    chrono::Duration::from_std(duration)
        .ok()
        .filter(|d| *d < chrono::Duration::days(CEILING_DAYS))
        .unwrap_or_else(|| chrono::Duration::days(CEILING_DAYS))
}
