//! Run record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use fulfillment_core::{CorrelationId, DomainError, Stage};

/// Aggregate status of a fulfillment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "error" => Ok(RunStatus::Error),
            other => Err(DomainError::unknown_variant("run status", other)),
        }
    }
}

/// One record per correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub correlation_id: CorrelationId,
    pub status: RunStatus,
    /// Cumulative across every job sharing the correlation id
    pub attempts: u32,
    /// Merged additively on every update
    pub context: Map<String, Value>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// `<stage>:<origin>`, see [`ErrorLabel`]
    pub last_error_stage: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub(crate) fn new(correlation_id: CorrelationId, status: RunStatus, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            status,
            attempts: 0,
            context: Map::new(),
            resumed_at: None,
            last_error: None,
            last_error_stage: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Arguments to `RunTracker::mark_running`.
#[derive(Debug, Clone, Default)]
pub struct MarkRunning {
    pub increment_attempts: bool,
    pub resumed_at: Option<DateTime<Utc>>,
    pub context: Map<String, Value>,
}

impl MarkRunning {
    /// The update a runner applies when it claims a job.
    pub fn claimed(now: DateTime<Utc>, context: Map<String, Value>) -> Self {
        Self {
            increment_attempts: true,
            resumed_at: Some(now),
            context,
        }
    }
}

/// Who is at fault for a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorOrigin {
    /// Observed by the queue worker while running the stage
    WorkerError,
    /// Reported by the stage's own business logic
    StageError,
}

impl ErrorOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOrigin::WorkerError => "worker-error",
            ErrorOrigin::StageError => "stage-error",
        }
    }
}

/// Tags a run error with the failing stage and the origin, e.g. `ingest:worker-error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorLabel {
    pub stage: Stage,
    pub origin: ErrorOrigin,
}

impl ErrorLabel {
    pub fn worker(stage: Stage) -> Self {
        Self {
            stage,
            origin: ErrorOrigin::WorkerError,
        }
    }

    pub fn stage(stage: Stage) -> Self {
        Self {
            stage,
            origin: ErrorOrigin::StageError,
        }
    }
}

impl core::fmt::Display for ErrorLabel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.stage, self.origin.as_str())
    }
}

/// Shallow additive merge: keys in `update` overwrite, every other key in
/// `target` survives.
pub fn merge_context(target: &mut Map<String, Value>, update: Map<String, Value>) {
    for (key, value) in update {
        target.insert(key, value);
    }
}
