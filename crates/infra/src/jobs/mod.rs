//! Durable fulfillment job queue.
//!
//! ## Design
//!
//! - The relational store is the only coordination point; claims are single
//!   conditional updates with `FOR UPDATE SKIP LOCKED`
//! - Claims carry a lease, extended by heartbeats and released by the reaper
//! - Retry with exponential backoff up to `max_attempts`, or at once on a fatal stage error
//! - One shared cycle (`JobRunner::run_once`) behind both execution modes
//!
//! ## Components
//!
//! - `JobStore`: claim/complete/fail persistence (in-memory or Postgres)
//! - `Dispatcher`: stage → `StageProcessor` routing
//! - `JobRunner`: claim → mark running → dispatch → complete/fail
//! - `Worker`: continuous loop with a per-stage `CircuitBreaker`
//! - `drain`: bounded single-shot loop for scheduler-triggered invocations

pub mod breaker;
pub mod dispatcher;
pub mod postgres;
pub mod runner;
pub mod store;
pub mod trigger;
pub mod types;
pub mod worker;

pub use breaker::{BreakerPolicy, CircuitBreaker};
pub use dispatcher::{DispatchError, Dispatcher, FnProcessor, RunContext, StageError, StageProcessor};
pub use postgres::PostgresJobStore;
pub use runner::{JobFailure, JobRunner, RunOnce, RunnerConfig, RunnerError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use trigger::{DrainOptions, DrainReport, JobReport, drain};
pub use types::{
    BackoffPolicy, BackoffStrategy, FailOptions, FailOutcome, Job, JobStats, JobStatus, NewJob,
    ReapReport,
};
pub use worker::{Tick, Worker, WorkerHandle, WorkerSettings, WorkerStats};
