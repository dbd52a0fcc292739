//! Run tracking: one aggregate record per correlation id.
//!
//! Jobs are per-attempt rows; a run summarizes the whole pipeline (how many
//! attempts, which stage failed last, merged context) and outlives job cleanup.

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresRunTracker;
pub use store::{InMemoryRunTracker, RunStoreError, RunTracker};
pub use types::{ErrorLabel, ErrorOrigin, MarkRunning, Run, RunStatus, merge_context};
