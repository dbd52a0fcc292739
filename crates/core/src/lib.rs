//! `fulfillment-core`: domain primitives shared by the fulfillment queue.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns).

pub mod error;
pub mod id;
pub mod stage;

pub use error::{DomainError, DomainResult};
pub use id::{CorrelationId, JobId, WorkerId};
pub use stage::{Stage, TriggerType};
