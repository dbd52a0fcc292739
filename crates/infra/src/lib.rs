//! Infrastructure layer: job queue, run tracking, Postgres adapters, config,
//! and the HTTP stage processors.

pub mod config;
pub mod db;
pub mod jobs;
pub mod runs;
pub mod stages;


pub use config::{ConfigError, FulfillmentConfig};
