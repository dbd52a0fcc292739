//! HTTP trigger surface: scheduler-invoked drains, queue stats, health.

pub mod app;
pub mod middleware;
