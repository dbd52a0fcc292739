//! Bounded drain for stateless, externally scheduled invocations.
//!
//! Each call is self-contained: it reaps expired leases, then runs the shared
//! cycle up to `max_jobs` times, stopping early when the queue is empty, the
//! error budget is spent, or the store is unreachable.

use serde::Serialize;
use tracing::{info, warn};

use fulfillment_core::{JobId, Stage, WorkerId};

use super::runner::{JobRunner, RunnerError};
use super::types::ReapReport;

/// Drain bounds.
#[derive(Debug, Clone, Copy)]
pub struct DrainOptions {
    pub max_jobs: usize,
    /// Stop after this many failed jobs
    pub max_errors: usize,
    pub reap_first: bool,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            max_jobs: 10,
            max_errors: 3,
            reap_first: true,
        }
    }
}

/// Outcome of one claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: JobId,
    pub stage: Stage,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary returned to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub processed_count: usize,
    pub error_count: usize,
    pub results: Vec<JobReport>,
    pub reaped: ReapReport,
    /// Set when the drain stopped because a store was unreachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

/// Run up to `opts.max_jobs` jobs and report per-job results.
pub async fn drain(runner: &JobRunner, worker_id: &WorkerId, opts: DrainOptions) -> DrainReport {
    let mut report = DrainReport::default();

    if opts.reap_first {
        match runner.reap().await {
            Ok(reaped) => report.reaped = reaped,
            Err(err) => warn!(worker_id = %worker_id, error = %err, "reaper pass failed"),
        }
    }

    while report.processed_count < opts.max_jobs {
        match runner.run_once(worker_id, &[]).await {
            Ok(result) => {
                let (Some(job_id), Some(stage)) = (result.job_id, result.stage) else {
                    break;
                };
                report.processed_count += 1;
                report.results.push(JobReport {
                    job_id,
                    stage,
                    ok: true,
                    error: None,
                });
            }
            Err(RunnerError::Job(failure)) => {
                report.processed_count += 1;
                report.error_count += 1;
                report.results.push(JobReport {
                    job_id: failure.job_id,
                    stage: failure.stage,
                    ok: false,
                    error: Some(failure.error.to_string()),
                });
                if report.error_count >= opts.max_errors {
                    warn!(
                        worker_id = %worker_id,
                        error_count = report.error_count,
                        "error budget exhausted; stopping drain"
                    );
                    break;
                }
            }
            Err(err) => {
                warn!(worker_id = %worker_id, error = %err, "drain stopped by store error");
                report.store_error = Some(err.to_string());
                break;
            }
        }
    }

    info!(
        worker_id = %worker_id,
        processed = report.processed_count,
        errors = report.error_count,
        "drain finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::dispatcher::{Dispatcher, StageError};
    use crate::jobs::runner::RunnerConfig;
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::NewJob;
    use crate::runs::InMemoryRunTracker;
    use chrono::Utc;
    use fulfillment_core::{CorrelationId, TriggerType};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn seed(jobs: &InMemoryJobStore, stage: Stage, count: usize) {
        for i in 0..count {
            jobs.enqueue(NewJob::new(
                CorrelationId::new(format!("C{}", i)).unwrap(),
                TriggerType::PaymentCompleted,
                stage,
                json!({"n": i}),
            ))
            .await
            .unwrap();
        }
    }

    fn runner(jobs: Arc<InMemoryJobStore>) -> JobRunner {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_fn(Stage::Payment, |_, _| async { Ok(()) })
            .register_fn(Stage::Booking, |_, _| async { Err(StageError::retryable("nope")) });
        JobRunner::new(
            jobs,
            Arc::new(InMemoryRunTracker::new()),
            Arc::new(dispatcher),
            RunnerConfig::default(),
        )
    }

    fn worker() -> WorkerId {
        WorkerId::new("cron").unwrap()
    }

    #[tokio::test]
    async fn stops_when_queue_is_empty() {
        let jobs = Arc::new(InMemoryJobStore::new());
        seed(&jobs, Stage::Payment, 2).await;

        let report = drain(&runner(jobs.clone()), &worker(), DrainOptions::default()).await;

        assert_eq!(report.processed_count, 2);
        assert_eq!(report.error_count, 0);
        assert!(report.results.iter().all(|r| r.ok));
        assert_eq!(jobs.stats().await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn respects_max_jobs() {
        let jobs = Arc::new(InMemoryJobStore::new());
        seed(&jobs, Stage::Payment, 5).await;

        let opts = DrainOptions {
            max_jobs: 3,
            ..Default::default()
        };
        let report = drain(&runner(jobs.clone()), &worker(), opts).await;

        assert_eq!(report.processed_count, 3);
        assert_eq!(jobs.stats().await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn stops_when_error_budget_is_spent() {
        let jobs = Arc::new(InMemoryJobStore::new());
        seed(&jobs, Stage::Booking, 4).await;

        let opts = DrainOptions {
            max_errors: 2,
            ..Default::default()
        };
        let report = drain(&runner(jobs.clone()), &worker(), opts).await;

        assert_eq!(report.processed_count, 2);
        assert_eq!(report.error_count, 2);
        assert_eq!(report.results[0].error.as_deref(), Some("nope"));
        assert!(report.store_error.is_none());
    }

    #[tokio::test]
    async fn reaps_expired_leases_before_draining() {
        let jobs = Arc::new(InMemoryJobStore::new());
        seed(&jobs, Stage::Payment, 1).await;
        let stuck = jobs
            .claim_next(&WorkerId::new("crashed").unwrap(), &[], Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let mut expired = jobs.get(stuck.id).await.unwrap().unwrap();
        expired.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        jobs.insert(expired).unwrap();

        let report = drain(&runner(jobs.clone()), &worker(), DrainOptions::default()).await;

        assert_eq!(report.reaped.requeued, 1);
        assert_eq!(report.processed_count, 1);
        assert!(report.results[0].ok);
    }

    #[test]
    fn report_serializes_for_schedulers() {
        let report = DrainReport {
            processed_count: 1,
            error_count: 1,
            results: vec![JobReport {
                job_id: JobId::new(),
                stage: Stage::PaymentSave,
                ok: false,
                error: Some("boom".into()),
            }],
            ..Default::default()
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["processedCount"], json!(1));
        assert_eq!(value["errorCount"], json!(1));
        assert_eq!(value["results"][0]["stage"], json!("payment-save"));
        assert_eq!(value["results"][0]["ok"], json!(false));
        assert!(value.get("storeError").is_none());
    }
}
