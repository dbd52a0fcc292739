//! Postgres-backed job store.
//!
//! Every state transition is a single conditional `UPDATE`; there is no
//! read-then-write window and no external lock service.
//!
//! ## Claim
//!
//! `claim_next` picks the oldest eligible row with `FOR UPDATE SKIP LOCKED` in a
//! sub-select and transitions it to `running` in the same statement, so
//! concurrent workers skip rows another transaction is already claiming.
//! A claimed row that fails to decode (e.g. a blank `correlation_id` written by
//! an external producer) is moved to `error` with an `undecodable job row`
//! message and the claim moves on to the next eligible row.
//!
//! ## Ownership
//!
//! `complete`, `fail` and `heartbeat` only touch rows that are still `running`
//! under the caller's `lock_owner`. A worker whose lease was reaped and whose
//! job was reclaimed elsewhere gets a no-op.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | `PoolClosed` / `PoolTimedOut` / `Io` | `Unavailable` |
//! | `Database` | `Storage` |
//! | decode failures | `Decode` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tracing::{error, instrument};

use fulfillment_core::{CorrelationId, JobId, Stage, WorkerId};

use super::store::{JobStore, JobStoreError, LEASE_EXPIRED};
use super::types::{
    BackoffPolicy, FailOptions, FailOutcome, Job, JobStats, JobStatus, NewJob, ReapReport,
};

/// `last_error` prefix for rows `claim_next` could not decode.
pub const UNDECODABLE_ROW: &str = "undecodable job row";

const JOB_COLUMNS: &str = r#"
    id, correlation_id, trigger_type, stage, payload, context, status,
    attempts, max_attempts, scheduled_at, locked_at, lock_owner,
    lease_expires_at, last_error, created_at, updated_at
"#;

/// Postgres-backed job store.
///
/// Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    backoff: BackoffPolicy,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Replace the default backoff applied by `fail` when no delay is given.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Move a claimed row that cannot be decoded into terminal `error`.
    ///
    /// Written outside this crate's enqueue path, such a row would otherwise
    /// stay `running` until its lease expired and be reclaimed forever.
    async fn quarantine(
        &self,
        row: &sqlx::postgres::PgRow,
        worker_id: &WorkerId,
        err: &JobStoreError,
    ) -> Result<(), JobStoreError> {
        let id: uuid::Uuid = row.try_get("id").map_err(decode_error)?;
        let correlation_id: Option<String> = row.try_get("correlation_id").ok();
        let stage: Option<String> = row.try_get("stage").ok();
        let message = format!("{}: {}", UNDECODABLE_ROW, err);

        sqlx::query(
            r#"
            UPDATE fulfillment_jobs
            SET status = 'error',
                locked_at = NULL,
                lock_owner = NULL,
                lease_expires_at = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lock_owner = $2
            "#,
        )
        .bind(id)
        .bind(worker_id.as_str())
        .bind(&message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("quarantine", e))?;

        error!(
            job_id = %id,
            correlation_id = ?correlation_id,
            stage = ?stage,
            error = %err,
            "claimed job row could not be decoded; moved to error"
        );
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip_all, fields(correlation_id = %job.correlation_id, stage = %job.stage), err)]
    async fn enqueue(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let job = job.into_job(Utc::now());

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO fulfillment_jobs (
                id, correlation_id, trigger_type, stage, payload, context,
                status, attempts, max_attempts, scheduled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'queued', 0, $7, $8, NOW(), NOW())
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id.as_uuid())
        .bind(job.correlation_id.as_str())
        .bind(job.trigger_type.as_str())
        .bind(job.stage.as_str())
        .bind(&job.payload)
        .bind(Value::Object(job.context.clone()))
        .bind(job.max_attempts as i32)
        .bind(job.scheduled_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        JobRow::decode(&row).and_then(Job::try_from)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fulfillment_jobs WHERE id = $1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| JobRow::decode(&r).and_then(Job::try_from))
            .transpose()
    }

    #[instrument(skip_all, fields(worker_id = %worker_id, excluded = ?exclude_stages), err)]
    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        exclude_stages: &[Stage],
        lease_ttl: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let excluded: Vec<String> = exclude_stages.iter().map(|s| s.as_str().to_string()).collect();

        // Each undecodable row is moved out of `queued`, so the loop terminates.
        loop {
            let row = sqlx::query(&format!(
                r#"
                UPDATE fulfillment_jobs
                SET status = 'running',
                    attempts = attempts + 1,
                    locked_at = NOW(),
                    lock_owner = $1,
                    lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                    updated_at = NOW()
                WHERE id = (
                    SELECT id
                    FROM fulfillment_jobs
                    WHERE status = 'queued'
                      AND scheduled_at <= NOW()
                      AND stage <> ALL($2::text[])
                    ORDER BY scheduled_at ASC, created_at ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                  AND status = 'queued'
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(worker_id.as_str())
            .bind(&excluded)
            .bind(duration_ms(lease_ttl))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

            let Some(row) = row else {
                return Ok(None);
            };

            match JobRow::decode(&row).and_then(Job::try_from) {
                Ok(job) => return Ok(Some(job)),
                Err(err) => self.quarantine(&row, worker_id, &err).await?,
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker_id = %worker_id), err)]
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        lease_ttl: Duration,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fulfillment_jobs
            SET lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lock_owner = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker_id.as_str())
        .bind(duration_ms(lease_ttl))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip_all, fields(job_id = %job.id), err)]
    async fn complete(&self, job: &Job) -> Result<bool, JobStoreError> {
        let Some(owner) = &job.lock_owner else {
            return Ok(false);
        };

        let result = sqlx::query(
            r#"
            UPDATE fulfillment_jobs
            SET status = 'completed',
                locked_at = NULL,
                lock_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lock_owner = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(owner.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip_all, fields(job_id = %job.id, attempts = job.attempts), err)]
    async fn fail(
        &self,
        job: &Job,
        error: &str,
        opts: FailOptions,
    ) -> Result<FailOutcome, JobStoreError> {
        let Some(owner) = &job.lock_owner else {
            return Ok(FailOutcome::NotOwned);
        };

        let delay = opts
            .delay
            .unwrap_or_else(|| self.backoff.delay_for_attempt(job.attempts));

        // attempts/max_attempts come from the row, not the caller's snapshot.
        let row = sqlx::query(
            r#"
            UPDATE fulfillment_jobs
            SET status = CASE
                    WHEN attempts < max_attempts AND NOT $4 THEN 'queued'
                    ELSE 'error'
                END,
                scheduled_at = CASE
                    WHEN attempts < max_attempts AND NOT $4
                        THEN NOW() + ($3::bigint) * INTERVAL '1 millisecond'
                    ELSE scheduled_at
                END,
                locked_at = NULL,
                lock_owner = NULL,
                lease_expires_at = NULL,
                last_error = $5,
                context = context || $6,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lock_owner = $2
            RETURNING status, scheduled_at
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(owner.as_str())
        .bind(duration_ms(delay))
        .bind(opts.terminal)
        .bind(error)
        .bind(Value::Object(opts.context))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        let Some(row) = row else {
            return Ok(FailOutcome::NotOwned);
        };

        let status: String = row.try_get("status").map_err(decode_error)?;
        let scheduled_at: DateTime<Utc> = row.try_get("scheduled_at").map_err(decode_error)?;

        match parse_status(&status)? {
            JobStatus::Queued => Ok(FailOutcome::Requeued { scheduled_at }),
            _ => Ok(FailOutcome::Terminal),
        }
    }

    #[instrument(skip(self), err)]
    async fn reap_expired(&self) -> Result<ReapReport, JobStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE fulfillment_jobs
            SET status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'error' END,
                scheduled_at = CASE WHEN attempts < max_attempts THEN NOW() ELSE scheduled_at END,
                last_error = $1 || ' (owner ' || COALESCE(lock_owner, '?') || ')',
                locked_at = NULL,
                lock_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND lease_expires_at < NOW()
            RETURNING status
            "#,
        )
        .bind(LEASE_EXPIRED)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired", e))?;

        let mut report = ReapReport::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            match parse_status(&status)? {
                JobStatus::Queued => report.requeued += 1,
                _ => report.failed += 1,
            }
        }

        Ok(report)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM fulfillment_jobs
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let count: i64 = row.try_get("count").map_err(decode_error)?;
            let count = count.max(0) as u64;
            match parse_status(&status)? {
                JobStatus::Queued => stats.queued = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Error => stats.error = count,
            }
        }

        Ok(stats)
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    correlation_id: String,
    trigger_type: String,
    stage: String,
    payload: Value,
    context: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    lock_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<Self, JobStoreError> {
        <Self as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(row).map_err(decode_error)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            correlation_id: row.try_get("correlation_id")?,
            trigger_type: row.try_get("trigger_type")?,
            stage: row.try_get("stage")?,
            payload: row.try_get("payload")?,
            context: row.try_get("context")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            locked_at: row.try_get("locked_at")?,
            lock_owner: row.try_get("lock_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let decode = |e: fulfillment_core::DomainError| JobStoreError::Decode(e.to_string());

        Ok(Job {
            id: JobId::from_uuid(row.id),
            correlation_id: CorrelationId::new(row.correlation_id).map_err(decode)?,
            trigger_type: row.trigger_type.parse().map_err(decode)?,
            stage: row.stage.parse().map_err(decode)?,
            payload: row.payload,
            context: into_map(row.context),
            status: parse_status(&row.status)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            scheduled_at: row.scheduled_at,
            locked_at: row.locked_at,
            lock_owner: row
                .lock_owner
                .map(WorkerId::new)
                .transpose()
                .map_err(decode)?,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn parse_status(status: &str) -> Result<JobStatus, JobStoreError> {
    status
        .parse()
        .map_err(|e: fulfillment_core::DomainError| JobStoreError::Decode(e.to_string()))
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Decode(err.to_string())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            JobStoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
