//! Postgres-backed run tracker.
//!
//! Each operation is one `INSERT .. ON CONFLICT DO UPDATE`, so the first writer
//! for a correlation id creates the row and later writers merge into it.
//! Context is merged with JSONB `||`: keys from the update win, other keys stay.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::instrument;

use fulfillment_core::CorrelationId;

use super::store::{RunStoreError, RunTracker};
use super::types::{ErrorLabel, MarkRunning, Run, RunStatus};
use crate::jobs::postgres::into_map;

const RUN_COLUMNS: &str = r#"
    correlation_id, status, attempts, context, resumed_at,
    last_error, last_error_stage, created_at, updated_at
"#;

/// Postgres-backed run tracker.
#[derive(Debug, Clone)]
pub struct PostgresRunTracker {
    pool: Arc<PgPool>,
}

impl PostgresRunTracker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_one(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Run, RunStoreError> {
        let row = query
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        RunRow::decode(&row).and_then(Run::try_from)
    }
}

#[async_trait]
impl RunTracker for PostgresRunTracker {
    #[instrument(skip_all, fields(correlation_id = %correlation_id), err)]
    async fn mark_running(
        &self,
        correlation_id: &CorrelationId,
        update: MarkRunning,
    ) -> Result<Run, RunStoreError> {
        let sql = format!(
            r#"
            INSERT INTO fulfillment_runs (correlation_id, status, attempts, context, resumed_at)
            VALUES ($1, 'running', CASE WHEN $2 THEN 1 ELSE 0 END, $3, $4)
            ON CONFLICT (correlation_id) DO UPDATE SET
                status = 'running',
                attempts = fulfillment_runs.attempts + CASE WHEN $2 THEN 1 ELSE 0 END,
                context = fulfillment_runs.context || EXCLUDED.context,
                resumed_at = COALESCE(EXCLUDED.resumed_at, fulfillment_runs.resumed_at),
                updated_at = NOW()
            RETURNING {RUN_COLUMNS}
            "#
        );

        let query = sqlx::query(&sql)
            .bind(correlation_id.as_str())
            .bind(update.increment_attempts)
            .bind(Value::Object(update.context))
            .bind(update.resumed_at);

        self.fetch_one("mark_running", query).await
    }

    #[instrument(skip_all, fields(correlation_id = %correlation_id, label = %label), err)]
    async fn mark_error(
        &self,
        correlation_id: &CorrelationId,
        error: &str,
        label: ErrorLabel,
    ) -> Result<Run, RunStoreError> {
        let sql = format!(
            r#"
            INSERT INTO fulfillment_runs (correlation_id, status, last_error, last_error_stage)
            VALUES ($1, 'error', $2, $3)
            ON CONFLICT (correlation_id) DO UPDATE SET
                status = 'error',
                last_error = EXCLUDED.last_error,
                last_error_stage = EXCLUDED.last_error_stage,
                updated_at = NOW()
            RETURNING {RUN_COLUMNS}
            "#
        );

        let label = label.to_string();
        let query = sqlx::query(&sql)
            .bind(correlation_id.as_str())
            .bind(error)
            .bind(label.as_str());

        self.fetch_one("mark_error", query).await
    }

    #[instrument(skip_all, fields(correlation_id = %correlation_id), err)]
    async fn mark_completed(&self, correlation_id: &CorrelationId) -> Result<Run, RunStoreError> {
        let sql = format!(
            r#"
            INSERT INTO fulfillment_runs (correlation_id, status)
            VALUES ($1, 'completed')
            ON CONFLICT (correlation_id) DO UPDATE SET
                status = 'completed',
                updated_at = NOW()
            RETURNING {RUN_COLUMNS}
            "#
        );

        let query = sqlx::query(&sql).bind(correlation_id.as_str());
        self.fetch_one("mark_completed", query).await
    }

    #[instrument(skip_all, fields(correlation_id = %correlation_id), err)]
    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<Run>, RunStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM fulfillment_runs WHERE correlation_id = $1"
        ))
        .bind(correlation_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| RunRow::decode(&r).and_then(Run::try_from))
            .transpose()
    }
}

#[derive(Debug)]
struct RunRow {
    correlation_id: String,
    status: String,
    attempts: i32,
    context: Value,
    resumed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_stage: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<Self, RunStoreError> {
        <Self as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(row)
            .map_err(|e| RunStoreError::Decode(e.to_string()))
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RunRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RunRow {
            correlation_id: row.try_get("correlation_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            context: row.try_get("context")?,
            resumed_at: row.try_get("resumed_at")?,
            last_error: row.try_get("last_error")?,
            last_error_stage: row.try_get("last_error_stage")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<RunRow> for Run {
    type Error = RunStoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let decode = |e: fulfillment_core::DomainError| RunStoreError::Decode(e.to_string());

        Ok(Run {
            correlation_id: CorrelationId::new(row.correlation_id).map_err(decode)?,
            status: row.status.parse::<RunStatus>().map_err(decode)?,
            attempts: row.attempts.max(0) as u32,
            context: into_map(row.context),
            resumed_at: row.resumed_at,
            last_error: row.last_error,
            last_error_stage: row.last_error_stage,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RunStoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            RunStoreError::Unavailable(format!("{} in {}", err, operation))
        }
        sqlx::Error::Database(db_err) => RunStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            RunStoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => RunStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(status: &str, context: Value) -> RunRow {
        let now = Utc::now();
        RunRow {
            correlation_id: "C1".to_string(),
            status: status.to_string(),
            attempts: 2,
            context,
            resumed_at: None,
            last_error: None,
            last_error_stage: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn row_decodes_into_run() {
        let run = Run::try_from(row("error", json!({"a": 1}))).unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.attempts, 2);
        assert_eq!(run.context.get("a"), Some(&json!(1)));
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let err = Run::try_from(row("paused", json!({}))).unwrap_err();
        assert!(matches!(err, RunStoreError::Decode(_)));
    }

    #[test]
    fn pool_closed_maps_to_unavailable() {
        let err = map_sqlx_error("mark_running", sqlx::Error::PoolClosed);
        assert!(matches!(err, RunStoreError::Unavailable(_)));
    }
}
