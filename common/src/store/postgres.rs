// PostgreSQL store adapters
//
// The claim is a guarded UPDATE: `WHERE id = $1 AND status = ANY($2)`.
// rows_affected tells the caller whether it won the row.

use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::{Job, JobHistory, JobStatus, RunSummary};
use crate::store::{HistoryOutcome, JobHistoryLog, JobStore, JobTransition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

const JOB_COLUMNS: &str = r#"
    id, name, kind, status, schedule_expression, recurring, config, enabled,
    timeout_seconds, max_retries, retry_count, last_retry_at, scheduled_at,
    started_at, completed_at, next_run_at, last_run_at, heartbeat_at,
    duration_ms, result, error_message, created_at, updated_at
"#;

const HISTORY_COLUMNS: &str = r#"
    id, job_id, job_name, status, idempotency_key, triggered_by, attempt,
    started_at, ended_at, duration_ms, result, error_message, created_at
"#;

/// PostgreSQL-backed job registry.
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_field<T>(value: String, field: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(|reason| StoreError::InvalidStoredValue {
        field: field.to_string(),
        reason,
    })
}

fn parse_summary(
    value: Option<serde_json::Value>,
    field: &str,
) -> Result<Option<RunSummary>, StoreError> {
    value
        .map(|v| {
            serde_json::from_value(v).map_err(|e| StoreError::InvalidStoredValue {
                field: field.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn summary_json(summary: &RunSummary) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(summary)
        .map_err(|e| StoreError::QueryFailed(format!("Failed to serialize result: {}", e)))
}

fn row_to_job(row: &PgRow) -> Result<Job, StoreError> {
    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: parse_field(row.try_get::<String, _>("kind")?, "kind")?,
        status: parse_field(row.try_get::<String, _>("status")?, "status")?,
        schedule_expression: row.try_get("schedule_expression")?,
        recurring: row.try_get("recurring")?,
        config: row.try_get("config")?,
        enabled: row.try_get("enabled")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        max_retries: row.try_get("max_retries")?,
        retry_count: row.try_get("retry_count")?,
        last_retry_at: row.try_get("last_retry_at")?,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        duration_ms: row.try_get("duration_ms")?,
        result: parse_summary(row.try_get("result")?, "result")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn expected_strings(expected: &[JobStatus]) -> Vec<String> {
    expected.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let result_json = job.result.as_ref().map(summary_json).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, kind, status, schedule_expression, recurring, config,
                enabled, timeout_seconds, max_retries, retry_count, last_retry_at,
                scheduled_at, started_at, completed_at, next_run_at, last_run_at,
                heartbeat_at, duration_ms, result, error_message, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23
            )
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(job.kind.to_string())
        .bind(job.status.to_string())
        .bind(&job.schedule_expression)
        .bind(job.recurring)
        .bind(&job.config)
        .bind(job.enabled)
        .bind(job.timeout_seconds)
        .bind(job.max_retries)
        .bind(job.retry_count)
        .bind(job.last_retry_at)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(job.heartbeat_at)
        .bind(job.duration_ms)
        .bind(result_json)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(kind = %job.kind, "Job created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self))]
    async fn get_by_name(&self, name: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE name = $1", JOB_COLUMNS))
            .bind(name)
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {} FROM jobs ORDER BY name", JOB_COLUMNS))
            .fetch_all(self.pool.pool())
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self))]
    async fn list_enabled_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM jobs
            WHERE enabled = true
              AND status IN ('scheduled', 'completed', 'failed')
              AND (next_run_at <= $1 OR (next_run_at IS NULL AND recurring = true))
            ORDER BY next_run_at NULLS LAST
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .fetch_all(self.pool.pool())
        .await?;

        let jobs: Result<Vec<Job>, StoreError> = rows.iter().map(row_to_job).collect();
        let jobs = jobs?;
        tracing::debug!(count = jobs.len(), "Found due candidates");
        Ok(jobs)
    }

    #[instrument(skip(self, transition), fields(target = %transition.target_status()))]
    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        transition: JobTransition,
    ) -> Result<bool, StoreError> {
        let expected = expected_strings(expected);
        let rows_affected = match transition {
            JobTransition::Claim { at } => {
                sqlx::query(
                    r#"
                    UPDATE jobs SET
                        status = 'running',
                        started_at = $3,
                        heartbeat_at = $3,
                        last_run_at = $3,
                        next_run_at = NULL,
                        retry_count = 0,
                        last_retry_at = NULL,
                        completed_at = NULL,
                        duration_ms = NULL,
                        result = NULL,
                        error_message = NULL,
                        updated_at = $3
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(&expected)
                .bind(at)
                .execute(self.pool.pool())
                .await?
                .rows_affected()
            }
            JobTransition::Retry { at } => {
                sqlx::query(
                    r#"
                    UPDATE jobs SET
                        status = 'running',
                        started_at = $3,
                        heartbeat_at = $3,
                        last_retry_at = $3,
                        next_run_at = NULL,
                        completed_at = NULL,
                        duration_ms = NULL,
                        result = NULL,
                        error_message = NULL,
                        updated_at = $3
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(&expected)
                .bind(at)
                .execute(self.pool.pool())
                .await?
                .rows_affected()
            }
            JobTransition::Complete {
                at,
                duration_ms,
                result,
                next_run_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE jobs SET
                        status = 'completed',
                        completed_at = $3,
                        duration_ms = $4,
                        result = $5,
                        next_run_at = $6,
                        error_message = NULL,
                        heartbeat_at = NULL,
                        updated_at = $3
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(&expected)
                .bind(at)
                .bind(duration_ms)
                .bind(summary_json(&result)?)
                .bind(next_run_at)
                .execute(self.pool.pool())
                .await?
                .rows_affected()
            }
            JobTransition::Fail {
                at,
                duration_ms,
                result,
                error_message,
                retry_count,
                next_run_at,
            } => {
                let result_json = result.as_ref().map(summary_json).transpose()?;
                sqlx::query(
                    r#"
                    UPDATE jobs SET
                        status = 'failed',
                        completed_at = $3,
                        duration_ms = $4,
                        result = $5,
                        error_message = $6,
                        retry_count = $7,
                        next_run_at = $8,
                        heartbeat_at = NULL,
                        updated_at = $3
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(&expected)
                .bind(at)
                .bind(duration_ms)
                .bind(result_json)
                .bind(error_message)
                .bind(retry_count)
                .bind(next_run_at)
                .execute(self.pool.pool())
                .await?
                .rows_affected()
            }
            JobTransition::Cancel {
                at,
                duration_ms,
                result,
            } => {
                let result_json = result.as_ref().map(summary_json).transpose()?;
                sqlx::query(
                    r#"
                    UPDATE jobs SET
                        status = 'cancelled',
                        completed_at = $3,
                        duration_ms = $4,
                        result = $5,
                        next_run_at = NULL,
                        heartbeat_at = NULL,
                        updated_at = $3
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(&expected)
                .bind(at)
                .bind(duration_ms)
                .bind(result_json)
                .execute(self.pool.pool())
                .await?
                .rows_affected()
            }
            JobTransition::Pause { at } => {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'paused', updated_at = $3
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(&expected)
                .bind(at)
                .execute(self.pool.pool())
                .await?
                .rows_affected()
            }
            JobTransition::Resume { at } => {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'scheduled', updated_at = $3
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(&expected)
                .bind(at)
                .execute(self.pool.pool())
                .await?
                .rows_affected()
            }
        };

        Ok(rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET enabled = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(self.pool.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Job not found: {}", id)));
        }
        tracing::info!(job_id = %id, enabled, "Job enabled flag updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = $2, updated_at = $2 WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(at)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM jobs
            WHERE status = 'running'
              AND COALESCE(heartbeat_at, started_at, created_at) < $1
            "#,
            JOB_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(row_to_job).collect()
    }
}

/// PostgreSQL-backed history log.
pub struct PgHistoryLog {
    pool: DbPool,
}

impl PgHistoryLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_history(row: &PgRow) -> Result<JobHistory, StoreError> {
    Ok(JobHistory {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        job_name: row.try_get("job_name")?,
        status: parse_field(row.try_get::<String, _>("status")?, "status")?,
        idempotency_key: row.try_get("idempotency_key")?,
        triggered_by: parse_field(row.try_get::<String, _>("triggered_by")?, "triggered_by")?,
        attempt: row.try_get("attempt")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_ms: row.try_get("duration_ms")?,
        result: parse_summary(row.try_get("result")?, "result")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobHistoryLog for PgHistoryLog {
    #[instrument(skip(self, entry), fields(history_id = %entry.id, job_id = %entry.job_id))]
    async fn append(&self, entry: &JobHistory) -> Result<(), StoreError> {
        let result_json = entry.result.as_ref().map(summary_json).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO job_history (
                id, job_id, job_name, status, idempotency_key, triggered_by,
                attempt, started_at, ended_at, duration_ms, result,
                error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.job_id)
        .bind(&entry.job_name)
        .bind(entry.status.to_string())
        .bind(&entry.idempotency_key)
        .bind(entry.triggered_by.to_string())
        .bind(entry.attempt)
        .bind(entry.started_at)
        .bind(entry.ended_at)
        .bind(entry.duration_ms)
        .bind(result_json)
        .bind(&entry.error_message)
        .bind(entry.created_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(status = %outcome.status))]
    async fn finalize(&self, id: Uuid, outcome: HistoryOutcome) -> Result<(), StoreError> {
        let result_json = outcome.result.as_ref().map(summary_json).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE job_history SET
                status = $2,
                ended_at = $3,
                duration_ms = $4,
                result = $5,
                error_message = $6
            WHERE id = $1 AND ended_at IS NULL
            "#,
        )
        .bind(id)
        .bind(outcome.status.to_string())
        .bind(outcome.ended_at)
        .bind(outcome.duration_ms)
        .bind(result_json)
        .bind(&outcome.error_message)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "History row missing or already finalized: {}",
                id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_completed_for_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<JobHistory>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM job_history
            WHERE idempotency_key = $1 AND status = 'completed'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
            HISTORY_COLUMNS
        ))
        .bind(idempotency_key)
        .fetch_optional(self.pool.pool())
        .await?;
        row.as_ref().map(row_to_history).transpose()
    }

    #[instrument(skip(self))]
    async fn list_for_job(
        &self,
        job_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobHistory>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM job_history
            WHERE job_id = $1
            ORDER BY started_at DESC
            OFFSET $2 LIMIT $3
            "#,
            HISTORY_COLUMNS
        ))
        .bind(job_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(row_to_history).collect()
    }
}
