//! PostgreSQL implementation of [`JobStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::any::Any;
use uuid::Uuid;

use crate::error::{DroverError, ErrorCode, Result};
use crate::jobs::{
    ExecutionResult, JobHistory, JobId, JobMetadata, JobStore, Priority, QueueJob,
    QueueJobStatus, ScheduledJob, StoreTransaction, Trigger,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
pub struct QueueJobRow {
    pub id: Uuid,
    pub handler: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_retries: i32,
    pub retry_count: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub output: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl TryFrom<QueueJobRow> for QueueJob {
    type Error = DroverError;

    fn try_from(row: QueueJobRow) -> Result<Self> {
        Ok(Self {
            id: JobId(row.id),
            handler: row.handler,
            payload: row.payload,
            priority: Priority(row.priority),
            max_retries: row.max_retries.max(0) as u32,
            retry_count: row.retry_count.max(0) as u32,
            status: row.status.parse()?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            available_at: row.available_at,
            output: row.output,
            last_error: row.last_error,
            worker_id: row.worker_id,
            metadata: serde_json::from_value::<JobMetadata>(row.metadata)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct JobHistoryRow {
    pub id: Uuid,
    pub queue_job_id: Uuid,
    pub handler: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub retry_attempt: i32,
    pub result: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub worker_id: String,
}

impl TryFrom<JobHistoryRow> for JobHistory {
    type Error = DroverError;

    fn try_from(row: JobHistoryRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            queue_job_id: JobId(row.queue_job_id),
            handler: row.handler,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_ms: row.duration_ms,
            retry_attempt: row.retry_attempt.max(0) as u32,
            result: row.result.parse::<ExecutionResult>()?,
            input: row.input,
            output: row.output,
            error: row.error,
            worker_id: row.worker_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ScheduledJobRow {
    pub id: Uuid,
    pub name: String,
    pub handler: String,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub payload: serde_json::Value,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub max_executions: Option<i64>,
    pub execution_count: i64,
    pub run_condition: Option<String>,
    pub priority: i32,
    pub max_retries: i32,
    pub enabled: bool,
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduledJobRow> for ScheduledJob {
    type Error = DroverError;

    fn try_from(row: ScheduledJobRow) -> Result<Self> {
        let trigger = Trigger::from_parts(row.cron_expression.as_deref(), row.interval_seconds)
            .map_err(|e| e.with_context("scheduled_job_id", row.id))?;

        Ok(Self {
            id: JobId(row.id),
            name: row.name,
            handler: row.handler,
            trigger,
            payload: row.payload,
            start_at: row.start_at,
            end_at: row.end_at,
            max_executions: row.max_executions.map(|m| m.max(0) as u64),
            execution_count: row.execution_count.max(0) as u64,
            condition: row.run_condition.filter(|c| !c.trim().is_empty()),
            priority: Priority(row.priority),
            max_retries: row.max_retries.max(0) as u32,
            enabled: row.enabled,
            active: row.active,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SCHEDULED_JOB_COLUMNS: &str = r#"
    id, name, handler, cron_expression, interval_seconds, payload, start_at, end_at,
    max_executions, execution_count, run_condition, priority, max_retries, enabled, active,
    last_run_at, next_run_at, created_at, updated_at
"#;

// ═══════════════════════════════════════════════════════════════════════════════
// Transaction
// ═══════════════════════════════════════════════════════════════════════════════

/// A Postgres transaction handed to handlers.
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTransaction {
    /// Connection to run queries on inside the transaction.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Job store on PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers across any
/// number of instances can poll concurrently.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a scheduled job definition.
    pub async fn create_scheduled_job(&self, job: &ScheduledJob) -> Result<()> {
        let (cron_expression, interval_seconds) = job.trigger.to_parts();

        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, name, handler, cron_expression, interval_seconds, payload, start_at, end_at,
                max_executions, execution_count, run_condition, priority, max_retries, enabled,
                active, last_run_at, next_run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.name)
        .bind(&job.handler)
        .bind(cron_expression)
        .bind(interval_seconds)
        .bind(&job.payload)
        .bind(job.start_at)
        .bind(job.end_at)
        .bind(job.max_executions.map(|m| m as i64))
        .bind(job.execution_count as i64)
        .bind(job.condition.as_deref())
        .bind(job.priority.value())
        .bind(job.max_retries as i32)
        .bind(job.enabled)
        .bind(job.active)
        .bind(job.last_run_at)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Disable a scheduled job; definitions are never deleted.
    pub async fn disable_scheduled_job(&self, id: JobId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET enabled = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DroverError::job_not_found(id));
        }
        Ok(())
    }

    /// Delete history rows that finished before `cutoff`.
    pub async fn purge_job_history(conn: &mut PgConnection, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_history WHERE finished_at < $1")
            .bind(cutoff)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_queue_job(&self, job: &QueueJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                id, handler, payload, priority, max_retries, retry_count, status,
                created_at, available_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.handler)
        .bind(&job.payload)
        .bind(job.priority.value())
        .bind(job.max_retries as i32)
        .bind(job.retry_count as i32)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.available_at)
        .bind(serde_json::to_value(&job.metadata)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_queue_job(&self, id: JobId) -> Result<Option<QueueJob>> {
        let row = sqlx::query_as::<_, QueueJobRow>("SELECT * FROM queue_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueueJob::try_from).transpose()
    }

    async fn get_next_pending_job(&self, worker_id: &str) -> Result<Option<QueueJob>> {
        let row = sqlx::query_as::<_, QueueJobRow>(
            r#"
            UPDATE queue_jobs
            SET status = 'processing', started_at = NOW(), worker_id = $1
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE status = 'pending' AND available_at <= NOW()
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueJob::try_from).transpose()
    }

    async fn update_queue_job_status(
        &self,
        id: JobId,
        status: QueueJobStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = $2,
                output = COALESCE($3, output),
                last_error = COALESCE($4, last_error),
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DroverError::job_not_found(id));
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: JobId) -> Result<u32> {
        let count: Option<i32> = sqlx::query_scalar(
            "UPDATE queue_jobs SET retry_count = retry_count + 1 WHERE id = $1 RETURNING retry_count",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        count
            .map(|c| c.max(0) as u32)
            .ok_or_else(|| DroverError::job_not_found(id))
    }

    async fn requeue_queue_job(
        &self,
        id: JobId,
        priority: Priority,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending', priority = $2, available_at = $3, worker_id = NULL
            WHERE id = $1 AND status = 'retrying'
            "#,
        )
        .bind(id.0)
        .bind(priority.value())
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DroverError::new(
                ErrorCode::InvalidStateTransition,
                format!("Job {} is not retrying", id),
            ));
        }
        Ok(())
    }

    async fn create_job_history(&self, history: &JobHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_history (
                id, queue_job_id, handler, started_at, finished_at, duration_ms,
                retry_attempt, result, input, output, error, worker_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(history.id)
        .bind(history.queue_job_id.0)
        .bind(&history.handler)
        .bind(history.started_at)
        .bind(history.finished_at)
        .bind(history.duration_ms)
        .bind(history.retry_attempt as i32)
        .bind(history.result.as_str())
        .bind(&history.input)
        .bind(history.output.as_ref())
        .bind(history.error.as_deref())
        .bind(&history.worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_job_history(&self, queue_job_id: JobId) -> Result<Vec<JobHistory>> {
        let rows = sqlx::query_as::<_, JobHistoryRow>(
            "SELECT * FROM job_history WHERE queue_job_id = $1 ORDER BY started_at ASC",
        )
        .bind(queue_job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobHistory::try_from).collect()
    }

    async fn list_active_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(&format!(
            "SELECT {} FROM scheduled_jobs WHERE active AND enabled ORDER BY created_at",
            SCHEDULED_JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match ScheduledJob::try_from(row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(
                    scheduled_job_id = %id,
                    error = %e,
                    "Skipping invalid scheduled job definition"
                ),
            }
        }
        Ok(jobs)
    }

    async fn get_scheduled_job(&self, id: JobId) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(&format!(
            "SELECT {} FROM scheduled_jobs WHERE id = $1",
            SCHEDULED_JOB_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ScheduledJob::try_from).transpose()
    }

    async fn update_scheduled_job_next_run(
        &self,
        id: JobId,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE scheduled_jobs
            SET last_run_at = $2,
                next_run_at = $3,
                execution_count = execution_count + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING execution_count
            "#,
        )
        .bind(id.0)
        .bind(ran_at)
        .bind(next_run_at)
        .fetch_optional(&self.pool)
        .await?;

        count
            .map(|c| c.max(0) as u64)
            .ok_or_else(|| DroverError::job_not_found(id))
    }

    /// Evaluates `SELECT (<condition>)::boolean` in a read-only transaction.
    async fn evaluate_condition(&self, condition: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        let value: Option<bool> =
            sqlx::query_scalar(&format!("SELECT ({})::boolean", condition))
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    DroverError::with_internal(
                        ErrorCode::ConditionFailed,
                        "Scheduled job condition could not be evaluated",
                        e.to_string(),
                    )
                })?;

        tx.rollback().await?;
        Ok(value.unwrap_or(false))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }
}
