//! Postgres-backed [`JobStore`].
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE`, so
//! concurrent dispatchers never see the same row. Completion reports and
//! reaping are conditional updates on `status = 'running'`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use super::{
    lease_expired_message, FailurePlan, Job, JobCounts, JobStatus, JobStore, NewJob, StoreError,
    StoreResult,
};
use crate::backoff::BackoffPolicy;

macro_rules! job_columns {
    () => {
        "id, job_type, status, payload, result, attempts, max_attempts, last_error, \
         dedup_key, scheduled_at, locked_at, locked_by, created_at, updated_at"
    };
}

/// Enqueue races against a finishing duplicate at most this many times
const DEDUP_RETRIES: usize = 3;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    job_type: String,
    status: String,
    payload: Value,
    result: Option<Value>,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    dedup_key: Option<String>,
    scheduled_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            status: row.status.parse()?,
            payload: row.payload,
            result: row.result,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            last_error: row.last_error,
            dedup_key: row.dedup_key,
            scheduled_at: row.scheduled_at,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_job(row: Option<JobRow>) -> StoreResult<Option<Job>> {
    row.map(Job::try_from).transpose()
}

fn into_jobs(rows: Vec<JobRow>) -> StoreResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgJobStore {
    pub fn new(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        crate::MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    async fn active_with_key(&self, job_type: &str, key: &str) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM job_queue
             WHERE job_type = $1 AND dedup_key = $2
               AND status IN ('queued', 'running', 'retry')
             ORDER BY id DESC
             LIMIT 1",
        )
        .bind(job_type)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> StoreResult<i64> {
        let Some(key) = job.dedup_key.as_deref() else {
            let id = sqlx::query_scalar::<_, i64>(
                "INSERT INTO job_queue (job_type, status, payload, max_attempts, scheduled_at)
                 VALUES ($1, 'queued', $2, $3, NOW())
                 RETURNING id",
            )
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .fetch_one(&self.pool)
            .await?;
            return Ok(id);
        };

        for _ in 0..DEDUP_RETRIES {
            let inserted = sqlx::query_scalar::<_, i64>(
                "INSERT INTO job_queue (job_type, status, payload, max_attempts, dedup_key, scheduled_at)
                 VALUES ($1, 'queued', $2, $3, $4, NOW())
                 ON CONFLICT (job_type, dedup_key)
                     WHERE status IN ('queued', 'running', 'retry')
                     DO NOTHING
                 RETURNING id",
            )
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = inserted {
                return Ok(id);
            }
            // The conflicting job may have finished between the two statements
            if let Some(id) = self.active_with_key(&job.job_type, key).await? {
                return Ok(id);
            }
        }

        Err(StoreError::InvalidArgument(format!(
            "could not enqueue {} job with dedup key '{key}'",
            job.job_type
        )))
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        eligible_types: &[String],
    ) -> StoreResult<Option<Job>> {
        if eligible_types.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, JobRow>(concat!(
            "UPDATE job_queue
             SET status = 'running',
                 attempts = attempts + 1,
                 locked_at = NOW(),
                 locked_by = $1,
                 updated_at = NOW()
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE status IN ('queued', 'retry')
                   AND scheduled_at <= NOW()
                   AND attempts < max_attempts
                   AND job_type = ANY($2)
                 ORDER BY scheduled_at, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING ",
            job_columns!()
        ))
        .bind(worker_id)
        .bind(eligible_types)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn report_success(
        &self,
        id: i64,
        worker_id: &str,
        result: Value,
    ) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(concat!(
            "UPDATE job_queue
             SET status = 'done',
                 result = $3,
                 locked_at = NULL,
                 locked_by = NULL,
                 updated_at = NOW()
             WHERE id = $1 AND status = 'running' AND locked_by = $2
             RETURNING ",
            job_columns!()
        ))
        .bind(id)
        .bind(worker_id)
        .bind(result)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn report_failure(
        &self,
        id: i64,
        worker_id: &str,
        error: &str,
    ) -> StoreResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let lease = sqlx::query_as::<_, (i32, i32)>(
            "SELECT attempts, max_attempts FROM job_queue
             WHERE id = $1 AND status = 'running' AND locked_by = $2
             FOR UPDATE",
        )
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_attempts)) = lease else {
            tx.rollback().await?;
            return Ok(None);
        };

        let plan = FailurePlan::decide(attempts, max_attempts, &self.backoff);
        let row = sqlx::query_as::<_, JobRow>(concat!(
            "UPDATE job_queue
             SET status = $2,
                 last_error = $3,
                 scheduled_at = CASE WHEN $4::float8 IS NULL THEN scheduled_at
                                     ELSE NOW() + make_interval(secs => $4::float8) END,
                 locked_at = NULL,
                 locked_by = NULL,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING ",
            job_columns!()
        ))
        .bind(id)
        .bind(plan.status.as_str())
        .bind(error)
        .bind(plan.retry_in.map(|d| d.as_secs_f64()))
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        into_job(row)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM job_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM job_queue
              WHERE ($1::text IS NULL OR status = $1)
              ORDER BY id DESC
              LIMIT $2 OFFSET $3"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn count_by_status(&self) -> StoreResult<JobCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM job_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, n);
        }
        Ok(counts)
    }

    async fn reap_expired(&self, running_timeout: Duration) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(concat!(
            "UPDATE job_queue
             SET status = CASE WHEN attempts < max_attempts THEN 'retry' ELSE 'failed' END,
                 scheduled_at = CASE WHEN attempts < max_attempts THEN NOW() ELSE scheduled_at END,
                 last_error = $2,
                 locked_at = NULL,
                 locked_by = NULL,
                 updated_at = NOW()
             WHERE id IN (
                 SELECT id FROM job_queue
                 WHERE status = 'running'
                   AND locked_at < NOW() - make_interval(secs => $1::float8)
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING ",
            job_columns!()
        ))
        .bind(running_timeout.as_secs_f64())
        .bind(lease_expired_message(running_timeout))
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn delete_terminal_older_than(&self, retention: Duration) -> StoreResult<u64> {
        if retention.is_zero() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM job_queue
             WHERE status IN ('done', 'failed')
               AND updated_at < NOW() - make_interval(secs => $1::float8)",
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
