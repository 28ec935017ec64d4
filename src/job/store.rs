//! Durable persistence of job records, the history log, and the atomic
//! state-transition primitives every worker and the pipeline manager build
//! on. `claim`/`complete`/`fail`/`retry`/`cancel`/`extend_lock` are each a
//! single serializable transaction: a `SELECT ... FOR UPDATE` to pin the
//! row and observe its prior status, a conditional state change, and (where
//! the state actually moved) a `job_history` insert in the same transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{truncate_error_message, PipelineError};

use super::history::JobHistoryEntry;
use super::model::{Job, JobStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job, ct: &CancellationToken) -> Result<(), PipelineError>;

    async fn get_by_id(
        &self,
        id: Uuid,
        ct: &CancellationToken,
    ) -> Result<Option<Job>, PipelineError>;

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        ct: &CancellationToken,
    ) -> Result<Option<Job>, PipelineError>;

    async fn complete(
        &self,
        id: Uuid,
        result: Vec<u8>,
        ct: &CancellationToken,
    ) -> Result<(), PipelineError>;

    async fn fail(
        &self,
        id: Uuid,
        message: &str,
        details: Option<Vec<u8>>,
        ct: &CancellationToken,
    ) -> Result<Job, PipelineError>;

    async fn retry(&self, id: Uuid, ct: &CancellationToken) -> Result<(), PipelineError>;

    async fn cancel(&self, id: Uuid, ct: &CancellationToken) -> Result<(), PipelineError>;

    async fn extend_lock(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        ct: &CancellationToken,
    ) -> Result<(), PipelineError>;

    async fn cleanup_stale(&self, ct: &CancellationToken) -> Result<u64, PipelineError>;

    async fn list_pending_by_type(
        &self,
        job_type: &str,
        limit: i64,
        ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError>;

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
        ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError>;

    async fn list_by_repository(
        &self,
        repository_id: Uuid,
        limit: i64,
        ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError>;

    async fn list_children(
        &self,
        parent_id: Uuid,
        ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError>;
}

/// PostgreSQL-backed `JobStore`.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_history(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entry: &JobHistoryEntry,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO job_history (id, job_id, previous_status, new_status, changed_by, at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.id)
        .bind(entry.job_id)
        .bind(entry.previous_status)
        .bind(entry.new_status)
        .bind(&entry.changed_by)
        .bind(entry.at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, job: &Job, _ct: &CancellationToken) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO jobs (
                id, job_type, status, priority, repository_id, generation_run_id,
                parent_job_id, payload, result, error_message, error_details,
                retry_count, max_retries, created_at, updated_at, started_at,
                completed_at, locked_until, worker_id
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)",
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.repository_id)
        .bind(job.generation_run_id)
        .bind(job.parent_job_id)
        .bind(&job.payload)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(&job.error_details)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.locked_until)
        .bind(&job.worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(
        &self,
        id: Uuid,
        _ct: &CancellationToken,
    ) -> Result<Option<Job>, PipelineError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        _ct: &CancellationToken,
    ) -> Result<Option<Job>, PipelineError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(current) = current else {
            return Ok(None);
        };

        let now = Utc::now();
        let eligible = current.status == JobStatus::Pending
            || (current.status == JobStatus::Running
                && current.locked_until.map(|l| l < now).unwrap_or(false));

        if !eligible {
            tx.rollback().await?;
            return Ok(None);
        }

        let locked_until = now + chrono::Duration::from_std(lease).unwrap_or_default();

        let claimed = sqlx::query_as::<_, Job>(
            "UPDATE jobs
             SET status = $2, worker_id = $3, started_at = $4, locked_until = $5, updated_at = $4
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(JobStatus::Running)
        .bind(worker_id)
        .bind(now)
        .bind(locked_until)
        .fetch_one(&mut *tx)
        .await?;

        Self::write_history(
            &mut tx,
            &JobHistoryEntry::new(id, current.status, JobStatus::Running, worker_id),
        )
        .await?;

        tx.commit().await?;
        debug!(job_id = %id, %worker_id, "claimed job");
        Ok(Some(claimed))
    }

    async fn complete(
        &self,
        id: Uuid,
        result: Vec<u8>,
        _ct: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(current) = current else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };

        let now = Utc::now();
        sqlx::query(
            "UPDATE jobs
             SET status = $2, result = $3, completed_at = $4, locked_until = NULL, updated_at = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Completed)
        .bind(&result)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if current.status != JobStatus::Completed {
            Self::write_history(
                &mut tx,
                &JobHistoryEntry::new(id, current.status, JobStatus::Completed, "worker"),
            )
            .await?;
        } else {
            warn!(job_id = %id, "complete called on an already-completed job; suspected double execution");
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        message: &str,
        details: Option<Vec<u8>>,
        _ct: &CancellationToken,
    ) -> Result<Job, PipelineError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(current) = current else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };

        let now = Utc::now();
        let new_retry_count = current.retry_count + 1;
        let next_status = if new_retry_count <= current.max_retries {
            JobStatus::Retrying
        } else {
            JobStatus::Failed
        };
        let message = truncate_error_message(message);

        let updated = sqlx::query_as::<_, Job>(
            "UPDATE jobs
             SET status = $2, retry_count = $3, locked_until = NULL, error_message = $4,
                 error_details = $5, updated_at = $6,
                 completed_at = CASE WHEN $2 = 'failed' THEN $6 ELSE completed_at END
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(next_status)
        .bind(new_retry_count)
        .bind(message)
        .bind(&details)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        Self::write_history(
            &mut tx,
            &JobHistoryEntry::new(id, current.status, next_status, "worker"),
        )
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn retry(&self, id: Uuid, _ct: &CancellationToken) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(current) = current else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };

        if current.status != JobStatus::Retrying {
            return Err(PipelineError::PreconditionFailure(format!(
                "cannot retry job {id} in status {:?}",
                current.status
            )));
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE jobs
             SET status = $2, worker_id = NULL, started_at = NULL, locked_until = NULL, updated_at = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Pending)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        Self::write_history(
            &mut tx,
            &JobHistoryEntry::new(id, JobStatus::Retrying, JobStatus::Pending, "system"),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel(&self, id: Uuid, _ct: &CancellationToken) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(current) = current else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };

        if !matches!(current.status, JobStatus::Pending | JobStatus::Retrying) {
            return Err(PipelineError::PreconditionFailure(format!(
                "cannot cancel job {id} in status {:?}",
                current.status
            )));
        }

        let now = Utc::now();
        sqlx::query("UPDATE jobs SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(JobStatus::Cancelled)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        Self::write_history(
            &mut tx,
            &JobHistoryEntry::new(id, current.status, JobStatus::Cancelled, "api"),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn extend_lock(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        _ct: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let now = Utc::now();
        let locked_until = now + chrono::Duration::from_std(lease).unwrap_or_default();

        let result = sqlx::query(
            "UPDATE jobs SET locked_until = $4
             WHERE id = $1 AND status = $2 AND worker_id = $3",
        )
        .bind(id)
        .bind(JobStatus::Running)
        .bind(worker_id)
        .bind(locked_until)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::PreconditionFailure(format!(
                "lease for job {id} held by {worker_id} has been lost"
            )));
        }
        Ok(())
    }

    async fn cleanup_stale(&self, _ct: &CancellationToken) -> Result<u64, PipelineError> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = $1, worker_id = NULL, started_at = NULL, locked_until = NULL
             WHERE status = $2 AND locked_until < now()",
        )
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            debug!(count, "recovered stale leases");
        }
        Ok(count)
    }

    async fn list_pending_by_type(
        &self,
        job_type: &str,
        limit: i64,
        _ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs
             WHERE job_type = $1 AND status = $2
             ORDER BY priority DESC, created_at ASC
             LIMIT $3",
        )
        .bind(job_type)
        .bind(JobStatus::Pending)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
        _ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_by_repository(
        &self,
        repository_id: Uuid,
        limit: i64,
        _ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE repository_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(repository_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_children(
        &self,
        parent_id: Uuid,
        _ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE parent_job_id = $1 ORDER BY created_at ASC",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}
