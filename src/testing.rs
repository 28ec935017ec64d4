//! In-memory test doubles for `JobStore` and `Broker`, analogous to this
//! codebase's other in-memory doubles for its queue and notification
//! abstractions. Let handler and worker-loop logic be exercised without a
//! live Postgres or NATS.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{Ackable, Broker, FetchedMessage, JobNotification};
use crate::error::{truncate_error_message, PipelineError};
use crate::job::{Job, JobHistoryEntry, JobStatus, JobStore};

/// `JobStore` backed by a `RwLock<HashMap<Uuid, Job>>`. Implements the same
/// atomicity contracts as `PostgresJobStore` (claim races, precondition
/// checks) against in-process state instead of a transaction.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    history: RwLock<Vec<JobHistoryEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history_for(&self, job_id: Uuid) -> Vec<JobHistoryEntry> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    async fn push_history(&self, entry: JobHistoryEntry) {
        self.history.write().await.push(entry);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job, _ct: &CancellationToken) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(PipelineError::ValidationError(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_by_id(
        &self,
        id: Uuid,
        _ct: &CancellationToken,
    ) -> Result<Option<Job>, PipelineError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        _ct: &CancellationToken,
    ) -> Result<Option<Job>, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        let now = Utc::now();
        let eligible = job.status == JobStatus::Pending
            || (job.status == JobStatus::Running
                && job.locked_until.map(|l| l < now).unwrap_or(false));
        if !eligible {
            return Ok(None);
        }

        let previous = job.status;
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.locked_until = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        job.updated_at = now;
        let snapshot = job.clone();
        drop(jobs);

        self.push_history(JobHistoryEntry::new(id, previous, JobStatus::Running, worker_id))
            .await;
        Ok(Some(snapshot))
    }

    async fn complete(
        &self,
        id: Uuid,
        result: Vec<u8>,
        _ct: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };
        let previous = job.status;
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.completed_at = Some(now);
        job.locked_until = None;
        job.updated_at = now;
        drop(jobs);

        if previous != JobStatus::Completed {
            self.push_history(JobHistoryEntry::new(id, previous, JobStatus::Completed, "worker"))
                .await;
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        message: &str,
        details: Option<Vec<u8>>,
        _ct: &CancellationToken,
    ) -> Result<Job, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };

        let previous = job.status;
        let now = Utc::now();
        job.retry_count += 1;
        job.error_message = Some(truncate_error_message(message).to_string());
        job.error_details = details;
        job.locked_until = None;
        job.updated_at = now;
        job.status = if job.retry_count <= job.max_retries {
            JobStatus::Retrying
        } else {
            job.completed_at = Some(now);
            JobStatus::Failed
        };
        let snapshot = job.clone();
        drop(jobs);

        self.push_history(JobHistoryEntry::new(id, previous, snapshot.status, "worker"))
            .await;
        Ok(snapshot)
    }

    async fn retry(&self, id: Uuid, _ct: &CancellationToken) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };
        if job.status != JobStatus::Retrying {
            return Err(PipelineError::PreconditionFailure(format!(
                "cannot retry job {id} in status {:?}",
                job.status
            )));
        }
        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        drop(jobs);

        self.push_history(JobHistoryEntry::new(id, JobStatus::Retrying, JobStatus::Pending, "system"))
            .await;
        Ok(())
    }

    async fn cancel(&self, id: Uuid, _ct: &CancellationToken) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
            return Err(PipelineError::PreconditionFailure(format!(
                "cannot cancel job {id} in status {:?}",
                job.status
            )));
        }
        let previous = job.status;
        job.status = JobStatus::Cancelled;
        job.updated_at = Utc::now();
        drop(jobs);

        self.push_history(JobHistoryEntry::new(id, previous, JobStatus::Cancelled, "api"))
            .await;
        Ok(())
    }

    async fn extend_lock(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        _ct: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Err(PipelineError::PreconditionFailure(format!(
                "job {id} does not exist"
            )));
        };
        if job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker_id) {
            return Err(PipelineError::PreconditionFailure(format!(
                "lease for job {id} held by {worker_id} has been lost"
            )));
        }
        job.locked_until = Some(Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default());
        Ok(())
    }

    async fn cleanup_stale(&self, _ct: &CancellationToken) -> Result<u64, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running && job.locked_until.map(|l| l < now).unwrap_or(false) {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.started_at = None;
                job.locked_until = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_pending_by_type(
        &self,
        job_type: &str,
        limit: i64,
        _ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.job_type == job_type && j.status == JobStatus::Pending)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
        _ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs.values().filter(|j| j.status == status).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn list_by_repository(
        &self,
        repository_id: Uuid,
        limit: i64,
        _ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.repository_id == Some(repository_id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn list_children(
        &self,
        parent_id: Uuid,
        _ct: &CancellationToken,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.parent_job_id == Some(parent_id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }
}

struct NoopAck;

#[async_trait]
impl Ackable for NoopAck {
    async fn ack(self: Box<Self>) {}
}

/// `Broker` backed by a `RwLock<Vec<JobNotification>>` per job type.
/// `fetch` drains whatever is pending for that type; there is nothing to
/// wait on, so `max_wait` is ignored.
#[derive(Default)]
pub struct InMemoryBroker {
    published: RwLock<HashMap<String, Vec<JobNotification>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published_for(&self, job_type: &str) -> Vec<JobNotification> {
        self.published
            .read()
            .await
            .get(job_type)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_stream_and_consumers(&self, _job_types: &[String]) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn publish(&self, notification: &JobNotification) -> Result<(), PipelineError> {
        self.published
            .write()
            .await
            .entry(notification.job_type.clone())
            .or_default()
            .push(notification.clone());
        Ok(())
    }

    async fn fetch(
        &self,
        job_type: &str,
        _max_wait: Duration,
        batch_size: i64,
    ) -> Result<Vec<FetchedMessage>, PipelineError> {
        let mut published = self.published.write().await;
        let Some(queue) = published.get_mut(job_type) else {
            return Ok(Vec::new());
        };
        let take = (batch_size.max(0) as usize).min(queue.len());
        let drained: Vec<JobNotification> = queue.drain(..take).collect();
        Ok(drained
            .into_iter()
            .map(|n| FetchedMessage::new(n, Box::new(NoopAck) as Box<dyn Ackable>))
            .collect())
    }
}
