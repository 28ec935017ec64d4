//! Creates root jobs, chains children, reports status trees, and requeues
//! jobs stuck in `retrying`. The only write path into the store that isn't
//! owned by a worker's claim/complete/fail cycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::broker::{Broker, JobNotification};
use crate::error::PipelineError;
use crate::job::{Job, JobStore};

/// A job plus its direct children (depth 1). Callers wanting deeper trees
/// recurse on each child's id.
#[derive(Debug, Clone)]
pub struct JobStatusTree {
    pub job: Job,
    pub children: Vec<Job>,
}

pub struct PipelineManager {
    store: Arc<dyn JobStore>,
    broker: Option<Arc<dyn Broker>>,
}

impl PipelineManager {
    pub fn new(store: Arc<dyn JobStore>, broker: Option<Arc<dyn Broker>>) -> Self {
        Self { store, broker }
    }

    /// Best-effort publish: logged on failure, never surfaced — the store
    /// already has the job and workers will find it by polling.
    async fn notify(&self, job: &Job) {
        let Some(broker) = &self.broker else {
            return;
        };
        let notification = JobNotification {
            job_id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
        };
        if let Err(e) = broker.publish(&notification).await {
            warn!(job_id = %job.id, error = %e, "failed to publish job notification");
        }
    }

    pub async fn start_root(
        &self,
        job_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Job, PipelineError> {
        let job = Job::new(job_type, payload);
        let ct = CancellationToken::new();
        self.store.create(&job, &ct).await?;
        self.notify(&job).await;
        Ok(job)
    }

    pub async fn chain(
        &self,
        parent_id: Uuid,
        job_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Job, PipelineError> {
        let ct = CancellationToken::new();
        let parent = self
            .store
            .get_by_id(parent_id, &ct)
            .await?
            .ok_or_else(|| PipelineError::ValidationError(format!("parent job {parent_id} not found")))?;

        let child = Job::child_of(&parent, job_type, payload);
        self.store.create(&child, &ct).await?;
        self.notify(&child).await;
        Ok(child)
    }

    pub async fn job_status_tree(&self, id: Uuid) -> Result<Option<JobStatusTree>, PipelineError> {
        let ct = CancellationToken::new();
        let Some(job) = self.store.get_by_id(id, &ct).await? else {
            return Ok(None);
        };
        let children = self.store.list_children(id, &ct).await?;
        Ok(Some(JobStatusTree { job, children }))
    }

    /// Iterate jobs in `retrying` state (bounded batch), call `store.retry`,
    /// and republish. Intended to be run from an operator CLI or a timer.
    pub async fn retry_all_retrying(&self, batch_size: i64) -> Result<u64, PipelineError> {
        let ct = CancellationToken::new();
        let retrying = self
            .store
            .list_by_status(crate::job::JobStatus::Retrying, batch_size, &ct)
            .await?;

        let mut requeued = 0;
        for job in retrying {
            if let Err(e) = self.store.retry(job.id, &ct).await {
                warn!(job_id = %job.id, error = %e, "failed to requeue retrying job");
                continue;
            }
            self.notify(&job).await;
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Bulk recovery of stale leases, exposed here so operators and timers
    /// can call it alongside `retry_all_retrying` without reaching past the
    /// manager into the store directly.
    pub async fn cleanup_stale(&self) -> Result<u64, PipelineError> {
        let ct = CancellationToken::new();
        self.store.cleanup_stale(&ct).await
    }
}
