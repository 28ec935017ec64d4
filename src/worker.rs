//! The generic consumer loop: discover claimable jobs, claim exactly one,
//! run the stage handler under a renewable lease, finalize, repeat. One
//! `WorkerRuntime` per job type; many replicas per type are safe to run
//! concurrently because every exclusion lives in the store (see `JobStore::claim`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, FetchedMessage};
use crate::error::PipelineError;
use crate::job::{Job, JobStore};
use crate::manager::PipelineManager;

/// Retry a store-facing call against `PipelineError::should_retry`'s bounded
/// exponential backoff (see `error.rs`), letting through the first error
/// that's either permanent or past the retry budget.
async fn retry_with_backoff<T, F, Fut>(mut op: F) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.should_retry(attempt) => {
                let delay_ms = e.backoff_delay_ms(attempt);
                warn!(attempt, delay_ms, error = %e, "retrying transient store error");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Context handed to a stage handler: its cancellation token (tripped on
/// lease loss, worker shutdown, or the handler-visible deadline) and the
/// pipeline manager, so the handler can chain children before returning.
pub struct HandlerContext {
    pub cancellation: CancellationToken,
    pub manager: Arc<PipelineManager>,
}

/// A stage handler: pure callback `(ctx, job) -> result bytes | error`.
/// MUST NOT mutate its own job row directly — the worker runtime owns that.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, job: Job) -> Result<Vec<u8>, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub job_type: String,
    pub worker_id: String,
    pub poll_period: Duration,
    pub lease: Duration,
    pub batch_size: i64,
}

impl WorkerConfig {
    pub fn new(job_type: impl Into<String>) -> Self {
        let job_type = job_type.into();
        Self {
            worker_id: format!("{job_type}-{}", Uuid::new_v4()),
            job_type,
            poll_period: Duration::from_secs(5),
            lease: Duration::from_secs(300),
            batch_size: 10,
        }
    }
}

pub struct WorkerRuntime<H: Handler> {
    store: Arc<dyn JobStore>,
    broker: Option<Arc<dyn Broker>>,
    manager: Arc<PipelineManager>,
    handler: Arc<H>,
    config: WorkerConfig,
}

impl<H: Handler + 'static> WorkerRuntime<H> {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Option<Arc<dyn Broker>>,
        manager: Arc<PipelineManager>,
        handler: Arc<H>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            manager,
            handler,
            config,
        }
    }

    /// Discover a batch of candidate job ids: broker notifications when
    /// available, otherwise (or in addition, on broker error) a single read
    /// from `list_pending_by_type`.
    async fn discover(&self, ct: &CancellationToken) -> Vec<Candidate> {
        if let Some(broker) = &self.broker {
            match broker
                .fetch(&self.config.job_type, self.config.poll_period, self.config.batch_size)
                .await
            {
                Ok(messages) if !messages.is_empty() => {
                    return messages
                        .into_iter()
                        .map(|m| Candidate {
                            job_id: m.notification.job_id,
                            ack: Some(m),
                        })
                        .collect();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "broker fetch failed, falling back to polling");
                }
            }
        }

        match retry_with_backoff(|| self.store.list_pending_by_type(&self.config.job_type, 1, ct)).await {
            Ok(jobs) => jobs
                .into_iter()
                .map(|j| Candidate {
                    job_id: j.id,
                    ack: None,
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "failed to list pending jobs after exhausting retries");
                Vec::new()
            }
        }
    }

    /// Run the worker until `shutdown` is cancelled. Does not forcibly
    /// terminate in-flight handlers; the lease expires naturally if one
    /// never returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, job_type = %self.config.job_type, "worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let candidates = self.discover(&shutdown).await;

            if candidates.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_period) => {}
                }
                continue;
            }

            let mut handles = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    worker.process_candidate(candidate, shutdown).await;
                }));
            }
            futures::future::join_all(handles).await;
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    async fn process_candidate(&self, candidate: Candidate, shutdown: CancellationToken) {
        let ct = CancellationToken::new();
        let claimed = retry_with_backoff(|| {
            self.store
                .claim(candidate.job_id, &self.config.worker_id, self.config.lease, &ct)
        })
        .await;

        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %candidate.job_id, "lost claim race");
                if let Some(msg) = candidate.ack {
                    msg.ack().await;
                }
                return;
            }
            Err(e) => {
                error!(job_id = %candidate.job_id, error = %e, "failed to claim job after exhausting retries");
                return;
            }
        };

        if let Some(msg) = candidate.ack {
            msg.ack().await;
        }

        self.run_handler(job, shutdown).await;
    }

    async fn run_handler(&self, job: Job, shutdown: CancellationToken) {
        let job_id = job.id;
        let handler_ct = shutdown.child_token();
        let extender_ct = handler_ct.clone();

        let store = self.store.clone();
        let worker_id = self.config.worker_id.clone();
        let lease = self.config.lease;
        let extend_token = handler_ct.clone();

        let extender = tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease / 2);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = extend_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = store.extend_lock(job_id, &worker_id, lease, &extender_ct).await {
                            warn!(job_id = %job_id, error = %e, "lease extension failed, cancelling handler");
                            extend_token.cancel();
                            break;
                        }
                    }
                }
            }
        });

        let deadline = lease.saturating_sub(Duration::from_secs(30));
        let ctx = HandlerContext {
            cancellation: handler_ct.clone(),
            manager: self.manager.clone(),
        };

        let result = tokio::select! {
            res = self.handler.handle(ctx, job.clone()) => res,
            _ = tokio::time::sleep(deadline) => {
                handler_ct.cancel();
                Err(PipelineError::HandlerError("handler exceeded its lease-derived deadline".into()))
            }
        };

        handler_ct.cancel();
        let _ = extender.await;

        match result {
            Ok(result_bytes) => {
                let outcome = retry_with_backoff(|| {
                    let result_bytes = result_bytes.clone();
                    async move { self.store.complete(job_id, result_bytes, &CancellationToken::new()).await }
                })
                .await;
                if let Err(e) = outcome {
                    error!(job_id = %job_id, error = %e, "failed to mark job complete after exhausting retries");
                }
            }
            Err(e) => {
                let message = e.to_string();
                let outcome = retry_with_backoff(|| {
                    let message = message.clone();
                    async move { self.store.fail(job_id, &message, None, &CancellationToken::new()).await }
                })
                .await;
                if let Err(store_err) = outcome {
                    error!(job_id = %job_id, error = %store_err, "failed to mark job failed after exhausting retries");
                }
            }
        }
    }
}

struct Candidate {
    job_id: Uuid,
    ack: Option<FetchedMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryBroker, InMemoryJobStore};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, _ctx: HandlerContext, job: Job) -> Result<Vec<u8>, PipelineError> {
            Ok(job.payload)
        }
    }

    struct AlwaysFailsHandler;

    #[async_trait]
    impl Handler for AlwaysFailsHandler {
        async fn handle(&self, _ctx: HandlerContext, _job: Job) -> Result<Vec<u8>, PipelineError> {
            Err(PipelineError::HandlerError("boom".into()))
        }
    }

    fn runtime<H: Handler + 'static>(
        store: Arc<dyn JobStore>,
        handler: Arc<H>,
        job_type: &str,
    ) -> Arc<WorkerRuntime<H>> {
        let manager = Arc::new(PipelineManager::new(store.clone(), None));
        let config = WorkerConfig {
            poll_period: Duration::from_millis(10),
            lease: Duration::from_secs(60),
            batch_size: 5,
            ..WorkerConfig::new(job_type)
        };
        Arc::new(WorkerRuntime::new(store, None, manager, handler, config))
    }

    #[tokio::test]
    async fn happy_path_completes_the_job() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let ct = CancellationToken::new();
        let job = Job::new("ingestion", b"payload".to_vec());
        store.create(&job, &ct).await.unwrap();

        let worker = runtime(store.clone(), Arc::new(EchoHandler), "ingestion");
        worker
            .process_candidate(
                Candidate {
                    job_id: job.id,
                    ack: None,
                },
                CancellationToken::new(),
            )
            .await;

        let updated = store.get_by_id(job.id, &ct).await.unwrap().unwrap();
        assert_eq!(updated.status, crate::job::JobStatus::Completed);
        assert_eq!(updated.result, Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn failing_handler_moves_job_to_retrying() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let ct = CancellationToken::new();
        let job = Job::new("ingestion", vec![]);
        store.create(&job, &ct).await.unwrap();

        let worker = runtime(store.clone(), Arc::new(AlwaysFailsHandler), "ingestion");
        worker
            .process_candidate(
                Candidate {
                    job_id: job.id,
                    ack: None,
                },
                CancellationToken::new(),
            )
            .await;

        let updated = store.get_by_id(job.id, &ct).await.unwrap().unwrap();
        assert_eq!(updated.status, crate::job::JobStatus::Retrying);
        assert_eq!(updated.error_message.as_deref(), Some("handler error: boom"));
    }

    #[tokio::test]
    async fn config_worker_id_is_prefixed_by_job_type() {
        let config = WorkerConfig::new("ingestion");
        assert!(config.worker_id.starts_with("ingestion-"));
    }

    #[tokio::test]
    async fn discover_falls_back_to_polling_when_broker_is_absent() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let ct = CancellationToken::new();
        let job = Job::new("ingestion", vec![]);
        store.create(&job, &ct).await.unwrap();

        let worker = runtime(store.clone(), Arc::new(EchoHandler), "ingestion");
        let candidates = worker.discover(&ct).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].job_id, job.id);
    }

    #[tokio::test]
    async fn discover_prefers_broker_notifications_when_present() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let ct = CancellationToken::new();
        let job = Job::new("ingestion", vec![]);
        store.create(&job, &ct).await.unwrap();
        broker
            .publish(&crate::broker::JobNotification {
                job_id: job.id,
                job_type: "ingestion".into(),
                priority: 0,
            })
            .await
            .unwrap();

        let manager = Arc::new(PipelineManager::new(store.clone(), Some(broker.clone())));
        let config = WorkerConfig {
            poll_period: Duration::from_millis(10),
            lease: Duration::from_secs(60),
            batch_size: 5,
            ..WorkerConfig::new("ingestion")
        };
        let worker = Arc::new(WorkerRuntime::new(
            store,
            Some(broker),
            manager,
            Arc::new(EchoHandler),
            config,
        ));

        let candidates = worker.discover(&ct).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].job_id, job.id);
        assert!(candidates[0].ack.is_some());
    }
}
