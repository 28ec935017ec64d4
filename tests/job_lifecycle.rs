//! End-to-end job lifecycle scenarios, run against the in-memory store and
//! broker doubles so they require no external services.

use std::sync::Arc;
use std::time::Duration;

use pipeline_core::testing::{InMemoryBroker, InMemoryJobStore};
use pipeline_core::{Broker, Job, JobStatus, JobStore, PipelineError, PipelineManager};
use tokio_util::sync::CancellationToken;

async fn claim(store: &Arc<dyn JobStore>, worker_id: &str, job_id: uuid::Uuid) -> Job {
    let ct = CancellationToken::new();
    store
        .claim(job_id, worker_id, Duration::from_secs(60), &ct)
        .await
        .unwrap()
        .expect("job should be claimable")
}

#[tokio::test]
async fn scenario_1_happy_path_single_stage() {
    let inner = Arc::new(InMemoryJobStore::new());
    let store: Arc<dyn JobStore> = inner.clone();
    let manager = PipelineManager::new(store.clone(), None);

    let job = manager.start_root("T", b"P".to_vec()).await.unwrap();
    let claimed = claim(&store, "worker-1", job.id).await;
    assert_eq!(claimed.status, JobStatus::Running);

    let ct = CancellationToken::new();
    store.complete(job.id, b"R".to_vec(), &ct).await.unwrap();

    let finished = store.get_by_id(job.id, &ct).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.result, Some(b"R".to_vec()));
    assert!(finished.completed_at.is_some());

    let history = inner.history_for(job.id).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].previous_status, JobStatus::Pending);
    assert_eq!(history[0].new_status, JobStatus::Running);
    assert_eq!(history[1].previous_status, JobStatus::Running);
    assert_eq!(history[1].new_status, JobStatus::Completed);
}

#[tokio::test]
async fn scenario_2_retry_to_exhaustion() {
    let inner = Arc::new(InMemoryJobStore::new());
    let store: Arc<dyn JobStore> = inner.clone();
    let ct = CancellationToken::new();

    let mut job = Job::new("T", vec![]);
    job.max_retries = 2;
    store.create(&job, &ct).await.unwrap();

    // Drive three attempts: claim, fail with "boom", then (if not terminal) retry.
    for _ in 0..3 {
        claim(&store, "worker-1", job.id).await;
        let after_fail = store.fail(job.id, "boom", None, &ct).await.unwrap();
        if after_fail.status == JobStatus::Retrying {
            store.retry(job.id, &ct).await.unwrap();
        }
    }

    let finished = store.get_by_id(job.id, &ct).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.retry_count, 3);
    assert_eq!(finished.error_message.as_deref(), Some("boom"));

    let history = inner.history_for(job.id).await;
    assert_eq!(history.len(), 8);
}

#[tokio::test]
async fn scenario_3_claim_race_exactly_one_winner() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let ct = CancellationToken::new();
    let job = Job::new("T", vec![]);
    store.create(&job, &ct).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let store = store.clone();
        let job_id = job.id;
        handles.push(tokio::spawn(async move {
            let ct = CancellationToken::new();
            store
                .claim(job_id, &format!("worker-{i}"), Duration::from_secs(60), &ct)
                .await
                .unwrap()
                .is_some()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn scenario_4_stale_lock_recovery() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let ct = CancellationToken::new();

    let mut job = Job::new("T", vec![]);
    job.status = JobStatus::Running;
    job.worker_id = Some("dead".into());
    job.locked_until = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    store.create(&job, &ct).await.unwrap();

    let recovered_count = store.cleanup_stale(&ct).await.unwrap();
    assert_eq!(recovered_count, 1);

    let recovered = store.get_by_id(job.id, &ct).await.unwrap().unwrap();
    assert_eq!(recovered.status, JobStatus::Pending);
    assert!(recovered.worker_id.is_none());
    assert!(recovered.locked_until.is_none());
    assert_eq!(recovered.retry_count, 0);
}

#[tokio::test]
async fn scenario_5_chaining_inherits_repository_id() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let manager = PipelineManager::new(store.clone(), Some(broker));

    let repository_id = uuid::Uuid::new_v4();
    let ct = CancellationToken::new();
    let mut root = Job::new("T", vec![]);
    root.repository_id = Some(repository_id);
    store.create(&root, &ct).await.unwrap();

    let claimed = claim(&store, "worker-1", root.id).await;
    assert_eq!(claimed.status, JobStatus::Running);

    let child = manager.chain(root.id, "U", vec![]).await.unwrap();
    assert_eq!(child.parent_job_id, Some(root.id));
    assert_eq!(child.repository_id, Some(repository_id));
    assert_eq!(child.generation_run_id, None);

    store.complete(root.id, vec![], &ct).await.unwrap();
    let finished_root = store.get_by_id(root.id, &ct).await.unwrap().unwrap();
    assert!(finished_root.completed_at.unwrap() >= child.created_at);
}

#[tokio::test]
async fn scenario_6_cancellation_precondition() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let ct = CancellationToken::new();
    let job = Job::new("T", vec![]);
    store.create(&job, &ct).await.unwrap();

    claim(&store, "worker-1", job.id).await;

    let err = store.cancel(job.id, &ct).await.unwrap_err();
    assert!(matches!(err, PipelineError::PreconditionFailure(_)));

    store.fail(job.id, "boom", None, &ct).await.unwrap();
    let retrying = store.get_by_id(job.id, &ct).await.unwrap().unwrap();
    assert_eq!(retrying.status, JobStatus::Retrying);

    store.cancel(job.id, &ct).await.unwrap();
    let cancelled = store.get_by_id(job.id, &ct).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
}
