//! Integration tests against a real Postgres, covering the scenarios that
//! depend on genuine row locking rather than an in-process mutex: the claim
//! race and stale-lock recovery. Mirrors this codebase's shared-container
//! test harness pattern — one container for the whole test binary, migrated
//! once, a fresh logical check per test.

use std::sync::Arc;
use std::time::Duration;

use pipeline_core::{Job, JobStatus, JobStore, PostgresJobStore};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

struct SharedInfra {
    pool: PgPool,
    _container: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

async fn shared_pool() -> PgPool {
    let infra = SHARED_INFRA
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("16-alpine")
                .start()
                .await
                .expect("failed to start postgres container");

            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");
            let db_url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

            let pool = PgPool::connect(&db_url)
                .await
                .expect("failed to connect to test postgres");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("failed to run migrations");

            SharedInfra {
                pool,
                _container: container,
            }
        })
        .await;
    infra.pool.clone()
}

#[tokio::test]
async fn claim_race_exactly_one_winner() {
    let pool = shared_pool().await;
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool));
    let ct = CancellationToken::new();

    let job = Job::new("integration-claim-race", vec![]);
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

    let final_job = store.get_by_id(job.id, &ct).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Running);
}

#[tokio::test]
async fn stale_lock_recovery_resets_exactly_the_expired_row() {
    let pool = shared_pool().await;
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool));
    let ct = CancellationToken::new();

    let mut stale = Job::new("integration-stale-lock", vec![]);
    stale.status = JobStatus::Running;
    stale.worker_id = Some("dead-worker".into());
    stale.locked_until = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
    store.create(&stale, &ct).await.unwrap();

    let mut fresh = Job::new("integration-stale-lock", vec![]);
    fresh.status = JobStatus::Running;
    fresh.worker_id = Some("alive-worker".into());
    fresh.locked_until = Some(chrono::Utc::now() + chrono::Duration::seconds(300));
    store.create(&fresh, &ct).await.unwrap();

    let recovered = store.cleanup_stale(&ct).await.unwrap();
    assert_eq!(recovered, 1);

    let stale_after = store.get_by_id(stale.id, &ct).await.unwrap().unwrap();
    assert_eq!(stale_after.status, JobStatus::Pending);
    assert!(stale_after.worker_id.is_none());

    let fresh_after = store.get_by_id(fresh.id, &ct).await.unwrap().unwrap();
    assert_eq!(fresh_after.status, JobStatus::Running);
    assert_eq!(fresh_after.worker_id.as_deref(), Some("alive-worker"));
}
