//! Job pipeline worker
//!
//! Runs one `WorkerRuntime` for a single job type, claiming and processing
//! jobs until told to shut down. The handler registered here is a stand-in:
//! real deployments swap `EchoHandler` for the stage logic that job type
//! actually needs.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pipeline_core::{
    Config, Handler, HandlerContext, Job, NatsBroker, PipelineError, PipelineManager,
    PostgresJobStore, WorkerConfig, WorkerRuntime,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Placeholder stage handler: returns the job's payload unchanged. Wire a
/// real handler in before running this against production job types.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, _ctx: HandlerContext, job: Job) -> Result<Vec<u8>, PipelineError> {
        Ok(job.payload)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pipeline_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();

    let config = Config::from_env()?;
    tracing::info!(job_type = %config.worker_job_type, "starting pipeline worker");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.store_url)
        .await
        .context("failed to connect to database")?;
    let store: Arc<dyn pipeline_core::JobStore> = Arc::new(PostgresJobStore::new(pool));

    let broker: Option<Arc<dyn pipeline_core::Broker>> = match &config.broker_url {
        Some(url) => {
            let broker = NatsBroker::connect(url)
                .await
                .context("failed to connect to NATS")?;
            broker
                .ensure_stream_and_consumers(&[config.worker_job_type.clone()])
                .await
                .context("failed to set up JetStream topology")?;
            Some(Arc::new(broker))
        }
        None => {
            tracing::info!("NATS_URL not set, worker will poll the store only");
            None
        }
    };

    let manager = Arc::new(PipelineManager::new(store.clone(), broker.clone()));

    let worker_config = WorkerConfig {
        poll_period: config.worker_poll_period,
        lease: config.worker_lease,
        batch_size: config.worker_batch_size,
        ..WorkerConfig::new(config.worker_job_type.clone())
    };
    let runtime = Arc::new(WorkerRuntime::new(
        store,
        broker,
        manager,
        Arc::new(EchoHandler),
        worker_config,
    ));

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            shutdown_signal.cancel();
        }
    });

    runtime.run(shutdown).await;
    Ok(())
}
