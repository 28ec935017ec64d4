//! Operator CLI for the job pipeline.
//!
//! Talks directly to Postgres (and, where configured, NATS) rather than
//! going through a running worker — so it keeps working when every worker
//! is down.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline_core::{Config, JobStore, NatsBroker, PipelineManager, PostgresJobStore};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pipelinectl")]
#[command(about = "Inspect and operate the job pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new root job.
    Submit {
        job_type: String,
        /// Raw payload bytes, read as a UTF-8 string.
        #[arg(long, default_value = "")]
        payload: String,
    },

    /// Chain a child job onto an existing parent.
    Chain {
        parent_id: Uuid,
        job_type: String,
        #[arg(long, default_value = "")]
        payload: String,
    },

    /// Print a job and its direct children.
    Status { id: Uuid },

    /// List jobs by status.
    List {
        #[arg(value_enum)]
        status: StatusArg,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Recover jobs whose worker lease has expired.
    CleanupStale,

    /// Requeue every job stuck in `retrying`.
    RetryAllRetrying {
        #[arg(long, default_value_t = 100)]
        batch_size: i64,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum StatusArg {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl From<StatusArg> for pipeline_core::JobStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => pipeline_core::JobStatus::Pending,
            StatusArg::Running => pipeline_core::JobStatus::Running,
            StatusArg::Completed => pipeline_core::JobStatus::Completed,
            StatusArg::Failed => pipeline_core::JobStatus::Failed,
            StatusArg::Retrying => pipeline_core::JobStatus::Retrying,
            StatusArg::Cancelled => pipeline_core::JobStatus::Cancelled,
        }
    }
}

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job: Option<pipeline_core::Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jobs: Option<Vec<pipeline_core::Job>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    children: Option<Vec<pipeline_core::Job>>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            success: true,
            message: None,
            count: None,
            job: None,
            jobs: None,
            children: None,
        }
    }
}

fn output(resp: Response) {
    println!("{}", serde_json::to_string(&resp).unwrap());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(3)
        .connect(&config.store_url)
        .await
        .context("failed to connect to database")?;
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool));

    let broker: Option<Arc<dyn pipeline_core::Broker>> = match &config.broker_url {
        Some(url) => Some(Arc::new(
            NatsBroker::connect(url).await.context("failed to connect to NATS")?,
        )),
        None => None,
    };
    let manager = PipelineManager::new(store.clone(), broker);
    let ct = CancellationToken::new();

    match cli.command {
        Commands::Submit { job_type, payload } => {
            let job = manager.start_root(job_type, payload.into_bytes()).await?;
            output(Response {
                job: Some(job),
                ..Default::default()
            });
        }
        Commands::Chain {
            parent_id,
            job_type,
            payload,
        } => {
            let job = manager
                .chain(parent_id, job_type, payload.into_bytes())
                .await?;
            output(Response {
                job: Some(job),
                ..Default::default()
            });
        }
        Commands::Status { id } => match manager.job_status_tree(id).await? {
            Some(tree) => output(Response {
                job: Some(tree.job),
                children: Some(tree.children),
                ..Default::default()
            }),
            None => output(Response {
                success: false,
                message: Some(format!("job {id} not found")),
                ..Default::default()
            }),
        },
        Commands::List { status, limit } => {
            let jobs = store.list_by_status(status.into(), limit, &ct).await?;
            output(Response {
                jobs: Some(jobs),
                ..Default::default()
            });
        }
        Commands::CleanupStale => {
            let count = manager.cleanup_stale().await?;
            output(Response {
                count: Some(count),
                message: Some(format!("recovered {count} stale lease(s)")),
                ..Default::default()
            });
        }
        Commands::RetryAllRetrying { batch_size } => {
            let count = manager.retry_all_retrying(batch_size).await?;
            output(Response {
                count: Some(count),
                message: Some(format!("requeued {count} job(s)")),
                ..Default::default()
            });
        }
    }

    Ok(())
}
