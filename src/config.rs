use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Job pipeline configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_url: String,
    pub broker_url: Option<String>,
    pub worker_job_type: String,
    pub worker_poll_period: Duration,
    pub worker_lease: Duration,
    pub worker_max_retries_default: i32,
    pub worker_batch_size: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development).
        let _ = dotenv();

        let broker_url = env::var("NATS_URL").ok().filter(|v| !v.is_empty());

        Ok(Self {
            store_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            broker_url,
            worker_job_type: env::var("WORKER_JOB_TYPE")
                .context("WORKER_JOB_TYPE must be set")?,
            worker_poll_period: Duration::from_secs(
                env::var("WORKER_POLL_PERIOD_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("WORKER_POLL_PERIOD_SECS must be a valid number")?,
            ),
            worker_lease: Duration::from_secs(
                env::var("WORKER_LEASE_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .context("WORKER_LEASE_SECS must be a valid number")?,
            ),
            worker_max_retries_default: env::var("WORKER_MAX_RETRIES_DEFAULT")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("WORKER_MAX_RETRIES_DEFAULT must be a valid number")?,
            worker_batch_size: env::var("WORKER_BATCH_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("WORKER_BATCH_SIZE must be a valid number")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_empty_string_disables_broker() {
        std::env::set_var("DATABASE_URL", "postgres://x");
        std::env::set_var("WORKER_JOB_TYPE", "ingestion");
        std::env::set_var("NATS_URL", "");
        let config = Config::from_env().unwrap();
        assert!(config.broker_url.is_none());
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("WORKER_JOB_TYPE");
        std::env::remove_var("NATS_URL");
    }
}
