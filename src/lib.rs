//! Durable job pipeline core: a Postgres-backed job store with lease-based
//! claiming, an optional NATS JetStream broker for low-latency wake-ups, a
//! manager for starting and chaining jobs, and a generic worker runtime that
//! drives stage handlers to completion.

pub mod broker;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use broker::{Broker, JobNotification, NatsBroker};
pub use config::Config;
pub use error::{ErrorCategory, PipelineError};
pub use job::{Job, JobHistoryEntry, JobStatus, JobStore, PostgresJobStore};
pub use manager::{JobStatusTree, PipelineManager};
pub use worker::{Handler, HandlerContext, WorkerConfig, WorkerRuntime};
