//! Best-effort wake-up notifications. The broker is an optimization, never
//! a source of truth — workers must function with `Broker::fetch` always
//! returning empty, falling back to polling the store.

mod nats;

pub use nats::NatsBroker;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// The only information a notification carries: enough for a worker to
/// decide whether attempting a claim is worthwhile. Payload and result
/// bytes never cross the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: Uuid,
    pub job_type: String,
    pub priority: i32,
}

/// Transport-specific ack, hidden behind the trait so a worker never has to
/// know whether a notification came from JetStream or an in-memory double.
#[async_trait]
pub trait Ackable: Send {
    async fn ack(self: Box<Self>);
}

/// A single fetched notification, carrying enough to ack it against the
/// underlying transport without the caller knowing which transport that is.
pub struct FetchedMessage {
    pub notification: JobNotification,
    ack: Box<dyn Ackable>,
}

impl std::fmt::Debug for FetchedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedMessage")
            .field("notification", &self.notification)
            .finish()
    }
}

impl FetchedMessage {
    pub fn new(notification: JobNotification, ack: Box<dyn Ackable>) -> Self {
        Self { notification, ack }
    }

    /// Acknowledge the message: the job id has been handed off to
    /// `store.claim`, win or lose the race. The broker never encodes retry
    /// decisions, so there is no separate nak path for handler failure.
    pub async fn ack(self) {
        self.ack.ack().await
    }
}

pub const STREAM_NAME: &str = "JOBS";
pub const SUBJECT_WILDCARD: &str = "jobs.>";

pub fn subject_for_type(job_type: &str) -> String {
    format!("jobs.{job_type}")
}

pub fn consumer_name_for_type(job_type: &str) -> String {
    format!("{job_type}-worker")
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent topology setup: get-or-create the stream, get-or-create
    /// a durable pull consumer for each job type.
    async fn ensure_stream_and_consumers(&self, job_types: &[String])
        -> Result<(), PipelineError>;

    /// Best-effort publish. Failure is logged by the caller, never
    /// propagated into the job lifecycle.
    async fn publish(&self, notification: &JobNotification) -> Result<(), PipelineError>;

    /// Blocking pull with a deadline for a single job type's consumer.
    async fn fetch(
        &self,
        job_type: &str,
        max_wait: Duration,
        batch_size: i64,
    ) -> Result<Vec<FetchedMessage>, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_naming_matches_type() {
        assert_eq!(subject_for_type("ingestion"), "jobs.ingestion");
        assert_eq!(consumer_name_for_type("ingestion"), "ingestion-worker");
    }

    struct RecordingAck(std::sync::Arc<std::sync::atomic::AtomicBool>);

    #[async_trait]
    impl Ackable for RecordingAck {
        async fn ack(self: Box<Self>) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ack_runs_exactly_once() {
        let notification = JobNotification {
            job_id: Uuid::new_v4(),
            job_type: "ingestion".into(),
            priority: 0,
        };
        let acked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let msg = FetchedMessage::new(notification, Box::new(RecordingAck(acked.clone())));
        msg.ack().await;
        assert!(acked.load(std::sync::atomic::Ordering::SeqCst));
    }
}
