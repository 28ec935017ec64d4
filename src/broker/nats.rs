use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull::Config as PullConfig, stream::Config as StreamConfig};
use async_nats::jetstream::consumer::AckPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{error, warn};

use super::{
    consumer_name_for_type, subject_for_type, Ackable, Broker, FetchedMessage, JobNotification,
    STREAM_NAME, SUBJECT_WILDCARD,
};
use crate::error::PipelineError;

struct JetStreamAck(jetstream::Message);

#[async_trait]
impl Ackable for JetStreamAck {
    async fn ack(self: Box<Self>) {
        if let Err(e) = self.0.ack().await {
            warn!(error = %e, "failed to ack job notification");
        }
    }
}

/// JetStream-backed `Broker`. Stream and per-type durable pull consumers are
/// created lazily and idempotently; `publish`/`fetch` never fail the job
/// lifecycle on their own — callers degrade to polling on error.
pub struct NatsBroker {
    jetstream: jetstream::Context,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| PipelineError::BrokerError(format!("failed to connect to NATS: {e}")))?;
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    async fn ensure_stream(&self) -> Result<(), PipelineError> {
        if self.jetstream.get_stream(STREAM_NAME).await.is_ok() {
            return Ok(());
        }

        self.jetstream
            .create_stream(StreamConfig {
                name: STREAM_NAME.to_string(),
                subjects: vec![SUBJECT_WILDCARD.to_string()],
                max_messages: 100_000,
                max_bytes: 500 * 1024 * 1024,
                max_age: Duration::from_secs(7 * 24 * 60 * 60),
                ..Default::default()
            })
            .await
            .map_err(|e| PipelineError::BrokerError(format!("failed to create stream: {e}")))?;
        Ok(())
    }

    async fn ensure_consumer(&self, job_type: &str) -> Result<(), PipelineError> {
        let stream = self
            .jetstream
            .get_stream(STREAM_NAME)
            .await
            .map_err(|e| PipelineError::BrokerError(format!("stream not found: {e}")))?;

        let durable_name = consumer_name_for_type(job_type);
        if stream
            .get_consumer::<PullConfig>(&durable_name)
            .await
            .is_ok()
        {
            return Ok(());
        }

        stream
            .create_consumer(PullConfig {
                durable_name: Some(durable_name.clone()),
                name: Some(durable_name),
                filter_subject: subject_for_type(job_type),
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(|e| PipelineError::BrokerError(format!("failed to create consumer: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn ensure_stream_and_consumers(
        &self,
        job_types: &[String],
    ) -> Result<(), PipelineError> {
        self.ensure_stream().await?;
        for job_type in job_types {
            self.ensure_consumer(job_type).await?;
        }
        Ok(())
    }

    async fn publish(&self, notification: &JobNotification) -> Result<(), PipelineError> {
        let subject = subject_for_type(&notification.job_type);
        let payload = serde_json::to_vec(notification)
            .map_err(|e| PipelineError::BrokerError(format!("failed to encode notification: {e}")))?;

        let ack = self
            .jetstream
            .publish(subject, payload.into())
            .await
            .map_err(|e| PipelineError::BrokerError(format!("publish failed: {e}")))?;
        ack.await
            .map_err(|e| PipelineError::BrokerError(format!("publish not acked: {e}")))?;
        Ok(())
    }

    async fn fetch(
        &self,
        job_type: &str,
        max_wait: Duration,
        batch_size: i64,
    ) -> Result<Vec<FetchedMessage>, PipelineError> {
        let stream = self
            .jetstream
            .get_stream(STREAM_NAME)
            .await
            .map_err(|e| PipelineError::BrokerError(format!("stream not found: {e}")))?;

        let consumer = stream
            .get_consumer::<PullConfig>(&consumer_name_for_type(job_type))
            .await
            .map_err(|e| PipelineError::BrokerError(format!("consumer not found: {e}")))?;

        let mut messages = consumer
            .fetch()
            .max_messages(batch_size.max(1) as usize)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| PipelineError::BrokerError(format!("fetch failed: {e}")))?;

        let mut out = Vec::new();
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "error pulling message from jetstream");
                    continue;
                }
            };

            let notification: JobNotification = match serde_json::from_slice(&message.payload) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "dropping malformed job notification");
                    let _ = message.ack().await;
                    continue;
                }
            };

            out.push(FetchedMessage::new(
                notification,
                Box::new(JetStreamAck(message)),
            ));
        }

        Ok(out)
    }
}
