//! NATS integration for the job queue and the cancellation channel.
//!
//! - Jobs ride a JetStream work-queue stream: a leased message stays
//!   invisible for the consumer's ack wait (the visibility timeout),
//!   `AckKind::Progress` extends it, and a Nak redelivers.
//! - Idempotent enqueues set the `Nats-Msg-Id` header; JetStream dedup
//!   coalesces duplicates within the stream's duplicate window.
//! - Cancellation notices ride plain core pub/sub on
//!   `workflow.cancel.<execution_id>`.

use crate::error::QueueError;
use crate::job::{EnqueueOptions, JobPayload};
use crate::queue::{JobQueue, JobSource, LeasedJob};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tideflow_engine::{CancelBus, CancelBusError, CancelNotice};

/// Subject for execution jobs.
const JOBS_SUBJECT: &str = "workflow.jobs";

/// Subject prefix for cancellation notices.
const CANCEL_SUBJECT_PREFIX: &str = "workflow.cancel";

/// Stream name for execution jobs.
const JOBS_STREAM_NAME: &str = "TIDEFLOW_JOBS";

/// Durable consumer name shared by the worker pool.
const WORKERS_CONSUMER_NAME: &str = "tideflow-workers";

/// Configuration for NATS-backed queueing.
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name for jobs (defaults to TIDEFLOW_JOBS).
    pub jobs_stream_name: Option<String>,
    /// Visibility timeout: how long a leased job stays invisible.
    /// Must exceed the longest per-execution timeout.
    pub visibility_timeout: Duration,
    /// Broker-side delivery attempts before a job is dropped.
    pub max_deliver: i64,
    /// Dedup window for idempotency keys.
    pub duplicate_window: Duration,
}

impl NatsQueueConfig {
    /// Creates a config with production defaults.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            jobs_stream_name: None,
            visibility_timeout: Duration::from_secs(15 * 60),
            max_deliver: 3,
            duplicate_window: Duration::from_secs(2 * 60),
        }
    }

    fn jobs_stream(&self) -> &str {
        self.jobs_stream_name.as_deref().unwrap_or(JOBS_STREAM_NAME)
    }
}

/// JetStream-backed job queue (producer side).
pub struct NatsJobQueue {
    jetstream: Arc<jetstream::Context>,
    config: NatsQueueConfig,
}

impl NatsJobQueue {
    /// Connects and ensures the jobs stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: NatsQueueConfig) -> Result<Self, QueueError> {
        let client = async_nats::connect(&config.url).await.map_err(|e| {
            QueueError::ConnectionFailed {
                message: e.to_string(),
            }
        })?;
        let jetstream = jetstream::new(client);
        Self::ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            jetstream: Arc::new(jetstream),
            config,
        })
    }

    async fn ensure_stream(
        jetstream: &jetstream::Context,
        config: &NatsQueueConfig,
    ) -> Result<(), QueueError> {
        let stream_config = jetstream::stream::Config {
            name: config.jobs_stream().to_string(),
            subjects: vec![format!("{JOBS_SUBJECT}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            duplicate_window: config.duplicate_window,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to create jobs stream: {e}"),
            })?;

        Ok(())
    }

    fn job_subject(payload: &JobPayload) -> String {
        format!("{JOBS_SUBJECT}.{}", payload.workspace_id)
    }
}

#[async_trait]
impl JobQueue for NatsJobQueue {
    async fn enqueue(
        &self,
        job: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let envelope = crate::envelope::Envelope::new(job.clone());
        let bytes = envelope
            .to_json_bytes()
            .map_err(|e| QueueError::Serialization {
                message: e.to_string(),
            })?;

        let subject = Self::job_subject(job);
        let mut headers = async_nats::HeaderMap::new();
        if let Some(key) = &options.idempotency_key {
            // JetStream dedups on Nats-Msg-Id within the duplicate window.
            headers.insert("Nats-Msg-Id", key.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, bytes.into())
            .await
            .map_err(|e| QueueError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| QueueError::PublishFailed {
                message: e.to_string(),
            })?;

        Ok(match &options.idempotency_key {
            Some(key) => key.clone(),
            None => format!("{}:{}", self.config.jobs_stream(), ack.sequence),
        })
    }
}

/// JetStream-backed job source (consumer side).
pub struct NatsJobSource {
    consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
}

impl NatsJobSource {
    /// Connects and binds the shared durable pull consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or consumer setup fails.
    pub async fn connect(config: NatsQueueConfig) -> Result<Self, QueueError> {
        let client = async_nats::connect(&config.url).await.map_err(|e| {
            QueueError::ConnectionFailed {
                message: e.to_string(),
            }
        })?;
        let jetstream = jetstream::new(client);
        NatsJobQueue::ensure_stream(&jetstream, &config).await?;

        let stream = jetstream
            .get_stream(config.jobs_stream())
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to get jobs stream: {e}"),
            })?;

        let consumer = stream
            .get_or_create_consumer(
                WORKERS_CONSUMER_NAME,
                jetstream::consumer::pull::Config {
                    durable_name: Some(WORKERS_CONSUMER_NAME.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: config.visibility_timeout,
                    max_deliver: config.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to create workers consumer: {e}"),
            })?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl JobSource for NatsJobSource {
    async fn next(&self) -> Result<Option<Box<dyn LeasedJob>>, QueueError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(Duration::from_secs(5))
            .messages()
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                message: e.to_string(),
            })?;

        let Some(message) = batch.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| QueueError::ConsumeFailed {
            message: e.to_string(),
        })?;

        let envelope =
            crate::envelope::Envelope::<JobPayload>::from_json_bytes(&message.payload).map_err(
                |e| QueueError::Serialization {
                    message: format!("failed to deserialize job: {e}"),
                },
            )?;

        let attempt = message.info().map_or(1, |info| info.delivered.max(1) as u32);

        Ok(Some(Box::new(NatsLease {
            payload: envelope.into_payload(),
            attempt,
            message,
        })))
    }
}

struct NatsLease {
    payload: JobPayload,
    attempt: u32,
    message: jetstream::Message,
}

#[async_trait]
impl LeasedJob for NatsLease {
    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn extend(&self) -> Result<(), QueueError> {
        self.message
            .ack_with(jetstream::AckKind::Progress)
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                message: format!("failed to extend lease: {e}"),
            })
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.message
            .ack()
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                message: format!("failed to ack job: {e}"),
            })
    }

    async fn nack(self: Box<Self>) -> Result<(), QueueError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                message: format!("failed to nack job: {e}"),
            })
    }
}

/// Core pub/sub cancellation channel.
pub struct NatsCancelBus {
    client: async_nats::Client,
}

impl NatsCancelBus {
    /// Connects the cancel bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, CancelBusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| CancelBusError::Subscribe {
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(client: async_nats::Client) -> Self {
        Self { client }
    }

    fn cancel_subject(notice: &CancelNotice) -> String {
        format!("{CANCEL_SUBJECT_PREFIX}.{}", notice.execution_id)
    }
}

#[async_trait]
impl CancelBus for NatsCancelBus {
    async fn publish(&self, notice: &CancelNotice) -> Result<(), CancelBusError> {
        let bytes = serde_json::to_vec(notice).map_err(|e| CancelBusError::Publish {
            message: format!("failed to serialize cancel notice: {e}"),
        })?;

        self.client
            .publish(Self::cancel_subject(notice), bytes.into())
            .await
            .map_err(|e| CancelBusError::Publish {
                message: e.to_string(),
            })
    }

    async fn subscribe(
        &self,
    ) -> Result<futures::stream::BoxStream<'static, CancelNotice>, CancelBusError> {
        let subscriber = self
            .client
            .subscribe(format!("{CANCEL_SUBJECT_PREFIX}.>"))
            .await
            .map_err(|e| CancelBusError::Subscribe {
                message: e.to_string(),
            })?;

        let stream = subscriber.filter_map(|message| async move {
            match serde_json::from_slice::<CancelNotice>(&message.payload) {
                Ok(notice) => Some(notice),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed cancel notice");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
