//! Job queue and worker pool for the tideflow platform.
//!
//! Producers (the API execute endpoint, the schedule loop, the webhook
//! ingestor, retry and replay) create an execution row and publish a job;
//! workers lease jobs at-least-once, run the engine, and ack or nack by
//! outcome. The broker also carries the cluster-wide cancellation
//! channel.
//!
//! NATS JetStream backs the production implementation; an in-memory
//! queue backs the tests and the single-node daemon.

pub mod envelope;
pub mod error;
pub mod job;
pub mod memory;
pub mod nats;
pub mod producer;
pub mod queue;
pub mod webhook;
pub mod worker;

pub use envelope::{CURRENT_VERSION, Envelope, RawEnvelope};
pub use error::QueueError;
pub use job::{EnqueueOptions, JobKind, JobPayload, ResumeDetails};
pub use memory::InMemoryJobQueue;
pub use nats::{NatsCancelBus, NatsJobQueue, NatsJobSource, NatsQueueConfig};
pub use producer::{EnqueueRequest, ExecutionProducer, ProduceError, SubmitReceipt};
pub use queue::{JobQueue, JobSource, LeasedJob};
pub use webhook::{
    InMemoryWebhookStore, InboundRequest, WebhookEndpoint, WebhookError, WebhookIngestor,
    WebhookStore,
};
pub use worker::{WorkerPool, WorkerPoolConfig};
