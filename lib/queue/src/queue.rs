//! Queue client traits.
//!
//! Delivery is at-least-once: a job stays leased for the visibility
//! window and is redelivered when nacked or when the lease lapses.

use crate::error::QueueError;
use crate::job::{EnqueueOptions, JobPayload};
use async_trait::async_trait;

/// Producer side of the job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publishes a job; returns a broker task id.
    ///
    /// With an idempotency key, a duplicate enqueue within the broker's
    /// dedup window is coalesced.
    async fn enqueue(
        &self,
        job: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<String, QueueError>;
}

/// One leased job, hidden from other workers until acked, nacked, or the
/// visibility timeout lapses.
#[async_trait]
pub trait LeasedJob: Send + Sync {
    /// The job payload.
    fn payload(&self) -> &JobPayload;

    /// Broker-side delivery attempt, starting at 1.
    fn attempt(&self) -> u32;

    /// Extends the visibility window while the job is still running.
    async fn extend(&self) -> Result<(), QueueError>;

    /// Acknowledges the job; it will not be redelivered.
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Negatively acknowledges the job for redelivery.
    async fn nack(self: Box<Self>) -> Result<(), QueueError>;
}

/// Consumer side of the job queue.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Leases the next job, or `None` when the poll window elapsed empty.
    async fn next(&self) -> Result<Option<Box<dyn LeasedJob>>, QueueError>;
}
