//! In-memory job queue.
//!
//! Backs the tests and the single-node daemon with the same at-least-once
//! semantics as the broker: nacked jobs are redelivered with a bumped
//! attempt counter, and idempotency keys coalesce duplicate enqueues.

use crate::error::QueueError;
use crate::job::{EnqueueOptions, JobPayload};
use crate::queue::{JobQueue, JobSource, LeasedJob};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ulid::Ulid;

#[derive(Debug, Clone)]
struct QueuedJob {
    task_id: String,
    payload: JobPayload,
    attempt: u32,
}

#[derive(Debug, Default)]
struct QueueInner {
    jobs: VecDeque<QueuedJob>,
    dedup: HashMap<String, String>,
}

/// An in-memory queue implementing both the producer and consumer seams.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<tokio::sync::Notify>,
}

impl InMemoryJobQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently queued (excluding leased).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    fn requeue(&self, job: QueuedJob) {
        self.inner.lock().unwrap().jobs.push_back(job);
        self.notify.notify_one();
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        job: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = inner.dedup.get(key) {
                return Ok(existing.clone());
            }
        }

        let task_id = Ulid::new().to_string();
        if let Some(key) = options.idempotency_key {
            inner.dedup.insert(key, task_id.clone());
        }
        inner.jobs.push_back(QueuedJob {
            task_id: task_id.clone(),
            payload: job.clone(),
            attempt: 1,
        });
        drop(inner);

        self.notify.notify_one();
        Ok(task_id)
    }
}

#[async_trait]
impl JobSource for InMemoryJobQueue {
    async fn next(&self) -> Result<Option<Box<dyn LeasedJob>>, QueueError> {
        loop {
            if let Some(job) = self.inner.lock().unwrap().jobs.pop_front() {
                return Ok(Some(Box::new(InMemoryLease {
                    queue: self.clone(),
                    job,
                })));
            }

            // Bounded poll window so worker loops can observe shutdown.
            match tokio::time::timeout(Duration::from_millis(50), self.notify.notified()).await {
                Ok(()) => {}
                Err(_) => return Ok(None),
            }
        }
    }
}

struct InMemoryLease {
    queue: InMemoryJobQueue,
    job: QueuedJob,
}

#[async_trait]
impl LeasedJob for InMemoryLease {
    fn payload(&self) -> &JobPayload {
        &self.job.payload
    }

    fn attempt(&self) -> u32 {
        self.job.attempt
    }

    async fn extend(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), QueueError> {
        let mut job = self.job;
        job.attempt += 1;
        self.queue.requeue(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tideflow_core::{WorkflowId, WorkspaceId};
    use tideflow_workflow::{Execution, TriggerType};

    fn payload() -> JobPayload {
        JobPayload::execute(&Execution::new(
            WorkflowId::new(),
            1,
            WorkspaceId::new(),
            TriggerType::Manual,
            json!({}),
        ))
    }

    #[tokio::test]
    async fn enqueue_and_lease() {
        let queue = InMemoryJobQueue::new();
        let job = payload();
        queue.enqueue(&job, EnqueueOptions::default()).await.unwrap();

        let leased = queue.next().await.unwrap().expect("job available");
        assert_eq!(leased.payload().execution_id, job.execution_id);
        assert_eq!(leased.attempt(), 1);
        leased.ack().await.unwrap();
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn nack_redelivers_with_bumped_attempt() {
        let queue = InMemoryJobQueue::new();
        queue
            .enqueue(&payload(), EnqueueOptions::default())
            .await
            .unwrap();

        let leased = queue.next().await.unwrap().expect("job");
        leased.nack().await.unwrap();

        let redelivered = queue.next().await.unwrap().expect("redelivered");
        assert_eq!(redelivered.attempt(), 2);
    }

    #[tokio::test]
    async fn idempotency_key_coalesces_duplicates() {
        let queue = InMemoryJobQueue::new();
        let job = payload();

        let first = queue
            .enqueue(&job, EnqueueOptions::idempotent("schedule:x:12:05"))
            .await
            .unwrap();
        let second = queue
            .enqueue(&job, EnqueueOptions::idempotent("schedule:x:12:05"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn empty_queue_returns_none_after_poll_window() {
        let queue = InMemoryJobQueue::new();
        let leased = queue.next().await.unwrap();
        assert!(leased.is_none());
    }
}
