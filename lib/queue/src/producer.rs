//! Execution producers.
//!
//! Every enqueue path (API, schedule loop, webhook ingest, retry,
//! replay, wait resume) goes through the producer: quota check first, the
//! execution row second, the broker publish last. A refused quota creates
//! no execution row.

use crate::error::QueueError;
use crate::job::{EnqueueOptions, JobPayload};
use crate::queue::JobQueue;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use tideflow_core::{ExecutionId, UserId, WorkflowId, WorkspaceId};
use tideflow_engine::{ExecutionStore, ResumeRequest, StoreError, WorkflowStore};
use tideflow_guard::{QuotaError, QuotaGuard};
use tideflow_workflow::{Execution, NodeId, TriggerType};

/// A request to start an execution.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub workspace_id: WorkspaceId,
    pub workflow_id: WorkflowId,
    pub trigger_type: TriggerType,
    pub input: JsonValue,
    pub triggered_by: Option<UserId>,
    pub idempotency_key: Option<String>,
    pub priority: Option<u8>,
}

impl EnqueueRequest {
    /// A plain request with no idempotency key.
    #[must_use]
    pub fn new(
        workspace_id: WorkspaceId,
        workflow_id: WorkflowId,
        trigger_type: TriggerType,
        input: JsonValue,
    ) -> Self {
        Self {
            workspace_id,
            workflow_id,
            trigger_type,
            input,
            triggered_by: None,
            idempotency_key: None,
            priority: None,
        }
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// The result of a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// The created execution.
    pub execution_id: ExecutionId,
    /// The broker task id.
    pub task_id: String,
}

/// Errors from the enqueue path.
#[derive(Debug, Clone, PartialEq)]
pub enum ProduceError {
    /// The workspace quota refused the enqueue; no execution was created.
    Quota(QuotaError),
    /// Broker failure.
    Queue(QueueError),
    /// Storage failure.
    Store(StoreError),
}

impl fmt::Display for ProduceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quota(e) => write!(f, "quota refused enqueue: {e}"),
            Self::Queue(e) => write!(f, "enqueue failed: {e}"),
            Self::Store(e) => write!(f, "enqueue storage failure: {e}"),
        }
    }
}

impl std::error::Error for ProduceError {}

impl From<QuotaError> for ProduceError {
    fn from(e: QuotaError) -> Self {
        Self::Quota(e)
    }
}

impl From<QueueError> for ProduceError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<StoreError> for ProduceError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Creates execution rows and publishes their jobs.
pub struct ExecutionProducer {
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<dyn JobQueue>,
    quota: Option<Arc<QuotaGuard>>,
}

impl ExecutionProducer {
    /// Creates a producer.
    #[must_use]
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<dyn JobQueue>,
        quota: Option<Arc<QuotaGuard>>,
    ) -> Self {
        Self {
            workflows,
            executions,
            queue,
            quota,
        }
    }

    /// Starts a new execution: quota check, execution row, publish.
    ///
    /// # Errors
    ///
    /// [`ProduceError::Quota`] refuses before any state is written.
    pub async fn submit(&self, request: EnqueueRequest) -> Result<SubmitReceipt, ProduceError> {
        if let Some(quota) = &self.quota {
            quota.check_enqueue(request.workspace_id).await?;
        }

        // Snapshot the latest definition version at enqueue time.
        let definition = self.workflows.get(request.workflow_id, None).await?;

        let mut execution = Execution::new(
            definition.id,
            definition.version,
            request.workspace_id,
            request.trigger_type,
            request.input,
        );
        if let Some(user) = request.triggered_by {
            execution = execution.triggered_by(user);
        }
        self.executions.create(execution.clone()).await?;

        let job = JobPayload::execute(&execution);
        let task_id = self
            .queue
            .enqueue(
                &job,
                EnqueueOptions {
                    idempotency_key: request.idempotency_key,
                    priority: request.priority,
                },
            )
            .await?;

        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            trigger = ?execution.trigger_type,
            "execution enqueued"
        );
        Ok(SubmitReceipt {
            execution_id: execution.id,
            task_id,
        })
    }

    /// Publishes a resume job for a claimed wait.
    ///
    /// # Errors
    ///
    /// Returns storage and broker failures.
    pub async fn submit_resume(&self, request: ResumeRequest) -> Result<String, ProduceError> {
        let execution = self.executions.get(request.execution_id).await?;
        let job = JobPayload::resume(&execution, &request);
        Ok(self.queue.enqueue(&job, EnqueueOptions::default()).await?)
    }

    /// Publishes a continue-from job for an already-created (seeded)
    /// execution, e.g. a partial replay.
    ///
    /// # Errors
    ///
    /// Returns storage and broker failures.
    pub async fn submit_continuation(
        &self,
        execution_id: ExecutionId,
        node_id: NodeId,
    ) -> Result<String, ProduceError> {
        let execution = self.executions.get(execution_id).await?;
        let job = JobPayload::continue_from(&execution, node_id);
        Ok(self.queue.enqueue(&job, EnqueueOptions::default()).await?)
    }

    /// Publishes an execute job for an already-created execution row
    /// (retry, full replay).
    ///
    /// # Errors
    ///
    /// Returns broker failures.
    pub async fn submit_existing(&self, execution: &Execution) -> Result<String, ProduceError> {
        let job = JobPayload::execute(execution);
        Ok(self.queue.enqueue(&job, EnqueueOptions::default()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJobQueue;
    use serde_json::json;
    use tideflow_engine::{InMemoryExecutionStore, InMemoryWorkflowStore};
    use tideflow_guard::{InMemoryUsage, PlanLimits};
    use tideflow_workflow::WorkflowDefinition;

    struct Fixture {
        producer: ExecutionProducer,
        queue: InMemoryJobQueue,
        executions: Arc<InMemoryExecutionStore>,
        workflow: WorkflowDefinition,
        usage: Arc<InMemoryUsage>,
    }

    fn fixture(limits: PlanLimits) -> Fixture {
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let executions = Arc::new(InMemoryExecutionStore::new());
        let queue = InMemoryJobQueue::new();
        let usage = Arc::new(InMemoryUsage::new());
        let quota = Arc::new(QuotaGuard::new(usage.clone(), limits));

        let workflow = WorkflowDefinition::new(WorkspaceId::new(), "Test");

        let producer = ExecutionProducer::new(
            workflows.clone(),
            executions.clone(),
            Arc::new(queue.clone()),
            Some(quota),
        );

        Fixture {
            producer,
            queue,
            executions,
            workflow,
            usage,
        }
    }

    #[tokio::test]
    async fn submit_creates_execution_and_job() {
        let fixture = fixture(PlanLimits::unlimited());
        fixture
            .producer
            .workflows
            .put(fixture.workflow.clone())
            .await
            .unwrap();

        let receipt = fixture
            .producer
            .submit(EnqueueRequest::new(
                fixture.workflow.workspace_id,
                fixture.workflow.id,
                TriggerType::Api,
                json!({"x": 1}),
            ))
            .await
            .unwrap();

        let execution = fixture.executions.get(receipt.execution_id).await.unwrap();
        assert_eq!(
            execution.status,
            tideflow_workflow::ExecutionStatus::Queued
        );
        assert_eq!(execution.workflow_version, fixture.workflow.version);
        assert_eq!(fixture.queue.depth(), 1);
    }

    #[tokio::test]
    async fn quota_refusal_creates_no_execution() {
        let fixture = fixture(PlanLimits {
            max_executions_per_month: Some(0),
            max_concurrent: None,
        });
        fixture
            .producer
            .workflows
            .put(fixture.workflow.clone())
            .await
            .unwrap();
        // Exhaust the (zero) monthly quota marker.
        fixture.usage.record_start(fixture.workflow.workspace_id);

        let err = fixture
            .producer
            .submit(EnqueueRequest::new(
                fixture.workflow.workspace_id,
                fixture.workflow.id,
                TriggerType::Api,
                json!({}),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, ProduceError::Quota(_)));
        assert_eq!(fixture.queue.depth(), 0);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_original_task() {
        let fixture = fixture(PlanLimits::unlimited());
        fixture
            .producer
            .workflows
            .put(fixture.workflow.clone())
            .await
            .unwrap();

        let request = EnqueueRequest::new(
            fixture.workflow.workspace_id,
            fixture.workflow.id,
            TriggerType::Schedule,
            json!({}),
        )
        .with_idempotency_key("schedule:s1:2026-03-01T12:05:00Z");

        let first = fixture.producer.submit(request.clone()).await.unwrap();
        let second = fixture.producer.submit(request).await.unwrap();

        assert_eq!(first.task_id, second.task_id);
        // Only one job made it onto the queue.
        assert_eq!(fixture.queue.depth(), 1);
    }

    #[tokio::test]
    async fn unknown_workflow_is_a_store_error() {
        let fixture = fixture(PlanLimits::unlimited());
        let err = fixture
            .producer
            .submit(EnqueueRequest::new(
                fixture.workflow.workspace_id,
                WorkflowId::new(),
                TriggerType::Api,
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::Store(_)));
    }
}
