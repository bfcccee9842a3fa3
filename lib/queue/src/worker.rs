//! The worker pool.
//!
//! Each worker leases one job at a time, registers the execution with the
//! cancellation manager, runs the engine in a spawned task (panic
//! isolation), extends the lease while running, and acks or nacks by
//! outcome. Permanent failures and recovered panics mark the execution
//! failed and ack so poisoned jobs never loop.

use crate::error::QueueError;
use crate::job::{JobKind, JobPayload};
use crate::queue::{JobSource, LeasedJob};
use std::sync::Arc;
use std::time::Duration;
use tideflow_engine::{Engine, EngineError, ResumeRequest, RunOutcome};
use tideflow_workflow::{ExecutionFailure, ExecutionStatus};
use tokio_util::sync::CancellationToken;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrent workers (default: CPU count).
    pub concurrency: usize,
    /// Broker delivery attempts before a transient failure becomes
    /// permanent.
    pub max_attempts: u32,
    /// Lease extension period; a fraction of the visibility timeout.
    pub extend_every: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism().map_or(4, std::num::NonZero::get),
            max_attempts: 3,
            extend_every: Duration::from_secs(60),
        }
    }
}

/// Leases jobs and runs the engine on each.
pub struct WorkerPool {
    engine: Arc<Engine>,
    source: Arc<dyn JobSource>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Creates a pool.
    #[must_use]
    pub fn new(engine: Arc<Engine>, source: Arc<dyn JobSource>, config: WorkerPoolConfig) -> Self {
        Self {
            engine,
            source,
            config,
        }
    }

    /// Runs the pool until `shutdown` fires; in-flight jobs drain.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut workers = tokio::task::JoinSet::new();
        for worker_index in 0..self.config.concurrency.max(1) {
            let engine = Arc::clone(&self.engine);
            let source = Arc::clone(&self.source);
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                worker_loop(worker_index, engine, source, config, shutdown).await;
            });
        }
        while workers.join_next().await.is_some() {}
    }

    /// Processes a single job; exposed for tests.
    pub async fn process_one(&self, job: Box<dyn LeasedJob>) -> Result<(), QueueError> {
        process_job(&self.engine, &self.config, job).await
    }
}

async fn worker_loop(
    worker_index: usize,
    engine: Arc<Engine>,
    source: Arc<dyn JobSource>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
) {
    tracing::info!(worker_index, "worker started");
    loop {
        let job = tokio::select! {
            () = shutdown.cancelled() => break,
            job = source.next() => job,
        };

        match job {
            Ok(Some(job)) => {
                if let Err(e) = process_job(&engine, &config, job).await {
                    tracing::warn!(worker_index, error = %e, "job processing failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker_index, error = %e, "job lease failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    tracing::info!(worker_index, "worker stopped");
}

async fn process_job(
    engine: &Arc<Engine>,
    config: &WorkerPoolConfig,
    job: Box<dyn LeasedJob>,
) -> Result<(), QueueError> {
    let payload = job.payload().clone();
    let attempt = job.attempt();
    let execution_id = payload.execution_id;

    let cancellations = engine.cancellations();
    let token = cancellations.register(execution_id);

    // Run the engine in its own task so a panic is contained.
    let run_engine = Arc::clone(engine);
    let run_token = token.clone();
    let mut run_task = tokio::spawn(async move {
        run_job(run_engine, payload, run_token).await
    });

    // Extend the lease while the execution runs.
    let mut extend_timer = tokio::time::interval(config.extend_every);
    extend_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    extend_timer.tick().await; // The first tick fires immediately.

    let joined = loop {
        tokio::select! {
            joined = &mut run_task => break joined,
            _ = extend_timer.tick() => {
                if let Err(e) = job.extend().await {
                    tracing::debug!(execution_id = %execution_id, error = %e, "lease extension failed");
                }
            }
        }
    };

    cancellations.unregister(execution_id);

    match joined {
        Ok(Ok(outcome)) => {
            tracing::info!(execution_id = %execution_id, outcome = ?outcome_name(&outcome), "job finished");
            job.ack().await
        }
        Ok(Err(error)) => {
            if is_transient(&error) && attempt < config.max_attempts {
                tracing::warn!(
                    execution_id = %execution_id,
                    attempt,
                    error = %error,
                    "transient job failure; nacking for redelivery"
                );
                job.nack().await
            } else {
                tracing::error!(execution_id = %execution_id, error = %error, "permanent job failure");
                let _ = engine
                    .executions()
                    .finish(
                        execution_id,
                        ExecutionStatus::Failed,
                        Some(ExecutionFailure {
                            message: error.to_string(),
                            node_id: None,
                        }),
                    )
                    .await;
                job.ack().await
            }
        }
        Err(join_error) => {
            // A panic in the engine never poisons the queue.
            tracing::error!(execution_id = %execution_id, error = %join_error, "engine task panicked");
            let _ = engine
                .executions()
                .finish(
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(ExecutionFailure {
                        message: format!("worker panic: {join_error}"),
                        node_id: None,
                    }),
                )
                .await;
            job.ack().await
        }
    }
}

async fn run_job(
    engine: Arc<Engine>,
    payload: JobPayload,
    token: CancellationToken,
) -> Result<RunOutcome, EngineError> {
    match payload.kind {
        JobKind::Execute => engine.run(payload.execution_id, token).await,
        JobKind::Resume => {
            let Some(resume) = payload.resume else {
                return engine.run(payload.execution_id, token).await;
            };
            match resume.payload {
                Some(resume_payload) => {
                    engine
                        .resume(
                            ResumeRequest {
                                execution_id: payload.execution_id,
                                node_id: resume.node_id,
                                payload: resume_payload,
                            },
                            token,
                        )
                        .await
                }
                None => {
                    engine
                        .continue_run(payload.execution_id, resume.node_id, token)
                        .await
                }
            }
        }
    }
}

fn is_transient(error: &EngineError) -> bool {
    matches!(
        error,
        EngineError::Store(tideflow_engine::StoreError::Backend { .. })
    )
}

fn outcome_name(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Completed { .. } => "completed",
        RunOutcome::Failed { .. } => "failed",
        RunOutcome::Cancelled { .. } => "cancelled",
        RunOutcome::TimedOut => "timed_out",
        RunOutcome::Suspended { .. } => "suspended",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EnqueueOptions;
    use crate::memory::InMemoryJobQueue;
    use crate::queue::JobQueue;
    use serde_json::json;
    use tideflow_engine::{
        CancellationManager, EngineDeps, ExecutionStore, InMemoryExecutionStore,
        InMemoryNodeRunStore, InMemoryProgressStore, InMemoryWaitStore, InMemoryWorkflowStore,
        NodeRegistry, WaitManager, WorkflowStore,
    };
    use tideflow_guard::{BreakerManager, InMemoryCredentials};
    use tideflow_workflow::{
        Connection, Execution, NodeSpec, TriggerType, WorkflowDefinition,
    };
    use tideflow_core::WorkspaceId;

    struct Harness {
        engine: Arc<Engine>,
        queue: InMemoryJobQueue,
        executions: Arc<InMemoryExecutionStore>,
        workflows: Arc<InMemoryWorkflowStore>,
    }

    fn harness() -> Harness {
        let executions = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let credentials = Arc::new(InMemoryCredentials::new());
        let engine = Arc::new(Engine::new(EngineDeps {
            registry: Arc::new(NodeRegistry::builtin(
                credentials.clone(),
                Arc::new(BreakerManager::default()),
            )),
            workflows: workflows.clone(),
            executions: executions.clone(),
            node_runs: Arc::new(InMemoryNodeRunStore::new()),
            progress: Arc::new(InMemoryProgressStore::default()),
            wait_manager: Arc::new(WaitManager::new(Arc::new(InMemoryWaitStore::new()))),
            cancellations: Arc::new(CancellationManager::new()),
            credentials,
            env: serde_json::Map::new(),
        }));

        Harness {
            engine,
            queue: InMemoryJobQueue::new(),
            executions,
            workflows,
        }
    }

    fn linear_definition() -> WorkflowDefinition {
        WorkflowDefinition::new(WorkspaceId::new(), "Linear")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("a", "action.set", "A").with_parameter("fields", json!({"a": 1})),
            )
            .with_connection(Connection::main("c1", "t", "a"))
    }

    async fn enqueue(harness: &Harness, definition: &WorkflowDefinition) -> Execution {
        harness.workflows.put(definition.clone()).await.unwrap();
        let execution = Execution::new(
            definition.id,
            definition.version,
            definition.workspace_id,
            TriggerType::Manual,
            json!({}),
        );
        harness.executions.create(execution.clone()).await.unwrap();
        harness
            .queue
            .enqueue(&JobPayload::execute(&execution), EnqueueOptions::default())
            .await
            .unwrap();
        execution
    }

    #[tokio::test]
    async fn worker_runs_job_to_completion_and_acks() {
        let harness = harness();
        let definition = linear_definition();
        let execution = enqueue(&harness, &definition).await;

        let pool = WorkerPool::new(
            Arc::clone(&harness.engine),
            Arc::new(harness.queue.clone()),
            WorkerPoolConfig {
                concurrency: 1,
                ..Default::default()
            },
        );

        let job = harness.queue.next().await.unwrap().expect("job");
        pool.process_one(job).await.unwrap();

        let stored = harness.executions.get(execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(harness.queue.depth(), 0);
    }

    #[tokio::test]
    async fn worker_refuses_job_cancelled_before_run() {
        let harness = harness();
        let definition = linear_definition();
        let execution = enqueue(&harness, &definition).await;

        // Cancel lands before any worker leases the job.
        harness
            .executions
            .finish(execution.id, ExecutionStatus::Cancelled, None)
            .await
            .unwrap();

        let pool = WorkerPool::new(
            Arc::clone(&harness.engine),
            Arc::new(harness.queue.clone()),
            WorkerPoolConfig::default(),
        );
        let job = harness.queue.next().await.unwrap().expect("job");
        pool.process_one(job).await.unwrap();

        let stored = harness.executions.get(execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_execution_fails_permanently_without_poison_loop() {
        let harness = harness();
        let definition = linear_definition();
        harness.workflows.put(definition.clone()).await.unwrap();

        // A job whose execution row never existed.
        let ghost = Execution::new(
            definition.id,
            definition.version,
            definition.workspace_id,
            TriggerType::Manual,
            json!({}),
        );
        harness
            .queue
            .enqueue(&JobPayload::execute(&ghost), EnqueueOptions::default())
            .await
            .unwrap();

        let pool = WorkerPool::new(
            Arc::clone(&harness.engine),
            Arc::new(harness.queue.clone()),
            WorkerPoolConfig::default(),
        );
        let job = harness.queue.next().await.unwrap().expect("job");
        pool.process_one(job).await.unwrap();

        // Acked (not redelivered), despite the failure.
        assert_eq!(harness.queue.depth(), 0);
    }

    #[tokio::test]
    async fn pool_drains_queue_until_shutdown() {
        let harness = harness();
        let definition = linear_definition();
        let execution = enqueue(&harness, &definition).await;

        let pool = WorkerPool::new(
            Arc::clone(&harness.engine),
            Arc::new(harness.queue.clone()),
            WorkerPoolConfig {
                concurrency: 2,
                ..Default::default()
            },
        );

        let shutdown = CancellationToken::new();
        let pool_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        // Wait for the job to be processed.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stored = harness.executions.get(execution.id).await.unwrap();
            if stored.status == ExecutionStatus::Completed {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        pool_task.await.unwrap();
    }
}
