//! The engine facade.
//!
//! Single entry point over the registry, stores, scheduler, cancellation
//! and wait managers: validate, run, resume, preview, cancel, retry and
//! replay. Transport layers (HTTP handlers, queue workers) call these
//! methods; none of them know about the broker or the database layout.

use crate::cancel::{CancelBus, CancelNotice, CancellationManager};
use crate::error::EngineError;
use crate::progress::{ProgressSnapshot, ProgressStore};
use crate::registry::NodeRegistry;
use crate::scheduler::{ExecutionRunner, RunOutcome, RunnerDeps};
use crate::store::{ExecutionStore, NodeRunStore, StoreError, WorkflowStore};
use crate::wait::{ResumeRequest, WaitManager};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tideflow_core::{ExecutionId, UserId};
use tideflow_guard::CredentialResolver;
use tideflow_core::NodeExecutionId;
use tideflow_workflow::{
    Execution, ExecutionFailure, ExecutionStatus, NodeCatalog, NodeExecution, NodeId, TriggerType,
    ValidationReport, WorkflowDefinition, WorkflowGraph, validate_workflow,
};
use tokio_util::sync::CancellationToken;

/// Everything the engine owns.
pub struct EngineDeps {
    pub registry: Arc<NodeRegistry>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub node_runs: Arc<dyn NodeRunStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub wait_manager: Arc<WaitManager>,
    pub cancellations: Arc<CancellationManager>,
    pub credentials: Arc<dyn CredentialResolver>,
    /// Workspace environment variables exposed to expressions.
    pub env: JsonMap<String, JsonValue>,
}

/// One planned node in a preview.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedNode {
    pub node_id: NodeId,
    pub node_type: String,
    /// The input the node would receive, predicted from sample outputs.
    pub predicted_input: JsonValue,
}

/// The result of a dry run: planned order and predicted inputs, no side
/// effects.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewReport {
    pub execution_order: Vec<NodeId>,
    pub nodes: Vec<PlannedNode>,
}

/// The workflow execution engine.
pub struct Engine {
    deps: EngineDeps,
}

impl Engine {
    /// Creates an engine over its dependencies.
    #[must_use]
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    /// The cancellation manager, for worker registration.
    #[must_use]
    pub fn cancellations(&self) -> Arc<CancellationManager> {
        Arc::clone(&self.deps.cancellations)
    }

    /// The wait manager, for resume endpoints and the timeout sweeper.
    #[must_use]
    pub fn wait_manager(&self) -> Arc<WaitManager> {
        Arc::clone(&self.deps.wait_manager)
    }

    /// The execution store.
    #[must_use]
    pub fn executions(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.deps.executions)
    }

    /// The workflow store.
    #[must_use]
    pub fn workflows(&self) -> Arc<dyn WorkflowStore> {
        Arc::clone(&self.deps.workflows)
    }

    /// Validates a definition against the registry.
    #[must_use]
    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        validate_workflow(definition, self.deps.registry.as_ref())
    }

    fn runner_deps(&self) -> RunnerDeps {
        RunnerDeps {
            registry: Arc::clone(&self.deps.registry),
            executions: Arc::clone(&self.deps.executions),
            node_runs: Arc::clone(&self.deps.node_runs),
            progress: Arc::clone(&self.deps.progress),
            wait_manager: Arc::clone(&self.deps.wait_manager),
            credentials: Arc::clone(&self.deps.credentials),
            env: self.deps.env.clone(),
        }
    }

    async fn load_for_run(
        &self,
        execution_id: ExecutionId,
    ) -> Result<(Execution, WorkflowDefinition), EngineError> {
        let execution = match self.deps.executions.get(execution_id).await {
            Ok(execution) => execution,
            Err(StoreError::NotFound { .. }) => {
                return Err(EngineError::ExecutionNotFound { id: execution_id });
            }
            Err(e) => return Err(e.into()),
        };
        // The version recorded on the execution, never latest.
        let definition = self
            .deps
            .workflows
            .get(execution.workflow_id, Some(execution.workflow_version))
            .await?;
        Ok((execution, definition))
    }

    /// Runs a queued execution to its outcome.
    ///
    /// Validation failures fail the execution before any node executes.
    /// A cancel that landed before any worker leased the job is honored
    /// here: the queued→running transition refuses and the stored outcome
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns store failures and not-found conditions; node failures are
    /// a `RunOutcome`, not an error.
    pub async fn run(
        &self,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let (_, definition) = self.load_for_run(execution_id).await?;

        let report = self.validate(&definition);
        if !report.is_valid() {
            let failure = ExecutionFailure {
                message: format!(
                    "workflow validation failed: {}",
                    report
                        .errors()
                        .map(|i| i.message.clone())
                        .collect::<Vec<_>>()
                        .join("; ")
                ),
                node_id: report.errors().find_map(|i| i.node_id.clone()),
            };
            self.deps
                .executions
                .finish(execution_id, ExecutionStatus::Failed, Some(failure.clone()))
                .await?;
            return Ok(RunOutcome::Failed { failure });
        }

        if !self.deps.executions.try_start(execution_id).await? {
            return self.stored_outcome(execution_id).await;
        }
        let execution = self.deps.executions.get(execution_id).await?;

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %execution.workflow_id,
            trigger = ?execution.trigger_type,
            "execution started"
        );
        let runner = ExecutionRunner::new(self.runner_deps(), definition, execution, cancel);
        Ok(runner.run().await?)
    }

    /// Continues a waiting execution with its resume payload.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyTerminal` when the execution finished in the
    /// meantime.
    pub async fn resume(
        &self,
        request: ResumeRequest,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let (execution, definition) = self.load_for_run(request.execution_id).await?;

        if !self.deps.executions.try_resume(request.execution_id).await? {
            if execution.status.is_terminal() {
                return Err(EngineError::AlreadyTerminal {
                    id: request.execution_id,
                    status: execution.status,
                });
            }
            return self.stored_outcome(request.execution_id).await;
        }
        let execution = self.deps.executions.get(request.execution_id).await?;

        let runner = ExecutionRunner::new(self.runner_deps(), definition, execution, cancel);
        Ok(runner.resume(request).await?)
    }

    /// Runs a replayed execution that was seeded with ancestor node
    /// outputs, continuing from `node_id`.
    ///
    /// # Errors
    ///
    /// Returns store failures and not-found conditions.
    pub async fn continue_run(
        &self,
        execution_id: ExecutionId,
        node_id: NodeId,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let (_, definition) = self.load_for_run(execution_id).await?;

        if !self.deps.executions.try_start(execution_id).await? {
            return self.stored_outcome(execution_id).await;
        }
        let execution = self.deps.executions.get(execution_id).await?;

        let runner = ExecutionRunner::new(self.runner_deps(), definition, execution, cancel);
        Ok(runner.continue_from(node_id).await?)
    }

    async fn stored_outcome(&self, execution_id: ExecutionId) -> Result<RunOutcome, EngineError> {
        let stored = self.deps.executions.get(execution_id).await?;
        match stored.status {
            ExecutionStatus::Cancelled => Ok(RunOutcome::Cancelled {
                reason: stored
                    .error
                    .map_or_else(|| "Cancelled by user".to_string(), |e| e.message),
            }),
            ExecutionStatus::Completed => Ok(RunOutcome::Completed {
                output: JsonValue::Null,
            }),
            ExecutionStatus::Failed => Ok(RunOutcome::Failed {
                failure: stored.error.unwrap_or(ExecutionFailure {
                    message: "execution failed".to_string(),
                    node_id: None,
                }),
            }),
            ExecutionStatus::TimedOut => Ok(RunOutcome::TimedOut),
            status => Err(EngineError::Store(StoreError::Conflict {
                reason: format!("execution {execution_id} is {status:?} on another worker"),
            })),
        }
    }

    /// Cancels an execution cluster-wide.
    ///
    /// Idempotent: cancelling an already-cancelled execution succeeds.
    /// Cancelling another terminal state is a conflict.
    ///
    /// # Errors
    ///
    /// `AlreadyTerminal` for completed/failed/timed-out executions.
    pub async fn cancel(
        &self,
        execution_id: ExecutionId,
        reason: impl Into<String>,
        requested_by: Option<UserId>,
        bus: &dyn CancelBus,
    ) -> Result<(), EngineError> {
        let execution = match self.deps.executions.get(execution_id).await {
            Ok(execution) => execution,
            Err(StoreError::NotFound { .. }) => {
                return Err(EngineError::ExecutionNotFound { id: execution_id });
            }
            Err(e) => return Err(e.into()),
        };

        match execution.status {
            ExecutionStatus::Cancelled => return Ok(()),
            status if status.is_terminal() => {
                return Err(EngineError::AlreadyTerminal {
                    id: execution_id,
                    status,
                });
            }
            _ => {}
        }

        let reason = reason.into();
        // Persist the intent first; a job not yet leased is refused at
        // the queued→running check.
        self.deps
            .executions
            .finish(
                execution_id,
                ExecutionStatus::Cancelled,
                Some(ExecutionFailure {
                    message: reason.clone(),
                    node_id: None,
                }),
            )
            .await?;
        self.deps.wait_manager.cancel_for(execution_id).await?;

        let mut notice = CancelNotice::new(execution_id, reason);
        notice.requested_by = requested_by;
        if let Err(e) = bus.publish(&notice).await {
            // The persisted status still stops unleased jobs; in-flight
            // workers miss the fast path only.
            tracing::warn!(execution_id = %execution_id, error = %e, "cancel publish failed");
        }

        tracing::info!(execution_id = %execution_id, "execution cancelled");
        Ok(())
    }

    /// Creates a fresh execution retrying a failed, timed-out or
    /// cancelled one. The caller enqueues it.
    ///
    /// # Errors
    ///
    /// `NotRetryable` unless the source status allows a retry.
    pub async fn retry(&self, execution_id: ExecutionId) -> Result<Execution, EngineError> {
        let source = match self.deps.executions.get(execution_id).await {
            Ok(execution) => execution,
            Err(StoreError::NotFound { .. }) => {
                return Err(EngineError::ExecutionNotFound { id: execution_id });
            }
            Err(e) => return Err(e.into()),
        };

        if !matches!(
            source.status,
            ExecutionStatus::Failed | ExecutionStatus::TimedOut | ExecutionStatus::Cancelled
        ) {
            return Err(EngineError::NotRetryable {
                id: execution_id,
                status: source.status,
            });
        }

        let execution = Execution::new(
            source.workflow_id,
            source.workflow_version,
            source.workspace_id,
            TriggerType::Retry,
            source.input.clone(),
        );
        self.deps.executions.create(execution.clone()).await?;
        Ok(execution)
    }

    /// Creates a replay execution. With `from_node`, node executions of
    /// every ancestor of that node are copied from the original so only
    /// the node and its descendants run fresh; the caller enqueues a
    /// continue-from job. Without it, the whole workflow re-runs with the
    /// original input.
    ///
    /// # Errors
    ///
    /// Returns store failures and not-found conditions.
    pub async fn replay(
        &self,
        execution_id: ExecutionId,
        from_node: Option<NodeId>,
    ) -> Result<Execution, EngineError> {
        let source = match self.deps.executions.get(execution_id).await {
            Ok(execution) => execution,
            Err(StoreError::NotFound { .. }) => {
                return Err(EngineError::ExecutionNotFound { id: execution_id });
            }
            Err(e) => return Err(e.into()),
        };

        let execution = Execution::new(
            source.workflow_id,
            source.workflow_version,
            source.workspace_id,
            TriggerType::Replay,
            source.input.clone(),
        );
        self.deps.executions.create(execution.clone()).await?;

        if let Some(from_node) = from_node {
            let definition = self
                .deps
                .workflows
                .get(source.workflow_id, Some(source.workflow_version))
                .await?;
            let graph = WorkflowGraph::build(&definition.nodes, &definition.connections);
            let replaced: HashSet<NodeId> = graph.reachable_from(std::slice::from_ref(&from_node));

            let source_runs = self.deps.node_runs.list(execution_id).await?;
            for run in source_runs {
                if run.iteration.is_some() || replaced.contains(&run.node_id) {
                    continue;
                }
                let seeded = NodeExecution {
                    id: NodeExecutionId::new(),
                    execution_id: execution.id,
                    ..run
                };
                self.deps.node_runs.record(seeded).await?;
            }
        }

        Ok(execution)
    }

    /// A dry run: validation, planned order and predicted inputs with
    /// declared sample outputs. Side-effecting nodes are not invoked.
    ///
    /// # Errors
    ///
    /// `Invalid` when the definition fails validation.
    pub fn preview(
        &self,
        definition: &WorkflowDefinition,
        input: &JsonValue,
    ) -> Result<PreviewReport, EngineError> {
        let report = self.validate(definition);
        if !report.is_valid() {
            return Err(EngineError::Invalid {
                issues: report.issues,
            });
        }
        let order = report.execution_order.unwrap_or_default();

        let graph = WorkflowGraph::build(&definition.nodes, &definition.connections);
        let mut sample_outputs: HashMap<NodeId, JsonValue> = HashMap::new();
        let mut nodes = Vec::with_capacity(order.len());

        for node_id in &order {
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            let meta = self.deps.registry.get(&node.node_type);
            let is_trigger = meta
                .as_ref()
                .is_some_and(|m| m.category.is_trigger());

            let mut upstream: Vec<&NodeId> = Vec::new();
            for conn in graph.inbound(node_id) {
                if !upstream.contains(&&conn.source_node_id) {
                    upstream.push(&conn.source_node_id);
                }
            }
            let predicted_input = if is_trigger {
                input.clone()
            } else {
                match upstream.len() {
                    0 => JsonValue::Null,
                    1 => sample_outputs
                        .get(upstream[0])
                        .cloned()
                        .unwrap_or(JsonValue::Null),
                    _ => {
                        let mut merged = JsonMap::new();
                        for source in upstream {
                            merged.insert(
                                source.as_str().to_string(),
                                sample_outputs.get(source).cloned().unwrap_or(JsonValue::Null),
                            );
                        }
                        JsonValue::Object(merged)
                    }
                }
            };

            let output = if is_trigger {
                predicted_input.clone()
            } else {
                meta.and_then(|m| m.sample_output).unwrap_or(JsonValue::Null)
            };
            sample_outputs.insert(node_id.clone(), output);

            nodes.push(PlannedNode {
                node_id: node_id.clone(),
                node_type: node.node_type.clone(),
                predicted_input,
            });
        }

        Ok(PreviewReport {
            execution_order: order,
            nodes,
        })
    }

    /// The live progress of an execution: cache hit, or derived from the
    /// execution row on a miss.
    ///
    /// # Errors
    ///
    /// `ExecutionNotFound` when neither exists.
    pub async fn progress(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ProgressSnapshot, EngineError> {
        if let Some(snapshot) = self.deps.progress.fetch(execution_id).await {
            return Ok(snapshot);
        }
        match self.deps.executions.get(execution_id).await {
            Ok(execution) => Ok(ProgressSnapshot::from_execution(&execution)),
            Err(StoreError::NotFound { .. }) => {
                Err(EngineError::ExecutionNotFound { id: execution_id })
            }
            Err(e) => Err(e.into()),
        }
    }
}
