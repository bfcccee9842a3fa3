//! Branch-aware topological dispatch of one execution.
//!
//! The runner keeps a ready queue of node dispatches. A finished node
//! decides every one of its outbound connections: connections on the
//! produced handle are satisfied, the rest are skip-marked. A target
//! dispatches once all of its inbound connections are decided and at
//! least one is satisfied; a target whose inbound are all skip-marked is
//! skipped itself and propagates the mark. The queue draining with
//! nothing in flight means the execution completed.
//!
//! Loop nodes are scheduler-managed: the subgraph behind their `loop`
//! handle runs once per batch as a nested sub-schedule, and the array of
//! per-iteration outputs is emitted once on `done`.

use crate::context::{LoopFrame, NodeContext};
use crate::error::{ErrorKind, NodeError};
use crate::progress::{ProgressSnapshot, ProgressStore};
use crate::registry::{NodeOutcome, NodeRegistry};
use crate::runtime::{self, RetryPolicy};
use crate::store::{ExecutionStore, NodeRunStore, StoreError};
use crate::wait::{ResumeRequest, WaitManager, WaitingExecution};
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tideflow_guard::CredentialResolver;
use tideflow_workflow::expression::{self, Scope};
use tideflow_workflow::{
    Connection, Execution, ExecutionFailure, ExecutionStatus, Handle, NodeCatalog, NodeExecution,
    NodeId, TriggerType, WorkflowDefinition, WorkflowGraph,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every reachable node completed or was skipped.
    Completed { output: JsonValue },
    /// A node failure ended the run under the stop policy.
    Failed { failure: ExecutionFailure },
    /// The execution was cancelled.
    Cancelled { reason: String },
    /// The execution-level deadline elapsed.
    TimedOut,
    /// The execution suspended at a wait node.
    Suspended { waiting: WaitingExecution },
}

/// Shared dependencies the runner needs.
#[derive(Clone)]
pub struct RunnerDeps {
    pub registry: Arc<NodeRegistry>,
    pub executions: Arc<dyn ExecutionStore>,
    pub node_runs: Arc<dyn NodeRunStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub wait_manager: Arc<WaitManager>,
    pub credentials: Arc<dyn CredentialResolver>,
    /// Workspace environment variables exposed as `$env`.
    pub env: JsonMap<String, JsonValue>,
}

/// Runs one execution of one workflow definition.
pub struct ExecutionRunner {
    deps: RunnerDeps,
    definition: WorkflowDefinition,
    graph: WorkflowGraph,
    execution: Execution,
    cancel: CancellationToken,
    deadline: Option<tokio::time::Instant>,
    sequence: u64,
}

#[derive(Debug)]
struct Dispatch {
    node_id: NodeId,
    input: JsonValue,
}

#[derive(Debug, Default)]
struct FlowState {
    outputs: HashMap<NodeId, JsonValue>,
    satisfied: HashMap<NodeId, HashSet<String>>,
    skipped_in: HashMap<NodeId, HashSet<String>>,
    scheduled: HashSet<NodeId>,
}

#[derive(Debug)]
enum DriveEnd {
    Drained,
    Failed(ExecutionFailure),
    Cancelled,
    TimedOut,
    Suspended(WaitingExecution),
}

enum Prepared {
    Spawn {
        node_run: NodeExecution,
        ctx: NodeContext,
        handler: Arc<dyn crate::registry::NodeHandler>,
        policy: RetryPolicy,
    },
    Immediate {
        node_run: NodeExecution,
        error: NodeError,
    },
}

enum Flow {
    Continue,
    Halt(DriveEnd),
}

impl ExecutionRunner {
    /// Creates a runner for one execution.
    #[must_use]
    pub fn new(
        deps: RunnerDeps,
        definition: WorkflowDefinition,
        execution: Execution,
        cancel: CancellationToken,
    ) -> Self {
        let graph = WorkflowGraph::build(&definition.nodes, &definition.connections);
        let deadline = definition
            .settings
            .execution_timeout_secs
            .map(|secs| tokio::time::Instant::now() + std::time::Duration::from_secs(secs));
        Self {
            deps,
            definition,
            graph,
            execution,
            cancel,
            deadline,
            sequence: 0,
        }
    }

    /// Runs the execution from its trigger.
    ///
    /// # Errors
    ///
    /// Returns storage failures; node failures become a `RunOutcome`.
    pub async fn run(mut self) -> Result<RunOutcome, StoreError> {
        self.execution.nodes_total = self.graph.node_count() as u32;
        self.deps.executions.update(&self.execution).await?;

        let Some(trigger) = self.entry_trigger() else {
            let failure = ExecutionFailure {
                message: "workflow has no trigger node".to_string(),
                node_id: None,
            };
            return self.conclude(DriveEnd::Failed(failure), FlowState::default()).await;
        };

        let mut state = FlowState::default();
        state.scheduled.insert(trigger.clone());
        let mut queue = VecDeque::from([Dispatch {
            node_id: trigger,
            input: self.execution.input.clone(),
        }]);

        let end = self.drive(&mut queue, &mut state, None, None, None).await?;
        self.conclude(end, state).await
    }

    /// Continues a waiting execution with a resume payload.
    ///
    /// The output map is rebuilt from persisted node executions; the
    /// waiting node's output becomes the payload and scheduling continues
    /// from its downstream neighbours.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn resume(mut self, request: ResumeRequest) -> Result<RunOutcome, StoreError> {
        let (mut state, runs) = self.rebuild_state().await?;

        let mut waiting_run = runs
            .into_iter()
            .find(|run| {
                run.node_id == request.node_id
                    && run.status == tideflow_workflow::NodeRunStatus::Waiting
            })
            .unwrap_or_else(|| {
                self.sequence += 1;
                NodeExecution::new(
                    self.execution.id,
                    request.node_id.clone(),
                    "logic.wait",
                    self.sequence,
                )
            });

        waiting_run.resume_with(request.payload.clone());
        self.deps.node_runs.record(waiting_run.clone()).await?;
        state
            .outputs
            .insert(request.node_id.clone(), request.payload.clone());
        state.scheduled.insert(request.node_id.clone());
        self.execution.nodes_completed += 1;
        self.record_progress(Some(&request.node_id)).await;

        let mut queue = VecDeque::new();
        self.route(
            &request.node_id,
            &Handle::main(),
            &mut state,
            &mut queue,
            None,
            None,
        )
        .await?;

        let end = self.drive(&mut queue, &mut state, None, None, None).await?;
        self.conclude(end, state).await
    }

    /// Continues from a specific node, with upstream outputs seeded from
    /// persisted node executions (partial replay).
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn continue_from(mut self, node_id: NodeId) -> Result<RunOutcome, StoreError> {
        let (mut state, _) = self.rebuild_state().await?;
        self.execution.nodes_total = self.graph.node_count() as u32;

        state.scheduled.insert(node_id.clone());
        let input = self.assemble_input(&node_id, &state);
        let mut queue = VecDeque::from([Dispatch {
            node_id,
            input,
        }]);

        let end = self.drive(&mut queue, &mut state, None, None, None).await?;
        self.conclude(end, state).await
    }

    async fn rebuild_state(&mut self) -> Result<(FlowState, Vec<NodeExecution>), StoreError> {
        let runs = self.deps.node_runs.list(self.execution.id).await?;
        self.sequence = runs.iter().map(|r| r.sequence).max().unwrap_or(0);
        self.execution.nodes_completed = runs
            .iter()
            .filter(|r| r.iteration.is_none() && r.status.is_terminal())
            .count() as u32;

        let mut state = FlowState::default();
        for run in &runs {
            if run.iteration.is_some() {
                continue;
            }
            match run.status {
                tideflow_workflow::NodeRunStatus::Succeeded => {
                    state.scheduled.insert(run.node_id.clone());
                    state
                        .outputs
                        .insert(run.node_id.clone(), run.output.clone().unwrap_or(JsonValue::Null));
                    for conn in self.graph.outbound(&run.node_id, None) {
                        state
                            .satisfied
                            .entry(conn.target_node_id.clone())
                            .or_default()
                            .insert(conn.id.clone());
                    }
                }
                tideflow_workflow::NodeRunStatus::Skipped => {
                    state.scheduled.insert(run.node_id.clone());
                    for conn in self.graph.outbound(&run.node_id, None) {
                        state
                            .skipped_in
                            .entry(conn.target_node_id.clone())
                            .or_default()
                            .insert(conn.id.clone());
                    }
                }
                tideflow_workflow::NodeRunStatus::Waiting => {
                    state.scheduled.insert(run.node_id.clone());
                }
                _ => {
                    state.scheduled.insert(run.node_id.clone());
                }
            }
        }
        Ok((state, runs))
    }

    /// The trigger matching the execution's trigger type; smallest id
    /// wins ties, first trigger is the fallback.
    fn entry_trigger(&self) -> Option<NodeId> {
        let mut triggers: Vec<&tideflow_workflow::NodeSpec> = self
            .definition
            .nodes
            .iter()
            .filter(|n| {
                self.deps
                    .registry
                    .get(&n.node_type)
                    .is_some_and(|meta| meta.category.is_trigger())
            })
            .collect();
        triggers.sort_by(|a, b| a.id.cmp(&b.id));

        let expected = match self.execution.trigger_type {
            TriggerType::Webhook => "trigger.webhook",
            TriggerType::Schedule => "trigger.schedule",
            TriggerType::Manual | TriggerType::Api | TriggerType::Retry | TriggerType::Replay => {
                "trigger.manual"
            }
        };

        triggers
            .iter()
            .find(|n| n.node_type == expected)
            .or_else(|| triggers.first())
            .map(|n| n.id.clone())
    }

    fn drive<'a>(
        &'a mut self,
        queue: &'a mut VecDeque<Dispatch>,
        state: &'a mut FlowState,
        body: Option<Arc<HashSet<NodeId>>>,
        frame: Option<LoopFrame>,
        iteration: Option<u32>,
    ) -> BoxFuture<'a, Result<DriveEnd, StoreError>> {
        Box::pin(self.drive_inner(queue, state, body, frame, iteration))
    }

    async fn drive_inner(
        &mut self,
        queue: &mut VecDeque<Dispatch>,
        state: &mut FlowState,
        body: Option<Arc<HashSet<NodeId>>>,
        frame: Option<LoopFrame>,
        iteration: Option<u32>,
    ) -> Result<DriveEnd, StoreError> {
        let cap = if body.is_some() {
            // Loop bodies run their iterations strictly in order.
            1
        } else {
            self.definition.settings.concurrency.max(1)
        };
        let mut running: JoinSet<(NodeExecution, Result<NodeOutcome, NodeError>, u32)> =
            JoinSet::new();

        loop {
            while running.len() < cap {
                let Some(dispatch) = queue.pop_front() else {
                    break;
                };

                let Some(node) = self.graph.node(&dispatch.node_id).cloned() else {
                    continue;
                };

                if node.node_type == "logic.loop" {
                    match self
                        .run_loop_node(&node, dispatch, state, queue, body.clone(), frame.clone(), iteration)
                        .await?
                    {
                        Flow::Continue => {}
                        Flow::Halt(end) => {
                            running.abort_all();
                            return Ok(end);
                        }
                    }
                    continue;
                }

                match self.prepare(&node, dispatch, state, frame.clone(), iteration).await? {
                    Prepared::Spawn {
                        node_run,
                        ctx,
                        handler,
                        policy,
                    } => {
                        running.spawn(async move {
                            let (result, attempts) = runtime::invoke(handler, &ctx, policy).await;
                            (node_run, result, attempts)
                        });
                    }
                    Prepared::Immediate { node_run, error } => {
                        match self
                            .handle_failure(node_run, error, state, queue, body.clone())
                            .await?
                        {
                            Flow::Continue => {}
                            Flow::Halt(end) => {
                                running.abort_all();
                                return Ok(end);
                            }
                        }
                    }
                }
            }

            if running.is_empty() && queue.is_empty() {
                return Ok(DriveEnd::Drained);
            }

            let deadline = self.deadline;
            let joined = tokio::select! {
                () = self.cancel.cancelled() => {
                    running.shutdown().await;
                    return Ok(DriveEnd::Cancelled);
                }
                () = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    running.shutdown().await;
                    return Ok(DriveEnd::TimedOut);
                }
                joined = running.join_next() => joined,
            };

            let Some(joined) = joined else {
                continue;
            };
            let (mut node_run, result, attempts) = match joined {
                Ok(done) => done,
                Err(join_error) => {
                    running.shutdown().await;
                    return Ok(DriveEnd::Failed(ExecutionFailure {
                        message: format!("node task panicked: {join_error}"),
                        node_id: None,
                    }));
                }
            };
            node_run.attempt = attempts;

            match result {
                Ok(NodeOutcome::Advance { handle, output }) => {
                    self.complete_node(node_run, &handle, output, state, queue, body.clone())
                        .await?;
                }
                Ok(NodeOutcome::Suspend { timeout, metadata }) => {
                    if body.is_some() {
                        let error =
                            NodeError::runtime("wait nodes are not supported inside loop bodies");
                        match self
                            .handle_failure(node_run, error, state, queue, body.clone())
                            .await?
                        {
                            Flow::Continue => {}
                            Flow::Halt(end) => {
                                running.shutdown().await;
                                return Ok(end);
                            }
                        }
                        continue;
                    }

                    // Drain in-flight siblings before suspending.
                    while let Some(joined) = running.join_next().await {
                        if let Ok((sibling_run, sibling_result, sibling_attempts)) = joined {
                            let mut sibling_run = sibling_run;
                            sibling_run.attempt = sibling_attempts;
                            match sibling_result {
                                Ok(NodeOutcome::Advance { handle, output }) => {
                                    self.complete_node(
                                        sibling_run,
                                        &handle,
                                        output,
                                        state,
                                        queue,
                                        body.clone(),
                                    )
                                    .await?;
                                }
                                Ok(NodeOutcome::Suspend { .. }) | Err(_) => {
                                    let error = NodeError::runtime(
                                        "sibling finished while suspending; treated as failed",
                                    );
                                    let _ = self
                                        .handle_failure(
                                            sibling_run,
                                            error,
                                            state,
                                            queue,
                                            body.clone(),
                                        )
                                        .await?;
                                }
                            }
                        }
                    }

                    node_run.suspend();
                    self.deps.node_runs.record(node_run.clone()).await?;
                    let waiting = self
                        .deps
                        .wait_manager
                        .begin(self.execution.id, node_run.node_id.clone(), timeout, metadata)
                        .await?;
                    self.record_progress(Some(&node_run.node_id)).await;
                    return Ok(DriveEnd::Suspended(waiting));
                }
                Err(error) if error.kind == ErrorKind::Cancelled => {
                    node_run.cancel();
                    self.deps.node_runs.record(node_run).await?;
                    running.shutdown().await;
                    return Ok(DriveEnd::Cancelled);
                }
                Err(error) => {
                    match self
                        .handle_failure(node_run, error, state, queue, body.clone())
                        .await?
                    {
                        Flow::Continue => {}
                        Flow::Halt(end) => {
                            running.shutdown().await;
                            return Ok(end);
                        }
                    }
                }
            }
        }
    }

    async fn prepare(
        &mut self,
        node: &tideflow_workflow::NodeSpec,
        dispatch: Dispatch,
        state: &mut FlowState,
        frame: Option<LoopFrame>,
        iteration: Option<u32>,
    ) -> Result<Prepared, StoreError> {
        self.sequence += 1;
        let mut node_run = NodeExecution::new(
            self.execution.id,
            node.id.clone(),
            node.node_type.clone(),
            self.sequence,
        );
        if let Some(iteration) = iteration {
            node_run = node_run.for_iteration(iteration);
        }
        node_run.start(dispatch.input.clone());
        self.deps.node_runs.record(node_run.clone()).await?;
        self.record_progress(Some(&node.id)).await;

        let Some(meta) = self.deps.registry.get(&node.node_type) else {
            return Ok(Prepared::Immediate {
                node_run,
                error: NodeError::runtime(format!("unknown node type '{}'", node.node_type)),
            });
        };

        let params = {
            let mut scope = Scope::new()
                .with_input(&self.execution.input)
                .with_current(&dispatch.input)
                .with_outputs(&state.outputs)
                .with_env(&self.deps.env)
                .with_vars(&self.definition.variables);
            if let Some(frame) = &frame {
                scope = scope.with_loop(&frame.item, frame.index);
            }
            match runtime::resolve_params(&meta, &node.parameters, &scope) {
                Ok(params) => params,
                Err(error) => return Ok(Prepared::Immediate { node_run, error }),
            }
        };

        let Some(handler) = self.deps.registry.handler(&node.node_type) else {
            return Ok(Prepared::Immediate {
                node_run,
                error: NodeError::runtime(format!(
                    "node type '{}' is not executable",
                    node.node_type
                )),
            });
        };

        let ctx = NodeContext {
            execution_id: self.execution.id,
            workflow_id: self.execution.workflow_id,
            workspace_id: self.execution.workspace_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            input: dispatch.input,
            params,
            execution_input: self.execution.input.clone(),
            outputs: state.outputs.clone(),
            env: self.deps.env.clone(),
            vars: self.definition.variables.clone(),
            loop_frame: frame,
            cancel: self.cancel.child_token(),
            credentials: Arc::clone(&self.deps.credentials),
            preview: false,
        };
        let policy = RetryPolicy::for_node(&self.definition.settings, node);

        Ok(Prepared::Spawn {
            node_run,
            ctx,
            handler,
            policy,
        })
    }

    async fn complete_node(
        &mut self,
        mut node_run: NodeExecution,
        handle: &Handle,
        output: JsonValue,
        state: &mut FlowState,
        queue: &mut VecDeque<Dispatch>,
        body: Option<Arc<HashSet<NodeId>>>,
    ) -> Result<(), StoreError> {
        node_run.succeed(output.clone());
        let node_id = node_run.node_id.clone();
        let iteration = node_run.iteration;
        let top_level = iteration.is_none();
        self.deps.node_runs.record(node_run).await?;

        state.outputs.insert(node_id.clone(), output);
        if top_level {
            self.execution.nodes_completed += 1;
            self.deps.executions.update(&self.execution).await?;
        }
        self.record_progress(Some(&node_id)).await;

        self.route(&node_id, handle, state, queue, body, iteration)
            .await
    }

    async fn handle_failure(
        &mut self,
        mut node_run: NodeExecution,
        error: NodeError,
        state: &mut FlowState,
        queue: &mut VecDeque<Dispatch>,
        body: Option<Arc<HashSet<NodeId>>>,
    ) -> Result<Flow, StoreError> {
        let message = self.deps.credentials.redact(&error.message);
        let node_id = node_run.node_id.clone();
        let iteration = node_run.iteration;
        node_run.fail(message.clone());
        let top_level = iteration.is_none();
        self.deps.node_runs.record(node_run).await?;
        if top_level {
            self.execution.nodes_completed += 1;
            self.deps.executions.update(&self.execution).await?;
        }
        self.record_progress(Some(&node_id)).await;
        tracing::warn!(
            execution_id = %self.execution.id,
            node_id = %node_id,
            kind = %error.kind,
            "node failed"
        );

        match self.definition.settings.error_policy {
            tideflow_workflow::ErrorPolicy::Stop => Ok(Flow::Halt(DriveEnd::Failed(
                ExecutionFailure {
                    message,
                    node_id: Some(node_id),
                },
            ))),
            tideflow_workflow::ErrorPolicy::Continue => {
                // Downstream of the failed node is pruned like an untaken
                // branch.
                self.skip_downstream(&node_id, state, queue, body, iteration)
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Decides every outbound connection of a finished node and settles
    /// the touched targets.
    async fn route(
        &mut self,
        source: &NodeId,
        produced: &Handle,
        state: &mut FlowState,
        queue: &mut VecDeque<Dispatch>,
        body: Option<Arc<HashSet<NodeId>>>,
        iteration: Option<u32>,
    ) -> Result<(), StoreError> {
        let mut touched: Vec<NodeId> = Vec::new();
        for conn in self.outbound_in_scope(source, body.as_deref()) {
            let target = conn.target_node_id.clone();
            if &conn.source_handle == produced {
                state
                    .satisfied
                    .entry(target.clone())
                    .or_default()
                    .insert(conn.id.clone());
            } else {
                state
                    .skipped_in
                    .entry(target.clone())
                    .or_default()
                    .insert(conn.id.clone());
            }
            if !touched.contains(&target) {
                touched.push(target);
            }
        }

        self.settle(touched, state, queue, body, iteration).await
    }

    async fn skip_downstream(
        &mut self,
        source: &NodeId,
        state: &mut FlowState,
        queue: &mut VecDeque<Dispatch>,
        body: Option<Arc<HashSet<NodeId>>>,
        iteration: Option<u32>,
    ) -> Result<(), StoreError> {
        let mut touched: Vec<NodeId> = Vec::new();
        for conn in self.outbound_in_scope(source, body.as_deref()) {
            let target = conn.target_node_id.clone();
            state
                .skipped_in
                .entry(target.clone())
                .or_default()
                .insert(conn.id.clone());
            if !touched.contains(&target) {
                touched.push(target);
            }
        }
        self.settle(touched, state, queue, body, iteration).await
    }

    /// Settles targets whose inbound connections are now all decided:
    /// dispatches those with a live input, skips (and cascades) those
    /// whose inbound are all skip-marked.
    async fn settle(
        &mut self,
        targets: Vec<NodeId>,
        state: &mut FlowState,
        queue: &mut VecDeque<Dispatch>,
        body: Option<Arc<HashSet<NodeId>>>,
        iteration: Option<u32>,
    ) -> Result<(), StoreError> {
        let mut worklist = targets;

        while let Some(target) = worklist.pop() {
            if state.scheduled.contains(&target) {
                continue;
            }

            let inbound: Vec<Connection> = self
                .graph
                .inbound(&target)
                .into_iter()
                .cloned()
                .collect();
            let satisfied = state.satisfied.get(&target);
            let skipped = state.skipped_in.get(&target);
            let decided = inbound.iter().all(|conn| {
                satisfied.is_some_and(|s| s.contains(&conn.id))
                    || skipped.is_some_and(|s| s.contains(&conn.id))
            });
            if !decided {
                continue;
            }

            let any_live = satisfied.is_some_and(|s| !s.is_empty());
            state.scheduled.insert(target.clone());

            if any_live {
                let input = self.assemble_input(&target, state);
                queue.push_back(Dispatch {
                    node_id: target,
                    input,
                });
            } else {
                // Every inbound path was pruned; skip this node and
                // propagate the mark.
                let node_type = self
                    .graph
                    .node(&target)
                    .map_or_else(String::new, |n| n.node_type.clone());
                self.sequence += 1;
                let mut node_run = NodeExecution::new(
                    self.execution.id,
                    target.clone(),
                    node_type,
                    self.sequence,
                );
                if let Some(iteration) = iteration {
                    node_run = node_run.for_iteration(iteration);
                }
                node_run.skip();
                let top_level = node_run.iteration.is_none();
                self.deps.node_runs.record(node_run).await?;
                if top_level {
                    self.execution.nodes_completed += 1;
                    self.deps.executions.update(&self.execution).await?;
                }
                self.record_progress(Some(&target)).await;

                for conn in self.outbound_in_scope(&target, body.as_deref()) {
                    let next = conn.target_node_id.clone();
                    state
                        .skipped_in
                        .entry(next.clone())
                        .or_default()
                        .insert(conn.id.clone());
                    if !worklist.contains(&next) {
                        worklist.push(next);
                    }
                }
            }
        }

        Ok(())
    }

    fn outbound_in_scope(
        &self,
        source: &NodeId,
        body: Option<&HashSet<NodeId>>,
    ) -> Vec<Connection> {
        self.graph
            .outbound(source, None)
            .into_iter()
            .filter(|conn| body.is_none_or(|b| b.contains(&conn.target_node_id)))
            .cloned()
            .collect()
    }

    /// Assembles a target's input envelope from its satisfied inbound
    /// sources: a single upstream passes its output through, fan-in
    /// merges into an object keyed by source node id.
    fn assemble_input(&self, target: &NodeId, state: &FlowState) -> JsonValue {
        let satisfied = state.satisfied.get(target);
        let mut sources: Vec<NodeId> = Vec::new();
        for conn in self.graph.inbound(target) {
            if satisfied.is_some_and(|s| s.contains(&conn.id))
                && !sources.contains(&conn.source_node_id)
            {
                sources.push(conn.source_node_id.clone());
            }
        }

        match sources.len() {
            0 => JsonValue::Null,
            1 => state
                .outputs
                .get(&sources[0])
                .cloned()
                .unwrap_or(JsonValue::Null),
            _ => {
                let mut merged = JsonMap::new();
                for source in sources {
                    let output = state
                        .outputs
                        .get(&source)
                        .cloned()
                        .unwrap_or(JsonValue::Null);
                    merged.insert(source.as_str().to_string(), output);
                }
                JsonValue::Object(merged)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop_node(
        &mut self,
        node: &tideflow_workflow::NodeSpec,
        dispatch: Dispatch,
        state: &mut FlowState,
        queue: &mut VecDeque<Dispatch>,
        outer_body: Option<Arc<HashSet<NodeId>>>,
        outer_frame: Option<LoopFrame>,
        outer_iteration: Option<u32>,
    ) -> Result<Flow, StoreError> {
        self.sequence += 1;
        let mut node_run = NodeExecution::new(
            self.execution.id,
            node.id.clone(),
            node.node_type.clone(),
            self.sequence,
        );
        if let Some(iteration) = outer_iteration {
            node_run = node_run.for_iteration(iteration);
        }
        node_run.start(dispatch.input.clone());
        self.deps.node_runs.record(node_run.clone()).await?;
        self.record_progress(Some(&node.id)).await;

        // Resolve the items list against the loop node's own scope.
        let items = {
            let mut scope = Scope::new()
                .with_input(&self.execution.input)
                .with_current(&dispatch.input)
                .with_outputs(&state.outputs)
                .with_env(&self.deps.env)
                .with_vars(&self.definition.variables);
            if let Some(frame) = &outer_frame {
                scope = scope.with_loop(&frame.item, frame.index);
            }
            let raw = node.parameter("items").cloned().unwrap_or(JsonValue::Null);
            match expression::evaluate_value(&raw, &scope) {
                Ok(JsonValue::Array(items)) => items,
                Ok(other) => {
                    let error = NodeError::param(format!(
                        "loop parameter 'items' must resolve to an array, got {other}"
                    ));
                    return self
                        .handle_failure(node_run, error, state, queue, outer_body)
                        .await;
                }
                Err(e) => {
                    let error = NodeError::param(e.to_string());
                    return self
                        .handle_failure(node_run, error, state, queue, outer_body)
                        .await;
                }
            }
        };
        let batch_size = node
            .parameter("batch_size")
            .and_then(JsonValue::as_u64)
            .unwrap_or(1)
            .max(1) as usize;

        let body_roots: Vec<NodeId> = {
            let mut roots = Vec::new();
            for conn in self.graph.outbound(&node.id, Some(&Handle::new(Handle::LOOP))) {
                if !roots.contains(&conn.target_node_id) {
                    roots.push(conn.target_node_id.clone());
                }
            }
            roots
        };
        let body: Arc<HashSet<NodeId>> = Arc::new(self.graph.reachable_from(&body_roots));

        let mut iteration_outputs: Vec<JsonValue> = Vec::new();
        for (index, chunk) in items.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                node_run.cancel();
                self.deps.node_runs.record(node_run).await?;
                return Ok(Flow::Halt(DriveEnd::Cancelled));
            }

            let item = if batch_size == 1 {
                chunk[0].clone()
            } else {
                JsonValue::Array(chunk.to_vec())
            };
            let frame = LoopFrame {
                item: item.clone(),
                index: index as u64,
            };

            let mut sub_state = FlowState {
                outputs: state.outputs.clone(),
                ..FlowState::default()
            };
            let mut sub_queue = VecDeque::new();
            for root in &body_roots {
                sub_state.scheduled.insert(root.clone());
                sub_queue.push_back(Dispatch {
                    node_id: root.clone(),
                    input: item.clone(),
                });
            }

            let end = self
                .drive(
                    &mut sub_queue,
                    &mut sub_state,
                    Some(Arc::clone(&body)),
                    Some(frame),
                    Some(index as u32),
                )
                .await?;
            match end {
                DriveEnd::Drained => {
                    iteration_outputs.push(self.iteration_output(&body, &sub_state));
                }
                DriveEnd::Failed(failure) => {
                    let error = NodeError::runtime(format!(
                        "iteration {index} failed: {}",
                        failure.message
                    ));
                    return self
                        .handle_failure(node_run, error, state, queue, outer_body)
                        .await;
                }
                DriveEnd::Cancelled => {
                    node_run.cancel();
                    self.deps.node_runs.record(node_run).await?;
                    return Ok(Flow::Halt(DriveEnd::Cancelled));
                }
                DriveEnd::TimedOut => return Ok(Flow::Halt(DriveEnd::TimedOut)),
                DriveEnd::Suspended(_) => {
                    let error =
                        NodeError::runtime("wait nodes are not supported inside loop bodies");
                    return self
                        .handle_failure(node_run, error, state, queue, outer_body)
                        .await;
                }
            }
        }

        let aggregated = JsonValue::Array(iteration_outputs);
        node_run.succeed(aggregated.clone());
        let top_level = node_run.iteration.is_none();
        self.deps.node_runs.record(node_run).await?;
        state.outputs.insert(node.id.clone(), aggregated);
        if top_level {
            self.execution.nodes_completed += 1;
            self.deps.executions.update(&self.execution).await?;
        }
        self.record_progress(Some(&node.id)).await;

        // Body nodes ran inside the sub-schedules.
        state.scheduled.extend(body.iter().cloned());

        self.route(
            &node.id,
            &Handle::new(Handle::DONE),
            state,
            queue,
            outer_body,
            outer_iteration,
        )
        .await?;
        Ok(Flow::Continue)
    }

    /// One iteration's result: the merged outputs of the body's leaves.
    fn iteration_output(&self, body: &HashSet<NodeId>, sub_state: &FlowState) -> JsonValue {
        let mut leaves: Vec<NodeId> = body
            .iter()
            .filter(|node| {
                self.graph
                    .outbound(node, None)
                    .iter()
                    .all(|conn| !body.contains(&conn.target_node_id))
            })
            .cloned()
            .collect();
        leaves.sort();

        let present: Vec<&NodeId> = leaves
            .iter()
            .filter(|leaf| sub_state.outputs.contains_key(*leaf))
            .collect();
        match present.len() {
            0 => JsonValue::Null,
            1 => sub_state.outputs[present[0]].clone(),
            _ => {
                let mut merged = JsonMap::new();
                for leaf in present {
                    merged.insert(
                        leaf.as_str().to_string(),
                        sub_state.outputs[leaf].clone(),
                    );
                }
                JsonValue::Object(merged)
            }
        }
    }

    async fn record_progress(&self, current: Option<&NodeId>) {
        self.deps
            .progress
            .record(ProgressSnapshot {
                execution_id: self.execution.id,
                status: self.execution.status,
                current_node: current.cloned(),
                nodes_completed: self.execution.nodes_completed,
                nodes_total: self.execution.nodes_total,
                updated_at: Utc::now(),
            })
            .await;
    }

    async fn conclude(
        mut self,
        end: DriveEnd,
        state: FlowState,
    ) -> Result<RunOutcome, StoreError> {
        let outcome = match end {
            DriveEnd::Drained => {
                let output = self.final_output(&state);
                let finished = self
                    .deps
                    .executions
                    .finish(self.execution.id, ExecutionStatus::Completed, None)
                    .await?;
                if !finished {
                    return self.lost_terminal_race().await;
                }
                self.execution.complete();
                RunOutcome::Completed { output }
            }
            DriveEnd::Failed(failure) => {
                let finished = self
                    .deps
                    .executions
                    .finish(
                        self.execution.id,
                        ExecutionStatus::Failed,
                        Some(failure.clone()),
                    )
                    .await?;
                if !finished {
                    return self.lost_terminal_race().await;
                }
                self.execution.fail(failure.clone());
                RunOutcome::Failed { failure }
            }
            DriveEnd::Cancelled => {
                let reason = "Cancelled by user".to_string();
                self.deps.wait_manager.cancel_for(self.execution.id).await?;
                let _ = self
                    .deps
                    .executions
                    .finish(
                        self.execution.id,
                        ExecutionStatus::Cancelled,
                        Some(ExecutionFailure {
                            message: reason.clone(),
                            node_id: None,
                        }),
                    )
                    .await?;
                self.execution.cancel(reason.clone());
                RunOutcome::Cancelled { reason }
            }
            DriveEnd::TimedOut => {
                let finished = self
                    .deps
                    .executions
                    .finish(self.execution.id, ExecutionStatus::TimedOut, None)
                    .await?;
                if !finished {
                    return self.lost_terminal_race().await;
                }
                self.execution.time_out();
                RunOutcome::TimedOut
            }
            DriveEnd::Suspended(waiting) => {
                self.execution.suspend();
                self.deps.executions.update(&self.execution).await?;
                RunOutcome::Suspended { waiting }
            }
        };

        self.record_progress(None).await;
        tracing::info!(
            execution_id = %self.execution.id,
            status = ?self.execution.status,
            nodes_completed = self.execution.nodes_completed,
            "execution finished scheduling"
        );
        Ok(outcome)
    }

    /// Another path (a concurrent cancel) won the terminal transition;
    /// report what is actually stored.
    async fn lost_terminal_race(&self) -> Result<RunOutcome, StoreError> {
        let stored = self.deps.executions.get(self.execution.id).await?;
        Ok(match stored.status {
            ExecutionStatus::Cancelled => RunOutcome::Cancelled {
                reason: stored
                    .error
                    .map_or_else(|| "Cancelled by user".to_string(), |e| e.message),
            },
            ExecutionStatus::TimedOut => RunOutcome::TimedOut,
            ExecutionStatus::Failed => RunOutcome::Failed {
                failure: stored.error.unwrap_or(ExecutionFailure {
                    message: "execution failed".to_string(),
                    node_id: None,
                }),
            },
            _ => RunOutcome::Completed {
                output: JsonValue::Null,
            },
        })
    }

    /// The final output: merged leaf outputs (single leaf passes
    /// through).
    fn final_output(&self, state: &FlowState) -> JsonValue {
        let mut leaves: Vec<NodeId> = self
            .graph
            .leaf_nodes()
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| state.outputs.contains_key(id))
            .collect();
        leaves.sort();

        match leaves.len() {
            0 => JsonValue::Null,
            1 => state.outputs[&leaves[0]].clone(),
            _ => {
                let mut merged = JsonMap::new();
                for leaf in leaves {
                    merged.insert(leaf.as_str().to_string(), state.outputs[&leaf].clone());
                }
                JsonValue::Object(merged)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::InMemoryProgressStore;
    use crate::store::{InMemoryExecutionStore, InMemoryNodeRunStore};
    use crate::wait::InMemoryWaitStore;
    use serde_json::json;
    use tideflow_core::WorkspaceId;
    use tideflow_guard::{BreakerManager, InMemoryCredentials};
    use tideflow_workflow::{ErrorPolicy, NodeRunStatus, NodeSpec, WorkflowDefinition};

    struct Fixture {
        deps: RunnerDeps,
        executions: Arc<InMemoryExecutionStore>,
        node_runs: Arc<InMemoryNodeRunStore>,
    }

    fn fixture() -> Fixture {
        let executions = Arc::new(InMemoryExecutionStore::new());
        let node_runs = Arc::new(InMemoryNodeRunStore::new());
        let registry = Arc::new(NodeRegistry::builtin(
            Arc::new(InMemoryCredentials::new()),
            Arc::new(BreakerManager::default()),
        ));
        let deps = RunnerDeps {
            registry,
            executions: executions.clone(),
            node_runs: node_runs.clone(),
            progress: Arc::new(InMemoryProgressStore::default()),
            wait_manager: Arc::new(WaitManager::new(Arc::new(InMemoryWaitStore::new()))),
            credentials: Arc::new(InMemoryCredentials::new()),
            env: JsonMap::new(),
        };
        Fixture {
            deps,
            executions,
            node_runs,
        }
    }

    fn set_node(id: &str, fields: JsonValue) -> NodeSpec {
        NodeSpec::new(id, "action.set", id).with_parameter("fields", fields)
    }

    async fn start_execution(
        fixture: &Fixture,
        definition: &WorkflowDefinition,
        input: JsonValue,
    ) -> Execution {
        let mut execution = Execution::new(
            definition.id,
            definition.version,
            definition.workspace_id,
            TriggerType::Manual,
            input,
        );
        fixture.executions.create(execution.clone()).await.unwrap();
        fixture.executions.try_start(execution.id).await.unwrap();
        execution.start();
        execution
    }

    fn runner(
        fixture: &Fixture,
        definition: WorkflowDefinition,
        execution: Execution,
        cancel: CancellationToken,
    ) -> ExecutionRunner {
        ExecutionRunner::new(fixture.deps.clone(), definition, execution, cancel)
    }

    #[tokio::test]
    async fn linear_happy_path() {
        let fixture = fixture();
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "Linear")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(set_node("a", json!({"a": 1})))
            .with_node(set_node("b", json!({"b": 2})))
            .with_connection(Connection::main("c1", "t", "a"))
            .with_connection(Connection::main("c2", "a", "b"));

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        let RunOutcome::Completed { output } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output, json!({"a": 1, "b": 2}));

        let stored = fixture.executions.get(execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.nodes_total, 3);
        assert_eq!(stored.nodes_completed, 3);

        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.status == NodeRunStatus::Succeeded));
        let order: Vec<&str> = runs.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(order, vec!["t", "a", "b"]);
    }

    #[tokio::test]
    async fn conditional_skip_takes_false_branch() {
        let fixture = fixture();
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "Branch")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("cond", "logic.condition", "Big?")
                    .with_parameter("expression", json!("($json.x > 10)")),
            )
            .with_node(set_node("big", json!({"tag": "big"})))
            .with_node(set_node("small", json!({"tag": "small"})))
            .with_connection(Connection::main("c1", "t", "cond"))
            .with_connection(Connection::from_handle("c2", "cond", Handle::TRUE, "big"))
            .with_connection(Connection::from_handle("c3", "cond", Handle::FALSE, "small"));

        let execution = start_execution(&fixture, &definition, json!({"x": 3})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        let RunOutcome::Completed { .. } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };

        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        let by_node = |id: &str| runs.iter().find(|r| r.node_id.as_str() == id).unwrap();
        assert_eq!(by_node("big").status, NodeRunStatus::Skipped);
        assert_eq!(by_node("small").status, NodeRunStatus::Succeeded);
        assert_eq!(
            by_node("small").output.as_ref().unwrap()["tag"],
            json!("small")
        );
    }

    #[tokio::test]
    async fn fan_in_waits_for_both_branches_and_merges() {
        let fixture = fixture();
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "FanIn")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(set_node("left", json!({"left": true})))
            .with_node(set_node("right", json!({"right": true})))
            .with_node(set_node("join", json!({"joined": true})))
            .with_connection(Connection::main("c1", "t", "left"))
            .with_connection(Connection::main("c2", "t", "right"))
            .with_connection(Connection::main("c3", "left", "join"))
            .with_connection(Connection::main("c4", "right", "join"));

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        let join = runs.iter().find(|r| r.node_id.as_str() == "join").unwrap();
        // Join saw both upstream outputs keyed by node id.
        let input = join.input.as_ref().unwrap();
        assert!(input.get("left").is_some());
        assert!(input.get("right").is_some());
        // Join ran after both branches.
        let join_seq = join.sequence;
        for branch in ["left", "right"] {
            let seq = runs
                .iter()
                .find(|r| r.node_id.as_str() == branch)
                .unwrap()
                .sequence;
            assert!(seq < join_seq);
        }
    }

    #[tokio::test]
    async fn untaken_branch_satisfies_fan_in_without_contributing() {
        let fixture = fixture();
        // cond → big → join, cond → small → join; only one branch runs,
        // join still dispatches with the surviving input.
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "SkipFanIn")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("cond", "logic.condition", "Big?")
                    .with_parameter("expression", json!("($json.x > 10)")),
            )
            .with_node(set_node("big", json!({"tag": "big"})))
            .with_node(set_node("small", json!({"tag": "small"})))
            .with_node(set_node("join", json!({"done": true})))
            .with_connection(Connection::main("c1", "t", "cond"))
            .with_connection(Connection::from_handle("c2", "cond", Handle::TRUE, "big"))
            .with_connection(Connection::from_handle("c3", "cond", Handle::FALSE, "small"))
            .with_connection(Connection::main("c4", "big", "join"))
            .with_connection(Connection::main("c5", "small", "join"));

        let execution = start_execution(&fixture, &definition, json!({"x": 99})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        let RunOutcome::Completed { output } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["done"], json!(true));
        assert_eq!(output["tag"], json!("big"));

        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        let small = runs.iter().find(|r| r.node_id.as_str() == "small").unwrap();
        assert_eq!(small.status, NodeRunStatus::Skipped);
        let join = runs.iter().find(|r| r.node_id.as_str() == "join").unwrap();
        assert_eq!(join.status, NodeRunStatus::Succeeded);
    }

    #[tokio::test]
    async fn loop_node_aggregates_iteration_outputs_on_done() {
        let fixture = fixture();
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "Loop")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("loop", "logic.loop", "Each item")
                    .with_parameter("items", json!("{{ $json.items }}")),
            )
            .with_node(set_node("body", json!({"seen": true})))
            .with_node(set_node("after", json!({"finished": true})))
            .with_connection(Connection::main("c1", "t", "loop"))
            .with_connection(Connection::from_handle("c2", "loop", Handle::LOOP, "body"))
            .with_connection(Connection::from_handle("c3", "loop", Handle::DONE, "after"));

        let input = json!({"items": [{"id": 1}, {"id": 2}, {"id": 3}]});
        let execution = start_execution(&fixture, &definition, input).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        let body_runs: Vec<_> = runs
            .iter()
            .filter(|r| r.node_id.as_str() == "body")
            .collect();
        assert_eq!(body_runs.len(), 3);
        let iterations: Vec<u32> = body_runs.iter().filter_map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![0, 1, 2]);

        let loop_run = runs.iter().find(|r| r.node_id.as_str() == "loop").unwrap();
        let aggregated = loop_run.output.as_ref().unwrap().as_array().unwrap();
        assert_eq!(aggregated.len(), 3);
        assert_eq!(aggregated[0]["id"], json!(1));
        assert_eq!(aggregated[0]["seen"], json!(true));

        let after = runs.iter().find(|r| r.node_id.as_str() == "after").unwrap();
        assert_eq!(after.status, NodeRunStatus::Succeeded);
    }

    #[tokio::test]
    async fn loop_items_reference_current_item_and_index() {
        let fixture = fixture();
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "LoopRefs")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("loop", "logic.loop", "Each")
                    .with_parameter("items", json!("{{ $json.items }}")),
            )
            .with_node(
                NodeSpec::new("body", "action.set", "Tag").with_parameter(
                    "fields",
                    json!({"sku": "{{ $item.sku }}", "position": "{{ $index }}"}),
                ),
            )
            .with_connection(Connection::main("c1", "t", "loop"))
            .with_connection(Connection::from_handle("c2", "loop", Handle::LOOP, "body"));

        let input = json!({"items": [{"sku": "A"}, {"sku": "B"}]});
        let execution = start_execution(&fixture, &definition, input).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        let loop_run = runs.iter().find(|r| r.node_id.as_str() == "loop").unwrap();
        let aggregated = loop_run.output.as_ref().unwrap().as_array().unwrap();
        assert_eq!(aggregated[0]["sku"], json!("A"));
        assert_eq!(aggregated[0]["position"], json!(0));
        assert_eq!(aggregated[1]["sku"], json!("B"));
        assert_eq!(aggregated[1]["position"], json!(1));
    }

    #[tokio::test]
    async fn stop_policy_fails_execution_on_node_failure() {
        let fixture = fixture();
        // The condition references an unknown binding through a required
        // parameter: a hard resolution failure.
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "Failing")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("broken", "action.set", "Broken")
                    .with_parameter("fields", json!("not an object")),
            )
            .with_node(set_node("after", json!({"never": true})))
            .with_connection(Connection::main("c1", "t", "broken"))
            .with_connection(Connection::main("c2", "broken", "after"));

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        let RunOutcome::Failed { failure } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.node_id, Some(NodeId::new("broken")));

        let stored = fixture.executions.get(execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(
            stored.error.unwrap().node_id,
            Some(NodeId::new("broken"))
        );

        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        assert!(!runs.iter().any(|r| r.node_id.as_str() == "after"));
    }

    #[tokio::test]
    async fn continue_policy_skips_downstream_and_completes() {
        let fixture = fixture();
        let mut definition = WorkflowDefinition::new(WorkspaceId::new(), "Continue")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("broken", "action.set", "Broken")
                    .with_parameter("fields", json!("not an object")),
            )
            .with_node(set_node("after", json!({"never": true})))
            .with_node(set_node("side", json!({"side": true})))
            .with_connection(Connection::main("c1", "t", "broken"))
            .with_connection(Connection::main("c2", "broken", "after"))
            .with_connection(Connection::main("c3", "t", "side"));
        definition.settings.error_policy = ErrorPolicy::Continue;

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        let by_node = |id: &str| runs.iter().find(|r| r.node_id.as_str() == id).unwrap();
        assert_eq!(by_node("broken").status, NodeRunStatus::Failed);
        assert_eq!(by_node("after").status, NodeRunStatus::Skipped);
        assert_eq!(by_node("side").status, NodeRunStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancellation_mid_flight_marks_node_and_execution() {
        let fixture = fixture();
        // logic.wait would suspend; use a wait node replaced by an HTTP
        // call that hangs? Instead drive cancellation through a wait on
        // the cancel token itself: cancel before the second node runs.
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "Cancel")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(set_node("a", json!({"a": 1})))
            .with_connection(Connection::main("c1", "t", "a"));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, cancel)
            .run()
            .await
            .unwrap();

        let RunOutcome::Cancelled { reason } = outcome else {
            panic!("expected cancellation, got {outcome:?}");
        };
        assert_eq!(reason, "Cancelled by user");

        let stored = fixture.executions.get(execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn wait_node_suspends_execution_with_token() {
        let fixture = fixture();
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "Wait")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("w", "logic.wait", "Hold")
                    .with_parameter("timeout_seconds", json!(3600)),
            )
            .with_node(set_node("after", json!({"resumed": true})))
            .with_connection(Connection::main("c1", "t", "w"))
            .with_connection(Connection::main("c2", "w", "after"));

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition.clone(), execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        let RunOutcome::Suspended { waiting } = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        assert_eq!(waiting.execution_id, execution_id);
        assert_eq!(waiting.node_id, NodeId::new("w"));
        assert!(!waiting.token.is_empty());

        let stored = fixture.executions.get(execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Waiting);

        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        let wait_run = runs.iter().find(|r| r.node_id.as_str() == "w").unwrap();
        assert_eq!(wait_run.status, NodeRunStatus::Waiting);
        // The downstream node has not run.
        assert!(!runs.iter().any(|r| r.node_id.as_str() == "after"));
    }

    #[tokio::test]
    async fn resume_continues_downstream_of_wait_node() {
        let fixture = fixture();
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "WaitResume")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("w", "logic.wait", "Hold")
                    .with_parameter("timeout_seconds", json!(3600)),
            )
            .with_node(set_node("after", json!({"resumed": true})))
            .with_connection(Connection::main("c1", "t", "w"))
            .with_connection(Connection::main("c2", "w", "after"));

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let execution_id = execution.id;
        let outcome = runner(
            &fixture,
            definition.clone(),
            execution,
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();
        let RunOutcome::Suspended { .. } = outcome else {
            panic!("expected suspension");
        };

        // Resume as a worker picking up the resume job would.
        fixture.executions.try_resume(execution_id).await.unwrap();
        let mut resumed = fixture.executions.get(execution_id).await.unwrap();
        resumed.resume();

        let outcome = runner(&fixture, definition, resumed, CancellationToken::new())
            .resume(ResumeRequest {
                execution_id,
                node_id: NodeId::new("w"),
                payload: json!({"payload": 42}),
            })
            .await
            .unwrap();

        let RunOutcome::Completed { output } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(output["resumed"], json!(true));
        assert_eq!(output["payload"], json!(42));

        let runs = fixture.node_runs.list(execution_id).await.unwrap();
        let wait_run = runs.iter().find(|r| r.node_id.as_str() == "w").unwrap();
        assert_eq!(wait_run.status, NodeRunStatus::Succeeded);
        assert_eq!(wait_run.output, Some(json!({"payload": 42})));

        let stored = fixture.executions.get(execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn node_outputs_are_referencable_downstream() {
        let fixture = fixture();
        let definition = WorkflowDefinition::new(WorkspaceId::new(), "Refs")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(set_node("first", json!({"value": 7})))
            .with_node(
                NodeSpec::new("second", "action.set", "Copy").with_parameter(
                    "fields",
                    json!({"copied": "{{ $node[\"first\"].json.value }}"}),
                ),
            )
            .with_connection(Connection::main("c1", "t", "first"))
            .with_connection(Connection::main("c2", "first", "second"));

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        let RunOutcome::Completed { output } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output["copied"], json!(7));
    }

    #[tokio::test]
    async fn execution_timeout_ends_run_as_timed_out() {
        let fixture = fixture();
        let mut definition = WorkflowDefinition::new(WorkspaceId::new(), "Deadline")
            .with_node(NodeSpec::new("t", "trigger.manual", "Start"))
            .with_node(
                NodeSpec::new("w", "logic.wait", "Hold")
                    .with_parameter("timeout_seconds", json!(3600)),
            )
            .with_connection(Connection::main("c1", "t", "w"));
        definition.settings.execution_timeout_secs = Some(0);

        let execution = start_execution(&fixture, &definition, json!({})).await;
        let execution_id = execution.id;
        let outcome = runner(&fixture, definition, execution, CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            RunOutcome::TimedOut | RunOutcome::Suspended { .. }
        ));
        if matches!(outcome, RunOutcome::TimedOut) {
            let stored = fixture.executions.get(execution_id).await.unwrap();
            assert_eq!(stored.status, ExecutionStatus::TimedOut);
        }
    }
}
