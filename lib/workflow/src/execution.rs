//! Execution records.
//!
//! An `Execution` is one invocation of a workflow with a specific input;
//! it owns its `NodeExecution` rows (one per node invocation, or one per
//! loop iteration). Both carry explicit lifecycle methods so status and
//! timestamps always move together.

use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tideflow_core::{ExecutionId, NodeExecutionId, UserId, WorkflowId, WorkspaceId};

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Schedule,
    Api,
    Retry,
    Replay,
}

/// The lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Enqueued, waiting for a worker.
    Queued,
    /// A worker is running the graph.
    Running,
    /// Durably suspended at a wait node; not terminal.
    Waiting,
    /// All nodes completed or were skipped.
    Completed,
    /// A node failure ended the run.
    Failed,
    /// Cancelled by a user or the system.
    Cancelled,
    /// The execution-level deadline elapsed.
    TimedOut,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// The failure recorded on a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Redacted failure message.
    pub message: String,
    /// The node the failure originated from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// A record of a single workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier for this execution.
    pub id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// The definition version snapshotted at enqueue time.
    pub workflow_version: u32,
    /// The owning workspace.
    pub workspace_id: WorkspaceId,
    /// What started this execution.
    pub trigger_type: TriggerType,
    /// Input data the execution was started with.
    pub input: JsonValue,
    /// Current lifecycle state.
    pub status: ExecutionStatus,
    /// Number of nodes the schedule planned.
    pub nodes_total: u32,
    /// Number of nodes finished so far.
    pub nodes_completed: u32,
    /// Failure details, if the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    /// When the execution was enqueued.
    pub queued_at: DateTime<Utc>,
    /// When a worker started it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// The user who started it, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<UserId>,
}

impl Execution {
    /// Creates a new queued execution.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        workflow_version: u32,
        workspace_id: WorkspaceId,
        trigger_type: TriggerType,
        input: JsonValue,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            workflow_version,
            workspace_id,
            trigger_type,
            input,
            status: ExecutionStatus::Queued,
            nodes_total: 0,
            nodes_completed: 0,
            error: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            triggered_by: None,
        }
    }

    /// Sets the triggering user.
    #[must_use]
    pub fn triggered_by(mut self, user: UserId) -> Self {
        self.triggered_by = Some(user);
        self
    }

    /// Transitions queued → running.
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transitions running → waiting (durable suspension).
    pub fn suspend(&mut self) {
        self.status = ExecutionStatus::Waiting;
    }

    /// Transitions waiting → running on resume.
    pub fn resume(&mut self) {
        self.status = ExecutionStatus::Running;
    }

    /// Marks the execution as completed.
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Marks the execution as failed.
    pub fn fail(&mut self, failure: ExecutionFailure) {
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(failure);
    }

    /// Marks the execution as cancelled.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.status = ExecutionStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.error = Some(ExecutionFailure {
            message: reason.into(),
            node_id: None,
        });
    }

    /// Marks the execution as timed out.
    pub fn time_out(&mut self) {
        self.status = ExecutionStatus::TimedOut;
        self.completed_at = Some(Utc::now());
        self.error = Some(ExecutionFailure {
            message: "execution timeout".to_string(),
            node_id: None,
        });
    }

    /// Returns the run duration, if the execution has started.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}

/// The lifecycle state of one node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    /// Waiting for upstream dependencies.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed (after exhausting retries, if any).
    Failed,
    /// Skipped because an untaken branch pruned it.
    Skipped,
    /// Suspended awaiting an external resume.
    Waiting,
    /// Cancelled mid-flight.
    Cancelled,
}

impl NodeRunStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

/// Execution record for a single node invocation within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Unique identifier for this node execution.
    pub id: NodeExecutionId,
    /// The execution this record belongs to.
    pub execution_id: ExecutionId,
    /// The node being executed.
    pub node_id: NodeId,
    /// The node's type string, denormalized for reporting.
    pub node_type: String,
    /// Current state.
    pub status: NodeRunStatus,
    /// Resolved input data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
    /// Output data produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    /// Redacted error message, if failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Attempt number, starting at 1; bumped on retry.
    pub attempt: u32,
    /// Monotonic dispatch sequence within the execution.
    pub sequence: u64,
    /// Loop iteration index, when invoked inside a loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl NodeExecution {
    /// Creates a new pending node execution.
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        node_id: NodeId,
        node_type: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            id: NodeExecutionId::new(),
            execution_id,
            node_id,
            node_type: node_type.into(),
            status: NodeRunStatus::Pending,
            input: None,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            attempt: 1,
            sequence,
            iteration: None,
        }
    }

    /// Tags this record with a loop iteration index.
    #[must_use]
    pub fn for_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Starts execution of this node.
    pub fn start(&mut self, input: JsonValue) {
        self.status = NodeRunStatus::Running;
        self.started_at = Some(Utc::now());
        self.input = Some(input);
    }

    /// Bumps the attempt counter for a retry.
    pub fn bump_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Marks the node as succeeded.
    pub fn succeed(&mut self, output: JsonValue) {
        self.status = NodeRunStatus::Succeeded;
        self.finish();
        self.output = Some(output);
    }

    /// Marks the node as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = NodeRunStatus::Failed;
        self.finish();
        self.error = Some(error.into());
    }

    /// Marks the node as skipped.
    pub fn skip(&mut self) {
        self.status = NodeRunStatus::Skipped;
        self.finish();
    }

    /// Marks the node as cancelled.
    pub fn cancel(&mut self) {
        self.status = NodeRunStatus::Cancelled;
        self.finish();
        self.error = Some("Cancelled by user".to_string());
    }

    /// Marks the node as waiting for an external resume.
    pub fn suspend(&mut self) {
        self.status = NodeRunStatus::Waiting;
    }

    /// Completes a previously waiting node with the resume payload.
    pub fn resume_with(&mut self, payload: JsonValue) {
        self.status = NodeRunStatus::Succeeded;
        self.finish();
        self.output = Some(payload);
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution() -> Execution {
        Execution::new(
            WorkflowId::new(),
            1,
            WorkspaceId::new(),
            TriggerType::Manual,
            json!({}),
        )
    }

    #[test]
    fn execution_status_terminality() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
    }

    #[test]
    fn execution_lifecycle() {
        let mut exec = execution();
        assert_eq!(exec.status, ExecutionStatus::Queued);
        assert!(exec.started_at.is_none());

        exec.start();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.started_at.is_some());

        exec.complete();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.completed_at.is_some());
        assert!(exec.duration().is_some());
    }

    #[test]
    fn execution_wait_and_resume() {
        let mut exec = execution();
        exec.start();
        exec.suspend();
        assert_eq!(exec.status, ExecutionStatus::Waiting);
        assert!(!exec.status.is_terminal());

        exec.resume();
        assert_eq!(exec.status, ExecutionStatus::Running);
    }

    #[test]
    fn execution_failure_records_node() {
        let mut exec = execution();
        exec.start();
        exec.fail(ExecutionFailure {
            message: "boom".to_string(),
            node_id: Some(NodeId::new("http-1")),
        });

        assert_eq!(exec.status, ExecutionStatus::Failed);
        let failure = exec.error.expect("failure recorded");
        assert_eq!(failure.node_id, Some(NodeId::new("http-1")));
    }

    #[test]
    fn cancellation_records_reason() {
        let mut exec = execution();
        exec.start();
        exec.cancel("Cancelled by user");
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert_eq!(exec.error.unwrap().message, "Cancelled by user");
    }

    #[test]
    fn node_execution_lifecycle() {
        let mut node_run = NodeExecution::new(ExecutionId::new(), NodeId::new("a"), "action.set", 1);
        assert_eq!(node_run.status, NodeRunStatus::Pending);

        node_run.start(json!({"in": 1}));
        assert_eq!(node_run.status, NodeRunStatus::Running);

        node_run.succeed(json!({"out": 2}));
        assert_eq!(node_run.status, NodeRunStatus::Succeeded);
        assert_eq!(node_run.output, Some(json!({"out": 2})));
        assert!(node_run.duration_ms.is_some());
    }

    #[test]
    fn node_execution_wait_then_resume() {
        let mut node_run = NodeExecution::new(ExecutionId::new(), NodeId::new("w"), "logic.wait", 2);
        node_run.start(json!({}));
        node_run.suspend();
        assert_eq!(node_run.status, NodeRunStatus::Waiting);
        assert!(!node_run.status.is_terminal());

        node_run.resume_with(json!({"payload": 42}));
        assert_eq!(node_run.status, NodeRunStatus::Succeeded);
        assert_eq!(node_run.output, Some(json!({"payload": 42})));
    }

    #[test]
    fn iteration_tag_and_attempts() {
        let mut node_run = NodeExecution::new(ExecutionId::new(), NodeId::new("l"), "action.set", 3)
            .for_iteration(4);
        assert_eq!(node_run.iteration, Some(4));
        assert_eq!(node_run.attempt, 1);

        node_run.bump_attempt();
        assert_eq!(node_run.attempt, 2);
    }

    #[test]
    fn execution_serde_roundtrip() {
        let exec = execution();
        let json = serde_json::to_string(&exec).expect("serialize");
        let parsed: Execution = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(exec, parsed);
    }
}
