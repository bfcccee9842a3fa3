//! Job payloads carried by the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tideflow_core::{ExecutionId, UserId, WorkflowId, WorkspaceId};
use tideflow_engine::ResumeRequest;
use tideflow_workflow::{Execution, NodeId, TriggerType};

/// The kind of work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Run an execution from its trigger.
    #[serde(rename = "workflow.execute")]
    Execute,
    /// Continue a suspended or seeded execution.
    #[serde(rename = "workflow.resume")]
    Resume,
}

/// How a resume job continues the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeDetails {
    /// The node to continue from.
    pub node_id: NodeId,
    /// The wait node's resume payload. `None` means a partial-replay
    /// continuation: the node runs fresh instead of absorbing a payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

/// The queue job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Job kind.
    pub kind: JobKind,
    /// The execution to run.
    pub execution_id: ExecutionId,
    /// The workflow, pinned to the version recorded on the execution.
    pub workflow_id: WorkflowId,
    /// The owning workspace.
    pub workspace_id: WorkspaceId,
    /// The definition version to load.
    pub workflow_version: u32,
    /// What started the execution.
    pub trigger_type: TriggerType,
    /// Input data.
    pub input: JsonValue,
    /// The user who started it, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<UserId>,
    /// Producer-side attempt counter.
    pub attempt: u32,
    /// Resume details for `workflow.resume` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeDetails>,
}

impl JobPayload {
    /// A job that runs an execution from its trigger.
    #[must_use]
    pub fn execute(execution: &Execution) -> Self {
        Self {
            kind: JobKind::Execute,
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            workspace_id: execution.workspace_id,
            workflow_version: execution.workflow_version,
            trigger_type: execution.trigger_type,
            input: execution.input.clone(),
            triggered_by: execution.triggered_by,
            attempt: 1,
            resume: None,
        }
    }

    /// A job that continues a waiting execution with a resume payload.
    #[must_use]
    pub fn resume(execution: &Execution, request: &ResumeRequest) -> Self {
        Self {
            kind: JobKind::Resume,
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            workspace_id: execution.workspace_id,
            workflow_version: execution.workflow_version,
            trigger_type: execution.trigger_type,
            input: execution.input.clone(),
            triggered_by: execution.triggered_by,
            attempt: 1,
            resume: Some(ResumeDetails {
                node_id: request.node_id.clone(),
                payload: Some(request.payload.clone()),
            }),
        }
    }

    /// A job that continues a seeded replay from a node.
    #[must_use]
    pub fn continue_from(execution: &Execution, node_id: NodeId) -> Self {
        Self {
            kind: JobKind::Resume,
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            workspace_id: execution.workspace_id,
            workflow_version: execution.workflow_version,
            trigger_type: execution.trigger_type,
            input: execution.input.clone(),
            triggered_by: execution.triggered_by,
            attempt: 1,
            resume: Some(ResumeDetails {
                node_id,
                payload: None,
            }),
        }
    }
}

/// Producer options for one enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Coalesces duplicate enqueues within the broker's dedup window.
    pub idempotency_key: Option<String>,
    /// Optional priority hint.
    pub priority: Option<u8>,
}

impl EnqueueOptions {
    /// Options with an idempotency key.
    #[must_use]
    pub fn idempotent(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            priority: None,
        }
    }
}
