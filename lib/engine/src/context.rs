//! Execution context handed to node handlers.

use crate::error::NodeError;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tideflow_core::{ExecutionId, WorkflowId, WorkspaceId};
use tideflow_guard::CredentialResolver;
use tideflow_workflow::{NodeId, Scope};
use tokio_util::sync::CancellationToken;

/// The innermost loop frame a node runs under.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    /// The current item (or batch, when batch_size > 1).
    pub item: JsonValue,
    /// Zero-based iteration index.
    pub index: u64,
}

/// Everything a node implementation may touch during one invocation.
///
/// Parameters arrive resolved, except expression-kind parameters which
/// stay raw so handlers can evaluate them against [`NodeContext::scope`].
pub struct NodeContext {
    /// The execution this invocation belongs to.
    pub execution_id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// The owning workspace.
    pub workspace_id: WorkspaceId,
    /// The node being invoked.
    pub node_id: NodeId,
    /// The node's type string.
    pub node_type: String,
    /// Resolved input envelope (upstream output, or merged fan-in object).
    pub input: JsonValue,
    /// Resolved parameters.
    pub params: JsonMap<String, JsonValue>,
    /// Execution input data (`$input`).
    pub execution_input: JsonValue,
    /// Accumulated upstream outputs (`$node["id"].json`).
    pub outputs: HashMap<NodeId, JsonValue>,
    /// Workspace environment variables (`$env`).
    pub env: JsonMap<String, JsonValue>,
    /// Workflow variables (`$vars`).
    pub vars: JsonMap<String, JsonValue>,
    /// Innermost loop frame, when running inside a loop body.
    pub loop_frame: Option<LoopFrame>,
    /// Cancellation signal for this execution.
    pub cancel: CancellationToken,
    /// Credential resolution seam; values never enter `params` or `input`.
    pub credentials: Arc<dyn CredentialResolver>,
    /// True in preview mode; side-effecting nodes must not execute.
    pub preview: bool,
}

impl NodeContext {
    /// Builds the expression scope for this invocation.
    #[must_use]
    pub fn scope(&self) -> Scope<'_> {
        let mut scope = Scope::new()
            .with_input(&self.execution_input)
            .with_current(&self.input)
            .with_outputs(&self.outputs)
            .with_env(&self.env)
            .with_vars(&self.vars);
        if let Some(frame) = &self.loop_frame {
            scope = scope.with_loop(&frame.item, frame.index);
        }
        scope
    }

    /// Returns a parameter value.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&JsonValue> {
        self.params.get(name)
    }

    /// Returns a string parameter, or a resolution error if absent or not
    /// a string.
    pub fn require_str(&self, name: &str) -> Result<&str, NodeError> {
        self.param(name)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| NodeError::param(format!("missing required parameter '{name}'")))
    }

    /// Returns a string parameter, if present.
    #[must_use]
    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(JsonValue::as_str)
    }

    /// Returns an unsigned integer parameter, if present.
    #[must_use]
    pub fn u64_param(&self, name: &str) -> Option<u64> {
        self.param(name).and_then(JsonValue::as_u64)
    }
}
