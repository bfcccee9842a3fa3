//! Workflow definition types.
//!
//! A workflow definition is the persisted, versioned description of an
//! automation: its nodes, connections, settings and lifecycle status.
//! Definitions are immutable per version; saving bumps the version.

use crate::connection::Connection;
use crate::node::{NodeId, NodeSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tideflow_core::{WorkflowId, WorkspaceId};

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Editable, not yet runnable by triggers.
    Draft,
    /// Live; schedules and webhooks fire.
    Active,
    /// Parked; kept but not firing.
    Inactive,
    /// Retired; read-only history.
    Archived,
}

/// What the scheduler does when a node fails fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the whole execution.
    #[default]
    Stop,
    /// Skip downstream of the failed node and keep going.
    Continue,
}

/// Per-workflow execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Whole-execution timeout in seconds; `None` means no limit.
    #[serde(default, rename = "executionTimeout")]
    pub execution_timeout_secs: Option<u64>,
    /// Default retry count for nodes that fail transiently.
    #[serde(default, rename = "maxRetries")]
    pub max_retries: u32,
    /// Base backoff between retries, in seconds (doubled per attempt).
    #[serde(default = "default_retry_backoff", rename = "retryBackoffSeconds")]
    pub retry_backoff_secs: u64,
    /// Independent ready nodes that may run concurrently within one
    /// execution.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Failure handling policy.
    #[serde(default, rename = "errorPolicy")]
    pub error_policy: ErrorPolicy,
    /// Whether missed schedule ticks are backfilled.
    #[serde(default)]
    pub catchup: bool,
}

fn default_retry_backoff() -> u64 {
    1
}

fn default_concurrency() -> usize {
    1
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            execution_timeout_secs: None,
            max_retries: 0,
            retry_backoff_secs: default_retry_backoff(),
            concurrency: default_concurrency(),
            error_policy: ErrorPolicy::default(),
            catchup: false,
        }
    }
}

/// A complete workflow definition, immutable per version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// The owning workspace.
    pub workspace_id: WorkspaceId,
    /// Monotonic definition version.
    pub version: u32,
    /// Human-readable name.
    pub name: String,
    /// Description of what this workflow does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Ordered node specifications.
    pub nodes: Vec<NodeSpec>,
    /// Handle-to-handle connections.
    pub connections: Vec<Connection>,
    /// Execution settings.
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Tags for organization/filtering.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Workspace environment variables exposed to expressions as `$vars`.
    #[serde(default)]
    pub variables: serde_json::Map<String, JsonValue>,
    /// When this workflow was created.
    pub created_at: DateTime<Utc>,
    /// When this workflow was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Creates a new draft workflow with no nodes.
    #[must_use]
    pub fn new(workspace_id: WorkspaceId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            workspace_id,
            version: 1,
            name: name.into(),
            description: None,
            status: WorkflowStatus::Draft,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
            tags: Vec::new(),
            variables: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds a connection.
    #[must_use]
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Returns a node spec by ID.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns true if the workflow may fire from triggers.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Activates the workflow. Callers validate first.
    pub fn activate(&mut self) {
        self.status = WorkflowStatus::Active;
        self.touch();
    }

    /// Deactivates the workflow without archiving it.
    pub fn deactivate(&mut self) {
        self.status = WorkflowStatus::Inactive;
        self.touch();
    }

    /// Archives the workflow.
    pub fn archive(&mut self) {
        self.status = WorkflowStatus::Archived;
        self.touch();
    }

    /// Bumps the version for a new saved revision.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.touch();
    }

    /// Marks the workflow as updated.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Summary information about a workflow (for listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Description, if any.
    pub description: Option<String>,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Tags.
    pub tags: Vec<String>,
    /// Number of nodes in the graph.
    pub node_count: usize,
    /// Definition version.
    pub version: u32,
    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(workflow: &WorkflowDefinition) -> Self {
        Self {
            id: workflow.id,
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            status: workflow.status,
            tags: workflow.tags.clone(),
            node_count: workflow.nodes.len(),
            version: workflow.version,
            updated_at: workflow.updated_at,
        }
    }
}
