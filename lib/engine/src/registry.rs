//! The node registry.
//!
//! A process-wide mapping from node type string to metadata plus an
//! executable handler. The registry is populated at process start;
//! unknown types fail validation, never a silent no-op.
//!
//! Loop nodes register metadata only: the scheduler owns their
//! sub-schedule semantics and never dispatches them through a handler.

use crate::context::NodeContext;
use crate::error::NodeError;
use crate::nodes;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tideflow_guard::{BreakerManager, CredentialResolver};
use tideflow_workflow::{Handle, NodeCatalog, NodeTypeMeta};

/// The result of executing a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node produced output on the given handle.
    Advance { handle: Handle, output: JsonValue },
    /// The node suspends the execution until an external resume.
    Suspend {
        timeout: Duration,
        metadata: JsonValue,
    },
}

impl NodeOutcome {
    /// Output on the `main` handle.
    #[must_use]
    pub fn main(output: JsonValue) -> Self {
        Self::Advance {
            handle: Handle::main(),
            output,
        }
    }

    /// Output on a named handle.
    #[must_use]
    pub fn on(handle: impl Into<Handle>, output: JsonValue) -> Self {
        Self::Advance {
            handle: handle.into(),
            output,
        }
    }
}

/// An executable node implementation.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Executes the node with its resolved context.
    ///
    /// Implementations must observe `ctx.cancel` at I/O boundaries.
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError>;
}

struct RegisteredNode {
    meta: NodeTypeMeta,
    /// `None` for scheduler-managed types (loop).
    handler: Option<Arc<dyn NodeHandler>>,
}

/// Process-wide node type registry.
pub struct NodeRegistry {
    entries: RwLock<HashMap<String, RegisteredNode>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with all builtin node types.
    #[must_use]
    pub fn builtin(
        credentials: Arc<dyn CredentialResolver>,
        breakers: Arc<BreakerManager>,
    ) -> Self {
        let registry = Self::new();
        nodes::register_builtin(&registry, credentials, breakers);
        registry
    }

    /// Registers a node type with its handler.
    pub fn register(&self, meta: NodeTypeMeta, handler: Arc<dyn NodeHandler>) {
        self.entries.write().unwrap().insert(
            meta.node_type.clone(),
            RegisteredNode {
                meta,
                handler: Some(handler),
            },
        );
    }

    /// Registers a scheduler-managed node type (metadata only).
    pub fn register_managed(&self, meta: NodeTypeMeta) {
        self.entries.write().unwrap().insert(
            meta.node_type.clone(),
            RegisteredNode {
                meta,
                handler: None,
            },
        );
    }

    /// Returns the handler for a node type, if it is handler-dispatched.
    #[must_use]
    pub fn handler(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.entries
            .read()
            .unwrap()
            .get(node_type)
            .and_then(|entry| entry.handler.clone())
    }

    /// Returns all registered metadata.
    #[must_use]
    pub fn metas(&self) -> Vec<NodeTypeMeta> {
        self.entries
            .read()
            .unwrap()
            .values()
            .map(|entry| entry.meta.clone())
            .collect()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCatalog for NodeRegistry {
    fn get(&self, node_type: &str) -> Option<NodeTypeMeta> {
        self.entries
            .read()
            .unwrap()
            .get(node_type)
            .map(|entry| entry.meta.clone())
    }
}
