//! Connections between workflow nodes.
//!
//! Connections are handle-to-handle: a named output handle on the source
//! node feeds a named input handle on the target node. Most nodes emit on
//! `main`; branching nodes emit on `true`/`false` or case handles, and loop
//! nodes emit on `loop` and `done`.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named output (or input) port on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// The default handle nodes emit on.
    pub const MAIN: &'static str = "main";
    /// Taken branch of a condition node.
    pub const TRUE: &'static str = "true";
    /// Untaken branch of a condition node.
    pub const FALSE: &'static str = "false";
    /// Per-iteration handle of a loop node.
    pub const LOOP: &'static str = "loop";
    /// Emitted once after all loop iterations complete.
    pub const DONE: &'static str = "done";
    /// Fallback handle of a switch node.
    pub const DEFAULT: &'static str = "default";

    /// Creates a handle from a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The `main` handle.
    #[must_use]
    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    /// Returns the handle name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the `main` handle.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::main()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A connection from a source node's output handle to a target node's
/// input handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Unique identifier for this connection within the workflow.
    pub id: String,
    /// The source node.
    pub source_node_id: NodeId,
    /// The output handle on the source node.
    #[serde(default)]
    pub source_handle: Handle,
    /// The target node.
    pub target_node_id: NodeId,
    /// The input handle on the target node.
    #[serde(default)]
    pub target_handle: Handle,
}

impl Connection {
    /// Creates a connection on the `main` handles.
    #[must_use]
    pub fn main(id: impl Into<String>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.into(),
            source_handle: Handle::main(),
            target_node_id: target.into(),
            target_handle: Handle::main(),
        }
    }

    /// Creates a connection with an explicit source handle.
    #[must_use]
    pub fn from_handle(
        id: impl Into<String>,
        source: impl Into<NodeId>,
        source_handle: impl Into<Handle>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.into(),
            source_handle: source_handle.into(),
            target_node_id: target.into(),
            target_handle: Handle::main(),
        }
    }

    /// The uniqueness key of a connection: (source, source-handle, target,
    /// target-handle).
    #[must_use]
    pub fn key(&self) -> (&NodeId, &Handle, &NodeId, &Handle) {
        (
            &self.source_node_id,
            &self.source_handle,
            &self.target_node_id,
            &self.target_handle,
        )
    }

    /// Returns true if the connection loops a node back to itself.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.source_node_id == self.target_node_id
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_defaults_to_main() {
        let handle = Handle::default();
        assert!(handle.is_main());
        assert_eq!(handle.as_str(), "main");
    }

    #[test]
    fn connection_key_distinguishes_handles() {
        let on_true = Connection::from_handle("c1", "cond", Handle::TRUE, "a");
        let on_false = Connection::from_handle("c2", "cond", Handle::FALSE, "a");
        assert_ne!(on_true.key(), on_false.key());
    }

    #[test]
    fn self_loop_detection() {
        let looped = Connection::main("c1", "a", "a");
        assert!(looped.is_self_loop());

        let normal = Connection::main("c2", "a", "b");
        assert!(!normal.is_self_loop());
    }

    #[test]
    fn connection_serde_defaults_handles_to_main() {
        let json = r#"{"id":"c1","source_node_id":"a","target_node_id":"b"}"#;
        let parsed: Connection = serde_json::from_str(json).expect("deserialize");
        assert!(parsed.source_handle.is_main());
        assert!(parsed.target_handle.is_main());
    }
}
