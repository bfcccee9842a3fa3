//! Workflow node specifications.
//!
//! Nodes are the building blocks of workflows. Each node has:
//! - An ID unique within its workflow (a stable, user-visible string)
//! - A dotted type string (e.g. `action.http`, `logic.loop`, `trigger.webhook`)
//! - A human-readable name
//! - Free-form parameters, validated against the registry's parameter schema

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;

/// A unique identifier for a node within a workflow.
///
/// Node IDs are user-provided stable strings; the graph, connections and
/// expression scope are all keyed by them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Canvas position of a node, kept for editors; ignored by execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node specification within a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier for this node within the workflow.
    pub id: NodeId,
    /// Dotted node type string, resolved against the node registry.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Human-readable name for this node.
    pub name: String,
    /// Parameters for this node. Values may be primitives, objects, arrays,
    /// or unresolved `{{ … }}` expression strings.
    #[serde(default)]
    pub parameters: JsonMap<String, JsonValue>,
    /// Optional canvas position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl NodeSpec {
    /// Creates a new node spec with empty parameters.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: name.into(),
            parameters: JsonMap::new(),
            position: None,
        }
    }

    /// Sets a parameter value.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Returns a parameter value by name, if set.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&JsonValue> {
        self.parameters.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrips_as_plain_string() {
        let id = NodeId::new("fetch-orders");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"fetch-orders\"");
        let parsed: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
    }

    #[test]
    fn node_spec_builder_sets_parameters() {
        let node = NodeSpec::new("set-1", "action.set", "Tag order")
            .with_parameter("fields", serde_json::json!({"tag": "big"}));

        assert_eq!(node.node_type, "action.set");
        assert_eq!(
            node.parameter("fields"),
            Some(&serde_json::json!({"tag": "big"}))
        );
        assert!(node.parameter("missing").is_none());
    }

    #[test]
    fn node_spec_serde_roundtrip() {
        let node = NodeSpec::new("http-1", "action.http", "Call API")
            .with_parameter("url", serde_json::json!("https://example.com"));
        let json = serde_json::to_string(&node).expect("serialize");
        let parsed: NodeSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(node, parsed);
        // The type field serializes under the wire name "type"
        assert!(json.contains("\"type\":\"action.http\""));
    }
}
