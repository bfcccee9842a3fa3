//! Node type catalog.
//!
//! The validator needs to know which node types exist, their category and
//! their parameter schema, without depending on the execution engine. The
//! `NodeCatalog` trait is that seam: the engine's node registry implements
//! it, and tests can provide a fixed catalog.

use crate::params::ParamDef;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The behavioral category of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    /// Entry points; their output seeds the scheduler.
    Trigger,
    /// Side-effecting operations.
    Action,
    /// Branching, switching and looping.
    Logic,
    /// Durably suspends the execution until resumed.
    Wait,
    /// Vendor integration operations.
    Integration,
}

impl NodeCategory {
    /// Returns true for trigger nodes.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger)
    }
}

/// Metadata describing a registered node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeMeta {
    /// The dotted type string (e.g. `action.http`).
    pub node_type: String,
    /// Display name for editors.
    pub display_name: String,
    /// Behavioral category.
    pub category: NodeCategory,
    /// Declared parameters.
    pub params: Vec<ParamDef>,
    /// Sample output used by preview mode instead of executing the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_output: Option<JsonValue>,
}

impl NodeTypeMeta {
    /// Creates metadata with no parameters.
    #[must_use]
    pub fn new(
        node_type: impl Into<String>,
        display_name: impl Into<String>,
        category: NodeCategory,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            display_name: display_name.into(),
            category,
            params: Vec::new(),
            sample_output: None,
        }
    }

    /// Adds a parameter definition.
    #[must_use]
    pub fn with_param(mut self, param: ParamDef) -> Self {
        self.params.push(param);
        self
    }

    /// Sets the preview sample output.
    #[must_use]
    pub fn with_sample_output(mut self, sample: JsonValue) -> Self {
        self.sample_output = Some(sample);
        self
    }
}

/// Lookup of node type metadata by type string.
pub trait NodeCatalog: Send + Sync {
    /// Returns the metadata for a node type, if registered.
    fn get(&self, node_type: &str) -> Option<NodeTypeMeta>;

    /// Returns true if the node type is registered.
    fn contains(&self, node_type: &str) -> bool {
        self.get(node_type).is_some()
    }
}

/// A fixed catalog backed by a list of metadata records.
///
/// Useful in tests and for validating definitions offline.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<NodeTypeMeta>,
}

impl StaticCatalog {
    /// Creates a catalog from metadata records.
    #[must_use]
    pub fn new(entries: Vec<NodeTypeMeta>) -> Self {
        Self { entries }
    }
}

impl NodeCatalog for StaticCatalog {
    fn get(&self, node_type: &str) -> Option<NodeTypeMeta> {
        self.entries.iter().find(|m| m.node_type == node_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamKind;

    #[test]
    fn static_catalog_lookup() {
        let catalog = StaticCatalog::new(vec![
            NodeTypeMeta::new("trigger.manual", "Manual Trigger", NodeCategory::Trigger),
            NodeTypeMeta::new("action.set", "Set Fields", NodeCategory::Action)
                .with_param(ParamDef::required("fields", ParamKind::Object)),
        ]);

        assert!(catalog.contains("trigger.manual"));
        assert!(!catalog.contains("action.unknown"));

        let set = catalog.get("action.set").expect("registered");
        assert_eq!(set.category, NodeCategory::Action);
        assert_eq!(set.params.len(), 1);
    }
}
