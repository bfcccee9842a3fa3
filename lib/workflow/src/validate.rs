//! Workflow validation.
//!
//! Validation is pure: it reads a definition and a node catalog and
//! produces a list of coded issues, never mutating anything. It runs on
//! workflow save, on activation, and at the start of every execution.

use crate::catalog::NodeCatalog;
use crate::definition::WorkflowDefinition;
use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Machine-readable validation issue codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    EmptyWorkflow,
    MissingNodeId,
    DuplicateNodeId,
    MissingNodeType,
    InvalidNodeType,
    InvalidParameter,
    MissingSourceNode,
    MissingTargetNode,
    SelfLoop,
    DuplicateConnection,
    NoTriggerNode,
    MultipleTriggerNodes,
    CycleDetected,
    UnreachableNode,
}

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks saving as active and blocks execution.
    Error,
    /// Surfaced to the editor but does not block.
    Warning,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// The offending node, when the issue is node-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Machine-readable code.
    pub code: IssueCode,
    /// Human-readable message.
    pub message: String,
    /// Issue severity.
    pub severity: Severity,
}

impl ValidationIssue {
    fn error(node_id: Option<NodeId>, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            node_id,
            code,
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(node_id: Option<NodeId>, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            node_id,
            code,
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// The result of validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// All findings, errors and warnings.
    pub issues: Vec<ValidationIssue>,
    /// Topological execution order; present when the graph is acyclic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_order: Option<Vec<NodeId>>,
    /// Trigger nodes, sorted by ID.
    #[serde(default)]
    pub root_nodes: Vec<NodeId>,
    /// Nodes with no outgoing connections.
    #[serde(default)]
    pub leaf_nodes: Vec<NodeId>,
}

impl ValidationReport {
    /// Returns true when no error-severity issue was found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.issues.iter().all(|i| i.severity != Severity::Error)
    }

    /// Returns the error-severity issues.
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    /// Returns true if the report contains the given code.
    #[must_use]
    pub fn has_code(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }
}

/// Validates a workflow definition against a node catalog.
#[must_use]
pub fn validate_workflow(
    definition: &WorkflowDefinition,
    catalog: &dyn NodeCatalog,
) -> ValidationReport {
    let mut issues = Vec::new();

    if definition.nodes.is_empty() {
        issues.push(ValidationIssue::error(
            None,
            IssueCode::EmptyWorkflow,
            "workflow has no nodes",
        ));
        return ValidationReport {
            issues,
            execution_order: None,
            root_nodes: Vec::new(),
            leaf_nodes: Vec::new(),
        };
    }

    check_nodes(definition, catalog, &mut issues);
    check_connections(definition, &mut issues);

    let graph = WorkflowGraph::build(&definition.nodes, &definition.connections);

    let mut triggers: Vec<NodeId> = definition
        .nodes
        .iter()
        .filter(|n| {
            catalog
                .get(&n.node_type)
                .is_some_and(|meta| meta.category.is_trigger())
        })
        .map(|n| n.id.clone())
        .collect();
    triggers.sort();
    triggers.dedup();

    match triggers.len() {
        0 => issues.push(ValidationIssue::error(
            None,
            IssueCode::NoTriggerNode,
            "workflow has no trigger node",
        )),
        1 => {}
        n => issues.push(ValidationIssue::warning(
            None,
            IssueCode::MultipleTriggerNodes,
            format!("workflow has {n} trigger nodes; the first is used as the entry point"),
        )),
    }

    let execution_order = match graph.topological_order() {
        Ok(order) => Some(order),
        Err(_) => {
            issues.push(ValidationIssue::error(
                None,
                IssueCode::CycleDetected,
                "workflow graph contains a cycle",
            ));
            None
        }
    };

    if !triggers.is_empty() {
        let reachable = graph.reachable_from(&triggers);
        let trigger_set: HashSet<&NodeId> = triggers.iter().collect();
        for node in &definition.nodes {
            if !trigger_set.contains(&node.id) && !reachable.contains(&node.id) {
                issues.push(ValidationIssue::error(
                    Some(node.id.clone()),
                    IssueCode::UnreachableNode,
                    format!("node '{}' is not reachable from any trigger", node.id),
                ));
            }
        }
    }

    let has_errors = issues.iter().any(|i| i.severity == Severity::Error);
    let leaf_nodes = graph.leaf_nodes().iter().map(|n| n.id.clone()).collect();

    ValidationReport {
        issues,
        execution_order: if has_errors { None } else { execution_order },
        root_nodes: triggers,
        leaf_nodes,
    }
}

fn check_nodes(
    definition: &WorkflowDefinition,
    catalog: &dyn NodeCatalog,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut seen_ids = HashSet::new();

    for node in &definition.nodes {
        if node.id.is_empty() {
            issues.push(ValidationIssue::error(
                None,
                IssueCode::MissingNodeId,
                "node has an empty id",
            ));
            continue;
        }

        if !seen_ids.insert(node.id.clone()) {
            issues.push(ValidationIssue::error(
                Some(node.id.clone()),
                IssueCode::DuplicateNodeId,
                format!("duplicate node id '{}'", node.id),
            ));
            continue;
        }

        if node.node_type.is_empty() {
            issues.push(ValidationIssue::error(
                Some(node.id.clone()),
                IssueCode::MissingNodeType,
                format!("node '{}' has an empty type", node.id),
            ));
            continue;
        }

        let Some(meta) = catalog.get(&node.node_type) else {
            issues.push(ValidationIssue::error(
                Some(node.id.clone()),
                IssueCode::InvalidNodeType,
                format!("unknown node type '{}'", node.node_type),
            ));
            continue;
        };

        for param in &meta.params {
            match node.parameters.get(&param.name) {
                Some(value) => {
                    if let Err(reason) = param.check(value) {
                        issues.push(ValidationIssue::error(
                            Some(node.id.clone()),
                            IssueCode::InvalidParameter,
                            reason,
                        ));
                    }
                }
                None => {
                    if param.required && param.default.is_none() {
                        issues.push(ValidationIssue::error(
                            Some(node.id.clone()),
                            IssueCode::InvalidParameter,
                            format!(
                                "node '{}' is missing required parameter '{}'",
                                node.id, param.name
                            ),
                        ));
                    }
                }
            }
        }
    }
}

fn check_connections(definition: &WorkflowDefinition, issues: &mut Vec<ValidationIssue>) {
    let node_ids: HashSet<&NodeId> = definition.nodes.iter().map(|n| &n.id).collect();
    let mut seen_keys = HashSet::new();

    for connection in &definition.connections {
        if !node_ids.contains(&connection.source_node_id) {
            issues.push(ValidationIssue::error(
                None,
                IssueCode::MissingSourceNode,
                format!(
                    "connection '{}' references missing source node '{}'",
                    connection.id, connection.source_node_id
                ),
            ));
            continue;
        }

        if !node_ids.contains(&connection.target_node_id) {
            issues.push(ValidationIssue::error(
                None,
                IssueCode::MissingTargetNode,
                format!(
                    "connection '{}' references missing target node '{}'",
                    connection.id, connection.target_node_id
                ),
            ));
            continue;
        }

        if connection.is_self_loop() {
            issues.push(ValidationIssue::error(
                Some(connection.source_node_id.clone()),
                IssueCode::SelfLoop,
                format!("connection '{}' loops node '{}' to itself", connection.id, connection.source_node_id),
            ));
            continue;
        }

        let key = (
            connection.source_node_id.clone(),
            connection.source_handle.clone(),
            connection.target_node_id.clone(),
            connection.target_handle.clone(),
        );
        if !seen_keys.insert(key) {
            issues.push(ValidationIssue::error(
                None,
                IssueCode::DuplicateConnection,
                format!("duplicate connection '{}'", connection.id),
            ));
        }
    }
}
