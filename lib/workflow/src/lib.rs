//! Workflow model for the tideflow platform.
//!
//! This crate provides the persistent workflow model and its validation:
//!
//! - **Graph Model**: nodes, handle-to-handle connections, and the derived
//!   directed graph (petgraph-backed)
//! - **Parameter Schema**: data-driven parameter definitions per node type
//! - **Validator**: coded validation issues (cycles, reachability, dangling
//!   connections, parameter conformance)
//! - **Expressions**: `{{ … }}` reference resolution against run-time scope
//! - **Execution Records**: executions and per-node execution rows
//! - **Import/Export**: the versioned workflow document format

pub mod catalog;
pub mod connection;
pub mod definition;
pub mod error;
pub mod execution;
pub mod export;
pub mod expression;
pub mod graph;
pub mod node;
pub mod params;
pub mod validate;

pub use catalog::{NodeCatalog, NodeCategory, NodeTypeMeta};
pub use connection::{Connection, Handle};
pub use definition::{ErrorPolicy, WorkflowDefinition, WorkflowSettings, WorkflowStatus, WorkflowSummary};
pub use error::{ExpressionError, GraphError, ImportError};
pub use execution::{
    Execution, ExecutionFailure, ExecutionStatus, NodeExecution, NodeRunStatus, TriggerType,
};
pub use export::WorkflowDocument;
pub use expression::Scope;
pub use graph::WorkflowGraph;
pub use node::{NodeId, NodeSpec};
pub use params::{ParamDef, ParamKind};
pub use validate::{IssueCode, Severity, ValidationIssue, ValidationReport, validate_workflow};
