//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: structural graph failures (cycles, unknown nodes)
//! - `ExpressionError`: `{{ … }}` resolution failures
//! - `ImportError`: workflow document import failures

use crate::node::NodeId;
use std::fmt;

/// Errors from graph operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// Graph contains cycles.
    CycleDetected,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => {
                write!(f, "node not found: {node_id}")
            }
            Self::CycleDetected => write!(f, "graph contains cycles"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from expression resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    /// A reference did not resolve against the scope.
    MissingBinding { reference: String },
    /// The expression text could not be parsed.
    Syntax { reason: String },
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBinding { reference } => {
                write!(f, "unresolved reference: {reference}")
            }
            Self::Syntax { reason } => write!(f, "expression syntax error: {reason}"),
        }
    }
}

impl std::error::Error for ExpressionError {}

/// Errors from importing a workflow document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    /// The document version is not supported.
    UnsupportedVersion { found: String },
    /// The document could not be parsed.
    Malformed { reason: String },
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion { found } => {
                write!(f, "unsupported document version: {found}")
            }
            Self::Malformed { reason } => write!(f, "malformed workflow document: {reason}"),
        }
    }
}

impl std::error::Error for ImportError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let err = GraphError::NodeNotFound {
            node_id: NodeId::new("missing"),
        };
        assert!(err.to_string().contains("node not found"));
        assert!(GraphError::CycleDetected.to_string().contains("cycles"));
    }

    #[test]
    fn expression_error_display() {
        let err = ExpressionError::MissingBinding {
            reference: "$json.absent".to_string(),
        };
        assert!(err.to_string().contains("unresolved reference"));
    }

    #[test]
    fn import_error_display() {
        let err = ImportError::UnsupportedVersion {
            found: "2.0".to_string(),
        };
        assert!(err.to_string().contains("2.0"));
    }
}
