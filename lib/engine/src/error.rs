//! Error types for the execution engine.
//!
//! Node failures carry a `kind` that drives the scheduler's policy table:
//! transient kinds are retried per the node's retry policy, fatal kinds
//! apply the workflow's error policy, and cancellation is always terminal.

use std::fmt;
use tideflow_core::ExecutionId;
use tideflow_workflow::{ExecutionStatus, ValidationIssue};

/// Classification of a node (or pre-run) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The workflow failed validation before any node executed.
    Validation,
    /// An expression or parameter did not resolve.
    ParamResolution,
    /// A bug or unrecoverable condition inside a node implementation.
    NodeRuntime,
    /// Network failures, rate limits, 5xx responses, open circuit.
    NodeTransient,
    /// A per-node deadline elapsed.
    Timeout,
    /// The execution was cancelled externally.
    Cancelled,
    /// The workspace quota refused the work.
    QuotaExceeded,
    /// A panic was recovered in the worker.
    Panic,
}

impl ErrorKind {
    /// Returns true if the scheduler may retry a failure of this kind.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeTransient | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::ParamResolution => "param_resolution",
            Self::NodeRuntime => "node_runtime",
            Self::NodeTransient => "node_transient",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Panic => "panic",
        };
        write!(f, "{name}")
    }
}

/// A failure produced by a node invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable message; redacted before persistence.
    pub message: String,
}

impl NodeError {
    /// A non-retryable node implementation failure.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NodeRuntime,
            message: message.into(),
        }
    }

    /// A retryable transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NodeTransient,
            message: message.into(),
        }
    }

    /// A parameter/expression resolution failure.
    #[must_use]
    pub fn param(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ParamResolution,
            message: message.into(),
        }
    }

    /// A per-node timeout.
    #[must_use]
    pub fn timeout() -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: "node execution timed out".to_string(),
        }
    }

    /// An external cancellation.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "Cancelled by user".to_string(),
        }
    }

    /// A recovered panic.
    #[must_use]
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Panic,
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for NodeError {}

/// Errors from engine facade operations.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The workflow failed validation.
    Invalid { issues: Vec<ValidationIssue> },
    /// Execution not found.
    ExecutionNotFound { id: ExecutionId },
    /// The execution is already in a terminal state.
    AlreadyTerminal {
        id: ExecutionId,
        status: ExecutionStatus,
    },
    /// Retry requested for an execution that is not retryable.
    NotRetryable {
        id: ExecutionId,
        status: ExecutionStatus,
    },
    /// Storage failure.
    Store(crate::store::StoreError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { issues } => {
                write!(f, "workflow validation failed with {} issue(s)", issues.len())
            }
            Self::ExecutionNotFound { id } => write!(f, "execution not found: {id}"),
            Self::AlreadyTerminal { id, status } => {
                write!(f, "execution {id} is already terminal ({status:?})")
            }
            Self::NotRetryable { id, status } => {
                write!(f, "execution {id} cannot be retried from status {status:?}")
            }
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<crate::store::StoreError> for EngineError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Store(e)
    }
}
