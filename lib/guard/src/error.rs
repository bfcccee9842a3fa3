//! Error types for the guard crate.

use std::fmt;
use tideflow_core::{CredentialId, WorkspaceId};

/// Errors from circuit breaker checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerError {
    /// The circuit for this target is open; fail fast.
    CircuitOpen { target: String },
}

impl fmt::Display for BreakerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { target } => {
                write!(f, "circuit open for target '{target}'")
            }
        }
    }
}

impl std::error::Error for BreakerError {}

/// Errors from quota enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// A plan limit was reached; the enqueue is refused.
    Exceeded {
        workspace_id: WorkspaceId,
        limit: &'static str,
        used: u64,
        allowed: u64,
    },
}

impl fmt::Display for QuotaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exceeded {
                workspace_id,
                limit,
                used,
                allowed,
            } => write!(
                f,
                "workspace {workspace_id} exceeded {limit} quota ({used}/{allowed})"
            ),
        }
    }
}

impl std::error::Error for QuotaError {}

/// Errors from credential resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Credential not found.
    NotFound { id: CredentialId },
    /// The vault backend failed.
    Backend { reason: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "credential not found: {id}"),
            Self::Backend { reason } => write!(f, "credential backend failure: {reason}"),
        }
    }
}

impl std::error::Error for CredentialError {}
