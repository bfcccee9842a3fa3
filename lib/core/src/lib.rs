//! Core domain types and utilities for the tideflow platform.
//!
//! This crate provides the foundational types, error handling, and shared
//! utilities used throughout the tideflow workflow automation platform.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    CredentialId, ExecutionId, NodeExecutionId, ParseIdError, ScheduleId, UserId,
    WebhookEndpointId, WorkflowId, WorkspaceId,
};
