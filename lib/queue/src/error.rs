//! Error types for the queue crate.

use std::fmt;

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Failed to connect to the broker.
    ConnectionFailed { message: String },
    /// Failed to publish a job.
    PublishFailed { message: String },
    /// Failed to lease or acknowledge a job.
    ConsumeFailed { message: String },
    /// A payload could not be (de)serialized.
    Serialization { message: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "broker connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "job publish failed: {message}"),
            Self::ConsumeFailed { message } => write!(f, "job consume failed: {message}"),
            Self::Serialization { message } => {
                write!(f, "job serialization failed: {message}")
            }
        }
    }
}

impl std::error::Error for QueueError {}
