//! Error types for the scheduler crate.

use std::fmt;

/// Errors from schedule operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    InvalidCronExpression { expression: String, reason: String },
    /// Invalid IANA timezone.
    InvalidTimezone { timezone: String },
    /// Schedule evaluation failed.
    EvaluationFailed { reason: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCronExpression { expression, reason } => {
                write!(f, "invalid cron expression '{expression}': {reason}")
            }
            Self::InvalidTimezone { timezone } => {
                write!(f, "invalid timezone: {timezone}")
            }
            Self::EvaluationFailed { reason } => {
                write!(f, "schedule evaluation failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}
