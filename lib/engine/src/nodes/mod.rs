//! Builtin node implementations.
//!
//! Triggers echo their declared inputs; actions have side effects; logic
//! nodes route. Vendor `integration.*` executors and `action.code` are
//! registry clients that plug in through the same `register` API, not
//! part of the core.

pub mod action;
pub mod logic;
pub mod trigger;

use crate::registry::NodeRegistry;
use std::sync::Arc;
use tideflow_guard::{BreakerManager, CredentialResolver};

/// Registers every builtin node type.
pub fn register_builtin(
    registry: &NodeRegistry,
    credentials: Arc<dyn CredentialResolver>,
    breakers: Arc<BreakerManager>,
) {
    trigger::register(registry);
    action::register(registry, credentials, breakers);
    logic::register(registry);
}
