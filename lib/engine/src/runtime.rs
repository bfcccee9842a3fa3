//! Node invocation runtime.
//!
//! One place owns the mechanics of calling a node handler: parameter
//! resolution against the expression scope, the per-node timeout, the
//! retry loop with exponential backoff, and cancellation during both the
//! call and the backoff sleeps.

use crate::context::NodeContext;
use crate::error::{ErrorKind, NodeError};
use crate::registry::{NodeHandler, NodeOutcome};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tideflow_workflow::expression::{self, Scope};
use tideflow_workflow::{ExpressionError, NodeSpec, NodeTypeMeta, ParamKind, WorkflowSettings};

/// Retry and deadline policy for one node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff; doubled per attempt.
    pub backoff: Duration,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Merges workflow defaults with per-node parameter overrides.
    #[must_use]
    pub fn for_node(settings: &WorkflowSettings, node: &NodeSpec) -> Self {
        let max_retries = node
            .parameter("max_retries")
            .and_then(JsonValue::as_u64)
            .map_or(settings.max_retries, |v| v as u32);
        let timeout = node
            .parameter("timeout_ms")
            .and_then(JsonValue::as_u64)
            .map(Duration::from_millis);

        Self {
            max_retries,
            backoff: Duration::from_secs(settings.retry_backoff_secs),
            timeout,
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Resolves a node's parameters against the scope.
///
/// Declared parameters get defaults applied and kinds honored:
/// expression-kind parameters stay raw for the handler to evaluate.
/// An unresolved reference is a hard `MISSING_BINDING` failure for
/// required parameters and `null` for optional ones.
///
/// # Errors
///
/// Returns a [`ErrorKind::ParamResolution`] error on failed resolution of
/// a required parameter.
pub fn resolve_params(
    meta: &NodeTypeMeta,
    raw: &JsonMap<String, JsonValue>,
    scope: &Scope<'_>,
) -> Result<JsonMap<String, JsonValue>, NodeError> {
    let mut resolved = JsonMap::new();

    for def in &meta.params {
        let value = raw.get(&def.name).cloned().or_else(|| def.default.clone());
        let Some(value) = value else {
            if def.required {
                return Err(NodeError::param(format!(
                    "missing required parameter '{}'",
                    def.name
                )));
            }
            continue;
        };

        if def.kind == ParamKind::Expression {
            // Handlers evaluate these against their own scope.
            resolved.insert(def.name.clone(), value);
            continue;
        }

        match expression::evaluate_value(&value, scope) {
            Ok(value) => {
                resolved.insert(def.name.clone(), value);
            }
            Err(ExpressionError::MissingBinding { reference }) => {
                if def.required {
                    return Err(NodeError::param(format!(
                        "MISSING_BINDING: parameter '{}' references {reference}",
                        def.name
                    )));
                }
                resolved.insert(def.name.clone(), JsonValue::Null);
            }
            Err(e) => return Err(NodeError::param(e.to_string())),
        }
    }

    // Undeclared parameters pass through resolved; unresolved references
    // degrade to null rather than failing the node.
    for (name, value) in raw {
        if resolved.contains_key(name) || meta.params.iter().any(|d| &d.name == name) {
            continue;
        }
        let value = match expression::evaluate_value(value, scope) {
            Ok(value) => value,
            Err(ExpressionError::MissingBinding { .. }) => JsonValue::Null,
            Err(e) => return Err(NodeError::param(e.to_string())),
        };
        resolved.insert(name.clone(), value);
    }

    Ok(resolved)
}

/// Invokes a handler under the retry policy.
///
/// Returns the final outcome (or error) and the number of attempts made.
/// Cancellation aborts immediately, including during a retry backoff.
pub async fn invoke(
    handler: Arc<dyn NodeHandler>,
    ctx: &NodeContext,
    policy: RetryPolicy,
) -> (Result<NodeOutcome, NodeError>, u32) {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        if ctx.cancel.is_cancelled() {
            return (Err(NodeError::cancelled()), attempt);
        }

        let call = handler.execute(ctx);
        let result = match policy.timeout {
            Some(deadline) => tokio::select! {
                () = ctx.cancel.cancelled() => Err(NodeError::cancelled()),
                result = tokio::time::timeout(deadline, call) => {
                    result.unwrap_or_else(|_| Err(NodeError::timeout()))
                }
            },
            None => tokio::select! {
                () = ctx.cancel.cancelled() => Err(NodeError::cancelled()),
                result = call => result,
            },
        };

        match result {
            Ok(outcome) => return (Ok(outcome), attempt),
            Err(error) => {
                let retries_left = attempt <= policy.max_retries;
                if error.kind == ErrorKind::Cancelled || !error.kind.is_retryable() || !retries_left
                {
                    return (Err(error), attempt);
                }

                let backoff = policy.backoff_for_attempt(attempt);
                tracing::debug!(
                    node_id = %ctx.node_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "retrying node after transient failure"
                );
                tokio::select! {
                    () = ctx.cancel.cancelled() => {
                        // Cancellation during backoff aborts remaining retries.
                        return (Err(NodeError::cancelled()), attempt);
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
