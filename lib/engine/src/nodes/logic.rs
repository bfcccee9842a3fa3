//! Logic nodes: condition, switch and wait.
//!
//! Condition and switch evaluate their expressions against the node's
//! scope and route by handle; the scheduler prunes the untaken branches.
//! Loop nodes are scheduler-managed (see the scheduler's sub-schedule
//! handling) and register metadata only.

use crate::context::NodeContext;
use crate::error::NodeError;
use crate::registry::{NodeHandler, NodeOutcome, NodeRegistry};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tideflow_workflow::expression;
use tideflow_workflow::{Handle, NodeCategory, NodeTypeMeta, ParamDef, ParamKind};

/// `logic.condition` — emits the input on `true` or `false`.
pub struct ConditionNode;

#[async_trait]
impl NodeHandler for ConditionNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let predicate = ctx.require_str("expression")?;
        let taken = expression::evaluate_predicate(predicate, &ctx.scope())
            .map_err(|e| NodeError::param(e.to_string()))?;

        let handle = if taken { Handle::TRUE } else { Handle::FALSE };
        Ok(NodeOutcome::on(handle, ctx.input.clone()))
    }
}

/// `logic.switch` — emits on the first case whose predicate holds, else
/// `default`.
pub struct SwitchNode;

#[async_trait]
impl NodeHandler for SwitchNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let Some(JsonValue::Array(cases)) = ctx.param("cases") else {
            return Err(NodeError::param("parameter 'cases' must be an array"));
        };

        for case in cases {
            let handle = case
                .get("handle")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| NodeError::param("each case needs a 'handle' string"))?;
            let predicate = case
                .get("expression")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| NodeError::param("each case needs an 'expression' string"))?;

            let taken = expression::evaluate_predicate(predicate, &ctx.scope())
                .map_err(|e| NodeError::param(e.to_string()))?;
            if taken {
                return Ok(NodeOutcome::on(handle, ctx.input.clone()));
            }
        }

        Ok(NodeOutcome::on(Handle::DEFAULT, ctx.input.clone()))
    }
}

/// `logic.wait` — suspends the execution until an external resume or the
/// timeout.
pub struct WaitNode;

#[async_trait]
impl NodeHandler for WaitNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let timeout_secs = ctx.u64_param("timeout_seconds").unwrap_or(3600);
        let metadata = ctx.param("metadata").cloned().unwrap_or(JsonValue::Null);

        Ok(NodeOutcome::Suspend {
            timeout: Duration::from_secs(timeout_secs),
            metadata,
        })
    }
}

/// Registers the logic node types.
pub fn register(registry: &NodeRegistry) {
    registry.register(
        NodeTypeMeta::new("logic.condition", "Condition", NodeCategory::Logic)
            .with_param(ParamDef::required("expression", ParamKind::Expression)),
        Arc::new(ConditionNode),
    );
    registry.register(
        NodeTypeMeta::new("logic.switch", "Switch", NodeCategory::Logic)
            .with_param(ParamDef::required("cases", ParamKind::Array)),
        Arc::new(SwitchNode),
    );
    registry.register_managed(
        NodeTypeMeta::new("logic.loop", "Loop", NodeCategory::Logic)
            .with_param(ParamDef::required("items", ParamKind::Expression))
            .with_param(
                ParamDef::optional("batch_size", ParamKind::Number).with_default(json!(1)),
            ),
    );
    registry.register(
        NodeTypeMeta::new("logic.wait", "Wait", NodeCategory::Wait)
            .with_param(
                ParamDef::optional("timeout_seconds", ParamKind::Number)
                    .with_default(json!(3600)),
            )
            .with_param(ParamDef::optional("metadata", ParamKind::Object)),
        Arc::new(WaitNode),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map as JsonMap;
    use std::collections::HashMap;
    use tideflow_core::{ExecutionId, WorkflowId, WorkspaceId};
    use tideflow_guard::InMemoryCredentials;
    use tideflow_workflow::NodeId;
    use tokio_util::sync::CancellationToken;

    fn context(input: JsonValue, params: JsonMap<String, JsonValue>) -> NodeContext {
        NodeContext {
            execution_id: ExecutionId::new(),
            workflow_id: WorkflowId::new(),
            workspace_id: WorkspaceId::new(),
            node_id: NodeId::new("logic"),
            node_type: "logic.condition".to_string(),
            input: input.clone(),
            params,
            execution_input: input,
            outputs: HashMap::new(),
            env: JsonMap::new(),
            vars: JsonMap::new(),
            loop_frame: None,
            cancel: CancellationToken::new(),
            credentials: Arc::new(InMemoryCredentials::new()),
            preview: false,
        }
    }

    #[tokio::test]
    async fn condition_routes_true_branch() {
        let params: JsonMap<String, JsonValue> =
            [("expression".to_string(), json!("($json.x > 10)"))]
                .into_iter()
                .collect();
        let ctx = context(json!({"x": 15}), params);

        let outcome = ConditionNode.execute(&ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::on(Handle::TRUE, json!({"x": 15})));
    }

    #[tokio::test]
    async fn condition_routes_false_branch() {
        let params: JsonMap<String, JsonValue> =
            [("expression".to_string(), json!("($json.x > 10)"))]
                .into_iter()
                .collect();
        let ctx = context(json!({"x": 3}), params);

        let outcome = ConditionNode.execute(&ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::on(Handle::FALSE, json!({"x": 3})));
    }

    #[tokio::test]
    async fn switch_takes_first_matching_case() {
        let params: JsonMap<String, JsonValue> = [(
            "cases".to_string(),
            json!([
                {"handle": "small", "expression": "$json.size < 10"},
                {"handle": "large", "expression": "$json.size >= 10"}
            ]),
        )]
        .into_iter()
        .collect();
        let ctx = context(json!({"size": 40}), params);

        let outcome = SwitchNode.execute(&ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::on("large", json!({"size": 40})));
    }

    #[tokio::test]
    async fn switch_falls_back_to_default() {
        let params: JsonMap<String, JsonValue> = [(
            "cases".to_string(),
            json!([{"handle": "never", "expression": "$json.size > 100"}]),
        )]
        .into_iter()
        .collect();
        let ctx = context(json!({"size": 1}), params);

        let outcome = SwitchNode.execute(&ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::on(Handle::DEFAULT, json!({"size": 1})));
    }

    #[tokio::test]
    async fn wait_returns_suspend_with_timeout() {
        let params: JsonMap<String, JsonValue> =
            [("timeout_seconds".to_string(), json!(60))].into_iter().collect();
        let ctx = context(json!({}), params);

        let outcome = WaitNode.execute(&ctx).await.unwrap();
        assert_eq!(
            outcome,
            NodeOutcome::Suspend {
                timeout: Duration::from_secs(60),
                metadata: JsonValue::Null,
            }
        );
    }

    #[tokio::test]
    async fn condition_requires_expression_param() {
        let ctx = context(json!({}), JsonMap::new());
        let err = ConditionNode.execute(&ctx).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ParamResolution);
    }
}
