//! Trigger nodes.
//!
//! Triggers are the sources of the DAG. They never fetch anything: the
//! enqueue path already shaped the input (the webhook ingestor builds the
//! request envelope, the schedule loop injects the fire time), so each
//! trigger validates and passes its input through.

use crate::context::NodeContext;
use crate::error::NodeError;
use crate::registry::{NodeHandler, NodeOutcome, NodeRegistry};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tideflow_workflow::{NodeCategory, NodeTypeMeta};

/// `trigger.manual` — returns the execution input as-is.
pub struct ManualTrigger;

#[async_trait]
impl NodeHandler for ManualTrigger {
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutcome::main(ctx.input.clone()))
    }
}

/// `trigger.webhook` — emits the request envelope built by the ingestor.
pub struct WebhookTrigger;

#[async_trait]
impl NodeHandler for WebhookTrigger {
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        // The ingestor delivers {method, headers, body, query}; tolerate a
        // bare payload for manual test fires.
        Ok(NodeOutcome::main(ctx.input.clone()))
    }
}

/// `trigger.schedule` — emits the scheduled fire time.
pub struct ScheduleTrigger;

#[async_trait]
impl NodeHandler for ScheduleTrigger {
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let scheduled_time = ctx
            .input
            .get("scheduled_time")
            .cloned()
            .unwrap_or_else(|| json!(Utc::now().to_rfc3339()));

        let mut output = match &ctx.input {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        output.insert("scheduled_time".to_string(), scheduled_time);
        Ok(NodeOutcome::main(serde_json::Value::Object(output)))
    }
}

/// Registers the trigger node types.
pub fn register(registry: &NodeRegistry) {
    registry.register(
        NodeTypeMeta::new("trigger.manual", "Manual Trigger", NodeCategory::Trigger)
            .with_sample_output(json!({})),
        Arc::new(ManualTrigger),
    );
    registry.register(
        NodeTypeMeta::new("trigger.webhook", "Webhook Trigger", NodeCategory::Trigger)
            .with_sample_output(json!({
                "method": "POST",
                "headers": {},
                "body": {},
                "query": {}
            })),
        Arc::new(WebhookTrigger),
    );
    registry.register(
        NodeTypeMeta::new("trigger.schedule", "Schedule Trigger", NodeCategory::Trigger)
            .with_sample_output(json!({"scheduled_time": "1970-01-01T00:00:00Z"})),
        Arc::new(ScheduleTrigger),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map as JsonMap, Value as JsonValue};
    use std::collections::HashMap;
    use tideflow_core::{ExecutionId, WorkflowId, WorkspaceId};
    use tideflow_guard::InMemoryCredentials;
    use tideflow_workflow::NodeId;
    use tokio_util::sync::CancellationToken;

    fn context(node_type: &str, input: JsonValue) -> NodeContext {
        NodeContext {
            execution_id: ExecutionId::new(),
            workflow_id: WorkflowId::new(),
            workspace_id: WorkspaceId::new(),
            node_id: NodeId::new("t"),
            node_type: node_type.to_string(),
            input: input.clone(),
            params: JsonMap::new(),
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
    async fn manual_trigger_echoes_input() {
        let ctx = context("trigger.manual", json!({"a": 1}));
        let outcome = ManualTrigger.execute(&ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::main(json!({"a": 1})));
    }

    #[tokio::test]
    async fn webhook_trigger_passes_request_envelope() {
        let envelope = json!({
            "method": "POST",
            "headers": {"content-type": "application/json"},
            "body": {"hello": true},
            "query": {}
        });
        let ctx = context("trigger.webhook", envelope.clone());
        let outcome = WebhookTrigger.execute(&ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::main(envelope));
    }

    #[tokio::test]
    async fn schedule_trigger_keeps_provided_fire_time() {
        let ctx = context(
            "trigger.schedule",
            json!({"scheduled_time": "2026-03-01T12:05:00Z"}),
        );
        let outcome = ScheduleTrigger.execute(&ctx).await.unwrap();
        let NodeOutcome::Advance { output, .. } = outcome else {
            panic!("expected advance");
        };
        assert_eq!(output["scheduled_time"], json!("2026-03-01T12:05:00Z"));
    }

    #[tokio::test]
    async fn schedule_trigger_defaults_fire_time() {
        let ctx = context("trigger.schedule", json!({}));
        let outcome = ScheduleTrigger.execute(&ctx).await.unwrap();
        let NodeOutcome::Advance { output, .. } = outcome else {
            panic!("expected advance");
        };
        assert!(output["scheduled_time"].is_string());
    }
}
