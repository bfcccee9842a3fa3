//! Action nodes: `action.set` and `action.http`.

use crate::context::NodeContext;
use crate::error::NodeError;
use crate::registry::{NodeHandler, NodeOutcome, NodeRegistry};
use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::str::FromStr;
use std::sync::Arc;
use tideflow_core::CredentialId;
use tideflow_guard::{BreakerManager, CredentialResolver};
use tideflow_workflow::{NodeCategory, NodeTypeMeta, ParamDef, ParamKind};

/// `action.set` — merges configured fields over the incoming object.
pub struct SetNode;

#[async_trait]
impl NodeHandler for SetNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let fields = match ctx.param("fields") {
            Some(JsonValue::Object(map)) => map.clone(),
            Some(other) => {
                return Err(NodeError::param(format!(
                    "parameter 'fields' must be an object, got {other}"
                )));
            }
            None => JsonMap::new(),
        };

        let mut output = match &ctx.input {
            JsonValue::Object(map) => map.clone(),
            JsonValue::Null => JsonMap::new(),
            other => {
                let mut map = JsonMap::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        for (key, value) in fields {
            output.insert(key, value);
        }

        Ok(NodeOutcome::main(JsonValue::Object(output)))
    }
}

/// `action.http` — an outbound HTTP request guarded by the per-host
/// circuit breaker, with credentials injected as auth headers.
pub struct HttpNode {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialResolver>,
    breakers: Arc<BreakerManager>,
}

impl HttpNode {
    /// Creates the HTTP action node.
    #[must_use]
    pub fn new(credentials: Arc<dyn CredentialResolver>, breakers: Arc<BreakerManager>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            breakers,
        }
    }

    async fn send(&self, ctx: &NodeContext, url: &str) -> Result<NodeOutcome, NodeError> {
        let method_name = ctx.str_param("method").unwrap_or("GET");
        let method = reqwest::Method::from_str(method_name)
            .map_err(|_| NodeError::param(format!("invalid HTTP method '{method_name}'")))?;

        let mut request = self.client.request(method, url);

        if let Some(JsonValue::Object(headers)) = ctx.param("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        if let Some(body) = ctx.param("body") {
            request = request.json(body);
        }

        if let Some(timeout_ms) = ctx.u64_param("timeout_ms") {
            request = request.timeout(std::time::Duration::from_millis(timeout_ms));
        }

        if let Some(credential_id) = ctx.str_param("credential_id") {
            let id = CredentialId::from_str(credential_id)
                .map_err(|e| NodeError::param(format!("invalid credential_id: {e}")))?;
            let value = self
                .credentials
                .resolve(id)
                .await
                .map_err(|e| NodeError::runtime(e.to_string()))?;
            let (name, header) = value.header();
            request = request.header(name, header);
        }

        let response = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(NodeError::cancelled()),
            result = request.send() => result.map_err(classify_reqwest_error)?,
        };

        let status = response.status();
        let headers: JsonMap<String, JsonValue> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), json!(v)))
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| NodeError::transient(e.to_string()))?;
        let body = serde_json::from_str::<JsonValue>(&text).unwrap_or(JsonValue::String(text));

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(NodeError::transient(format!(
                "upstream returned {status}"
            )));
        }
        if status.is_client_error() {
            return Err(NodeError::runtime(format!("upstream returned {status}")));
        }

        Ok(NodeOutcome::main(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        })))
    }
}

#[async_trait]
impl NodeHandler for HttpNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let url = ctx.require_str("url")?;
        let target = host_of(url);

        if ctx.preview {
            return Ok(NodeOutcome::main(json!({
                "status": 200,
                "headers": {},
                "body": null,
            })));
        }

        self.breakers
            .acquire(&target)
            .map_err(|e| NodeError::transient(e.to_string()))?;

        let result = self.send(ctx, url).await;
        match &result {
            Ok(_) => self.breakers.on_success(&target),
            Err(e) if e.kind.is_retryable() => self.breakers.on_failure(&target),
            // Client errors and cancellations say nothing about target health.
            Err(_) => {}
        }
        result
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> NodeError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        NodeError::transient(error.to_string())
    } else {
        NodeError::runtime(error.to_string())
    }
}

/// Extracts the host (without port) from an http(s) URL string.
fn host_of(url: &str) -> String {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    host.split(':').next().unwrap_or(host).to_string()
}

/// Registers the action node types.
pub fn register(
    registry: &NodeRegistry,
    credentials: Arc<dyn CredentialResolver>,
    breakers: Arc<BreakerManager>,
) {
    registry.register(
        NodeTypeMeta::new("action.set", "Set Fields", NodeCategory::Action)
            .with_param(ParamDef::required("fields", ParamKind::Object))
            .with_sample_output(json!({})),
        Arc::new(SetNode),
    );
    registry.register(
        NodeTypeMeta::new("action.http", "HTTP Request", NodeCategory::Action)
            .with_param(ParamDef::required("url", ParamKind::Url))
            .with_param(
                ParamDef::optional("method", ParamKind::String)
                    .with_options(&["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"])
                    .with_default(json!("GET")),
            )
            .with_param(ParamDef::optional("headers", ParamKind::Object))
            .with_param(ParamDef::optional("body", ParamKind::Object))
            .with_param(ParamDef::optional("timeout_ms", ParamKind::Number))
            .with_param(ParamDef::optional("credential_id", ParamKind::String))
            .with_sample_output(json!({"status": 200, "headers": {}, "body": null})),
        Arc::new(HttpNode::new(credentials, breakers)),
    );
}
