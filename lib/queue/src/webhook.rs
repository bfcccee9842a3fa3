//! Webhook ingestion.
//!
//! Translates an inbound HTTP request into an execution enqueue: endpoint
//! lookup by (workspace, method, path), signature verification when a
//! secret is configured, body size cap, and the
//! `{method, headers, body, query}` trigger input envelope.

use crate::producer::{EnqueueRequest, ExecutionProducer, ProduceError, SubmitReceipt};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};
use tideflow_core::{WebhookEndpointId, WorkflowId, WorkspaceId};
use tideflow_engine::StoreError;
use tideflow_workflow::{NodeId, TriggerType};

/// Default inbound body cap: 5 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// A registered webhook endpoint bound to a workflow's webhook trigger
/// node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Unique identifier.
    pub id: WebhookEndpointId,
    /// The workflow this endpoint starts.
    pub workflow_id: WorkflowId,
    /// The trigger node within the workflow.
    pub node_id: NodeId,
    /// HTTP method (uppercase).
    pub method: String,
    /// Workspace-unique path.
    pub path: String,
    /// Shared secret for signature verification, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Whether the endpoint accepts requests.
    pub is_active: bool,
}

impl WebhookEndpoint {
    /// Creates an active endpoint.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        node_id: NodeId,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: WebhookEndpointId::new(),
            workflow_id,
            node_id,
            method: method.into().to_uppercase(),
            path: path.into(),
            secret: None,
            is_active: true,
        }
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// Webhook endpoint lookup.
#[async_trait::async_trait]
pub trait WebhookStore: Send + Sync {
    /// Finds an active-or-not endpoint by workspace, method and path.
    async fn find(
        &self,
        workspace_id: WorkspaceId,
        method: &str,
        path: &str,
    ) -> Result<Option<WebhookEndpoint>, StoreError>;

    /// Registers an endpoint.
    async fn put(
        &self,
        workspace_id: WorkspaceId,
        endpoint: WebhookEndpoint,
    ) -> Result<(), StoreError>;
}

/// In-memory webhook endpoint store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWebhookStore {
    endpoints: Arc<RwLock<Vec<(WorkspaceId, WebhookEndpoint)>>>,
}

impl InMemoryWebhookStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn find(
        &self,
        workspace_id: WorkspaceId,
        method: &str,
        path: &str,
    ) -> Result<Option<WebhookEndpoint>, StoreError> {
        let endpoints = self.endpoints.read().unwrap();
        Ok(endpoints
            .iter()
            .find(|(ws, e)| {
                *ws == workspace_id && e.method == method.to_uppercase() && e.path == path
            })
            .map(|(_, e)| e.clone()))
    }

    async fn put(
        &self,
        workspace_id: WorkspaceId,
        endpoint: WebhookEndpoint,
    ) -> Result<(), StoreError> {
        let mut endpoints = self.endpoints.write().unwrap();
        let duplicate = endpoints.iter().any(|(ws, e)| {
            *ws == workspace_id && e.method == endpoint.method && e.path == endpoint.path
        });
        if duplicate {
            return Err(StoreError::Conflict {
                reason: format!(
                    "webhook path '{} {}' already registered",
                    endpoint.method, endpoint.path
                ),
            });
        }
        endpoints.push((workspace_id, endpoint));
        Ok(())
    }
}

/// An inbound webhook request, transport-agnostic.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub workspace_id: WorkspaceId,
    pub method: String,
    pub path: String,
    pub headers: JsonMap<String, JsonValue>,
    pub query: JsonMap<String, JsonValue>,
    pub body: Vec<u8>,
    /// The `X-Signature` header value, if present.
    pub signature: Option<String>,
}

/// Errors from webhook ingestion.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookError {
    /// No endpoint matches (workspace, method, path).
    NotFound,
    /// The endpoint exists but is disabled.
    Inactive,
    /// The signature did not match.
    SignatureMismatch,
    /// The body exceeded the configured cap.
    BodyTooLarge { limit: usize },
    /// The enqueue failed.
    Produce(ProduceError),
    /// Endpoint lookup failed.
    Store(StoreError),
}

impl fmt::Display for WebhookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no webhook endpoint matches"),
            Self::Inactive => write!(f, "webhook endpoint is inactive"),
            Self::SignatureMismatch => write!(f, "webhook signature mismatch"),
            Self::BodyTooLarge { limit } => {
                write!(f, "webhook body exceeds {limit} bytes")
            }
            Self::Produce(e) => write!(f, "webhook enqueue failed: {e}"),
            Self::Store(e) => write!(f, "webhook lookup failed: {e}"),
        }
    }
}

impl std::error::Error for WebhookError {}

/// Translates inbound requests into execution enqueues.
pub struct WebhookIngestor {
    store: Arc<dyn WebhookStore>,
    producer: Arc<ExecutionProducer>,
    max_body_bytes: usize,
}

impl WebhookIngestor {
    /// Creates an ingestor with the default body cap.
    #[must_use]
    pub fn new(store: Arc<dyn WebhookStore>, producer: Arc<ExecutionProducer>) -> Self {
        Self {
            store,
            producer,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Overrides the body cap.
    #[must_use]
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Ingests a request: verify, shape the trigger input, enqueue.
    ///
    /// # Errors
    ///
    /// See [`WebhookError`]; a rejected request enqueues nothing.
    pub async fn ingest(&self, request: InboundRequest) -> Result<SubmitReceipt, WebhookError> {
        if request.body.len() > self.max_body_bytes {
            return Err(WebhookError::BodyTooLarge {
                limit: self.max_body_bytes,
            });
        }

        let endpoint = self
            .store
            .find(request.workspace_id, &request.method, &request.path)
            .await
            .map_err(WebhookError::Store)?
            .ok_or(WebhookError::NotFound)?;

        if !endpoint.is_active {
            return Err(WebhookError::Inactive);
        }

        if let Some(secret) = &endpoint.secret {
            let expected = sign(secret, &request.body);
            let provided = request.signature.as_deref().unwrap_or_default();
            if expected != provided {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    "webhook signature mismatch"
                );
                return Err(WebhookError::SignatureMismatch);
            }
        }

        let body: JsonValue = serde_json::from_slice(&request.body).unwrap_or_else(|_| {
            JsonValue::String(String::from_utf8_lossy(&request.body).into_owned())
        });
        let input = json!({
            "method": request.method,
            "headers": request.headers,
            "body": body,
            "query": request.query,
        });

        self.producer
            .submit(EnqueueRequest::new(
                request.workspace_id,
                endpoint.workflow_id,
                TriggerType::Webhook,
                input,
            ))
            .await
            .map_err(WebhookError::Produce)
    }
}

/// Computes the webhook signature: `hex(sha256(secret + raw_body))`.
#[must_use]
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    let digest = hasher.finalize();

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJobQueue;
    use tideflow_engine::{
        ExecutionStore, InMemoryExecutionStore, InMemoryWorkflowStore, WorkflowStore,
    };
    use tideflow_workflow::WorkflowDefinition;

    struct Fixture {
        ingestor: WebhookIngestor,
        queue: InMemoryJobQueue,
        workspace_id: WorkspaceId,
        workflow_id: WorkflowId,
        store: Arc<InMemoryWebhookStore>,
        executions: Arc<InMemoryExecutionStore>,
    }

    async fn fixture() -> Fixture {
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let executions = Arc::new(InMemoryExecutionStore::new());
        let queue = InMemoryJobQueue::new();
        let store = Arc::new(InMemoryWebhookStore::new());

        let workflow = WorkflowDefinition::new(WorkspaceId::new(), "Hooked");
        let workspace_id = workflow.workspace_id;
        let workflow_id = workflow.id;
        workflows.put(workflow).await.unwrap();

        let producer = Arc::new(ExecutionProducer::new(
            workflows,
            executions.clone(),
            Arc::new(queue.clone()),
            None,
        ));

        Fixture {
            ingestor: WebhookIngestor::new(store.clone(), producer),
            queue,
            workspace_id,
            workflow_id,
            store,
            executions,
        }
    }

    fn request(fixture: &Fixture, body: &[u8], signature: Option<String>) -> InboundRequest {
        InboundRequest {
            workspace_id: fixture.workspace_id,
            method: "POST".to_string(),
            path: "/orders".to_string(),
            headers: [("content-type".to_string(), json!("application/json"))]
                .into_iter()
                .collect(),
            query: [("source".to_string(), json!("shop"))].into_iter().collect(),
            body: body.to_vec(),
            signature,
        }
    }

    #[tokio::test]
    async fn ingest_builds_trigger_input_and_enqueues() {
        let fixture = fixture().await;
        fixture
            .store
            .put(
                fixture.workspace_id,
                WebhookEndpoint::new(fixture.workflow_id, NodeId::new("hook"), "POST", "/orders"),
            )
            .await
            .unwrap();

        let receipt = fixture
            .ingestor
            .ingest(request(&fixture, br#"{"order": 7}"#, None))
            .await
            .unwrap();

        assert_eq!(fixture.queue.depth(), 1);
        let execution = fixture.executions.get(receipt.execution_id).await.unwrap();
        assert_eq!(execution.trigger_type, TriggerType::Webhook);
        assert_eq!(execution.input["method"], json!("POST"));
        assert_eq!(execution.input["body"]["order"], json!(7));
        assert_eq!(execution.input["query"]["source"], json!("shop"));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let fixture = fixture().await;
        let err = fixture
            .ingestor
            .ingest(request(&fixture, b"{}", None))
            .await
            .unwrap_err();
        assert_eq!(err, WebhookError::NotFound);
        assert_eq!(fixture.queue.depth(), 0);
    }

    #[tokio::test]
    async fn valid_signature_is_accepted() {
        let fixture = fixture().await;
        fixture
            .store
            .put(
                fixture.workspace_id,
                WebhookEndpoint::new(fixture.workflow_id, NodeId::new("hook"), "POST", "/orders")
                    .with_secret("s3cr3t"),
            )
            .await
            .unwrap();

        let body = br#"{"ok": true}"#;
        let signature = sign("s3cr3t", body);
        let receipt = fixture
            .ingestor
            .ingest(request(&fixture, body, Some(signature)))
            .await;
        assert!(receipt.is_ok());
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected() {
        let fixture = fixture().await;
        fixture
            .store
            .put(
                fixture.workspace_id,
                WebhookEndpoint::new(fixture.workflow_id, NodeId::new("hook"), "POST", "/orders")
                    .with_secret("s3cr3t"),
            )
            .await
            .unwrap();

        let err = fixture
            .ingestor
            .ingest(request(&fixture, b"{}", Some("bogus".to_string())))
            .await
            .unwrap_err();
        assert_eq!(err, WebhookError::SignatureMismatch);
        assert_eq!(fixture.queue.depth(), 0);
    }

    #[tokio::test]
    async fn inactive_endpoint_is_rejected() {
        let fixture = fixture().await;
        let mut endpoint =
            WebhookEndpoint::new(fixture.workflow_id, NodeId::new("hook"), "POST", "/orders");
        endpoint.is_active = false;
        fixture
            .store
            .put(fixture.workspace_id, endpoint)
            .await
            .unwrap();

        let err = fixture
            .ingestor
            .ingest(request(&fixture, b"{}", None))
            .await
            .unwrap_err();
        assert_eq!(err, WebhookError::Inactive);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let fixture = fixture().await;
        let oversized = request(&fixture, b"0123456789", None);
        let ingestor = fixture.ingestor.with_max_body_bytes(8);

        let err = ingestor.ingest(oversized).await.unwrap_err();
        assert_eq!(err, WebhookError::BodyTooLarge { limit: 8 });
    }

    #[tokio::test]
    async fn duplicate_path_registration_conflicts() {
        let fixture = fixture().await;
        fixture
            .store
            .put(
                fixture.workspace_id,
                WebhookEndpoint::new(fixture.workflow_id, NodeId::new("hook"), "POST", "/orders"),
            )
            .await
            .unwrap();

        let err = fixture
            .store
            .put(
                fixture.workspace_id,
                WebhookEndpoint::new(fixture.workflow_id, NodeId::new("hook"), "POST", "/orders"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn signature_is_hex_sha256_of_secret_plus_body() {
        let signature = sign("secret", b"body");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic.
        assert_eq!(signature, sign("secret", b"body"));
        assert_ne!(signature, sign("other", b"body"));
    }
}
