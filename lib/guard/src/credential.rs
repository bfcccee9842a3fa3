//! Credential references and the resolver seam.
//!
//! Workflow parameters reference credentials by ID only. Values are
//! resolved inside the node runtime through `CredentialResolver` and are
//! injected straight into outbound request headers; they never enter the
//! expression scope and are never persisted in node execution input data.

use crate::error::CredentialError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tideflow_core::CredentialId;

/// A resolved credential value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialValue {
    /// API key, optionally with a custom header name.
    ApiKey {
        key: String,
        header_name: Option<String>,
    },
    /// Bearer token.
    BearerToken { token: String },
    /// Username and password.
    BasicAuth { username: String, password: String },
}

impl CredentialValue {
    /// The header (name, value) pair this credential injects.
    #[must_use]
    pub fn header(&self) -> (String, String) {
        match self {
            Self::ApiKey { key, header_name } => (
                header_name.clone().unwrap_or_else(|| "X-Api-Key".to_string()),
                key.clone(),
            ),
            Self::BearerToken { token } => ("Authorization".to_string(), format!("Bearer {token}")),
            Self::BasicAuth { username, password } => {
                // Callers base64-encode per RFC 7617; kept raw here so the
                // secret list below covers the un-encoded form too.
                ("Authorization".to_string(), format!("Basic {username}:{password}"))
            }
        }
    }

    /// The secret fragments of this credential, for redaction.
    #[must_use]
    pub fn secrets(&self) -> Vec<&str> {
        match self {
            Self::ApiKey { key, .. } => vec![key.as_str()],
            Self::BearerToken { token } => vec![token.as_str()],
            Self::BasicAuth { password, .. } => vec![password.as_str()],
        }
    }
}

/// Resolves credential IDs to values.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolves a credential by ID.
    async fn resolve(&self, id: CredentialId) -> Result<CredentialValue, CredentialError>;

    /// Redacts any known secret values from a message.
    ///
    /// Applied to error messages before they are persisted.
    fn redact(&self, message: &str) -> String;
}

/// Replaces each secret occurrence in `message` with `***`.
#[must_use]
pub fn redact(message: &str, secrets: &[&str]) -> String {
    let mut out = message.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret, "***");
        }
    }
    out
}

/// An in-memory credential resolver for tests and the single-node daemon.
#[derive(Default, Clone)]
pub struct InMemoryCredentials {
    values: Arc<RwLock<HashMap<CredentialId, CredentialValue>>>,
}

impl InMemoryCredentials {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a credential value.
    pub fn insert(&self, id: CredentialId, value: CredentialValue) {
        self.values.write().unwrap().insert(id, value);
    }
}

#[async_trait]
impl CredentialResolver for InMemoryCredentials {
    async fn resolve(&self, id: CredentialId) -> Result<CredentialValue, CredentialError> {
        self.values
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(CredentialError::NotFound { id })
    }

    fn redact(&self, message: &str) -> String {
        let values = self.values.read().unwrap();
        let secrets: Vec<&str> = values.values().flat_map(CredentialValue::secrets).collect();
        redact(message, &secrets)
    }
}
