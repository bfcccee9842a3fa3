//! Durable suspension and resumption.
//!
//! A wait node returns `Suspend`; the engine persists a waiting row with
//! an unforgeable resume token, transitions the execution to `waiting`,
//! and releases the worker. Resumption arrives either through the resume
//! endpoint (token lookup, pending→resumed compare-and-set, exactly one
//! winner) or through the timeout sweeper, which resumes with a synthetic
//! timed-out payload.

use crate::store::StoreError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tideflow_core::ExecutionId;
use tideflow_workflow::NodeId;

/// The lifecycle of a waiting execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    /// Awaiting a resume or the timeout.
    Pending,
    /// Resumed by the callback.
    Resumed,
    /// The timeout sweeper expired it.
    Expired,
    /// The owning execution was cancelled.
    Cancelled,
}

/// A durably suspended execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingExecution {
    /// The suspended execution.
    pub execution_id: ExecutionId,
    /// The wait node it is suspended at.
    pub node_id: NodeId,
    /// Opaque, URL-safe, high-entropy resume token.
    pub token: String,
    /// When the wait expires.
    pub timeout_at: DateTime<Utc>,
    /// Row status.
    pub status: WaitStatus,
    /// Metadata recorded at suspension; replaced by the resume payload.
    pub payload: JsonValue,
}

/// Errors from resume attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// No pending wait matches the token.
    InvalidToken,
    /// The wait already timed out.
    Expired,
    /// A concurrent resume already won.
    AlreadyResumed,
    /// Storage failure.
    Store(StoreError),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "invalid resume token"),
            Self::Expired => write!(f, "wait expired"),
            Self::AlreadyResumed => write!(f, "already resumed"),
            Self::Store(e) => write!(f, "wait store error: {e}"),
        }
    }
}

impl std::error::Error for WaitError {}

impl From<StoreError> for WaitError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// A resume ready to be enqueued as a resume job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    /// The execution to resume.
    pub execution_id: ExecutionId,
    /// The wait node whose output becomes `payload`.
    pub node_id: NodeId,
    /// The resume payload.
    pub payload: JsonValue,
}

/// Storage for waiting executions.
#[async_trait]
pub trait WaitStore: Send + Sync {
    /// Persists a new waiting row.
    async fn create(&self, waiting: WaitingExecution) -> Result<(), StoreError>;

    /// Atomically claims a pending token: pending→resumed with the given
    /// payload. Exactly one concurrent claim wins.
    async fn claim(
        &self,
        token: &str,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<WaitingExecution, WaitError>;

    /// Marks pending rows past their timeout as expired and returns them.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<WaitingExecution>, StoreError>;

    /// Cancels any pending wait for an execution.
    async fn cancel_for(&self, execution_id: ExecutionId) -> Result<(), StoreError>;

    /// Returns the pending wait for an execution, if any.
    async fn pending_for(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<WaitingExecution>, StoreError>;
}

/// In-memory wait store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWaitStore {
    rows: Arc<RwLock<HashMap<String, WaitingExecution>>>,
}

impl InMemoryWaitStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaitStore for InMemoryWaitStore {
    async fn create(&self, waiting: WaitingExecution) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap();
        if rows.contains_key(&waiting.token) {
            return Err(StoreError::Conflict {
                reason: "token collision".to_string(),
            });
        }
        rows.insert(waiting.token.clone(), waiting);
        Ok(())
    }

    async fn claim(
        &self,
        token: &str,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<WaitingExecution, WaitError> {
        let mut rows = self.rows.write().unwrap();
        let row = rows.get_mut(token).ok_or(WaitError::InvalidToken)?;

        match row.status {
            WaitStatus::Resumed => return Err(WaitError::AlreadyResumed),
            WaitStatus::Expired | WaitStatus::Cancelled => return Err(WaitError::Expired),
            WaitStatus::Pending => {}
        }
        if now >= row.timeout_at {
            row.status = WaitStatus::Expired;
            return Err(WaitError::Expired);
        }

        row.status = WaitStatus::Resumed;
        row.payload = payload;
        Ok(row.clone())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<WaitingExecution>, StoreError> {
        let mut rows = self.rows.write().unwrap();
        let mut expired = Vec::new();
        for row in rows.values_mut() {
            if row.status == WaitStatus::Pending && row.timeout_at <= now {
                row.status = WaitStatus::Expired;
                expired.push(row.clone());
            }
        }
        Ok(expired)
    }

    async fn cancel_for(&self, execution_id: ExecutionId) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap();
        for row in rows.values_mut() {
            if row.execution_id == execution_id && row.status == WaitStatus::Pending {
                row.status = WaitStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn pending_for(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<WaitingExecution>, StoreError> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .values()
            .find(|row| row.execution_id == execution_id && row.status == WaitStatus::Pending)
            .cloned())
    }
}

/// Coordinates suspension and resumption of executions.
pub struct WaitManager {
    store: Arc<dyn WaitStore>,
}

impl WaitManager {
    /// Creates a manager over a wait store.
    #[must_use]
    pub fn new(store: Arc<dyn WaitStore>) -> Self {
        Self { store }
    }

    /// Mints an unforgeable, URL-safe resume token.
    #[must_use]
    pub fn mint_token() -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Persists a waiting row for a suspended execution.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn begin(
        &self,
        execution_id: ExecutionId,
        node_id: NodeId,
        timeout: std::time::Duration,
        metadata: JsonValue,
    ) -> Result<WaitingExecution, StoreError> {
        let timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let waiting = WaitingExecution {
            execution_id,
            node_id,
            token: Self::mint_token(),
            timeout_at: Utc::now() + timeout,
            status: WaitStatus::Pending,
            payload: metadata,
        };
        self.store.create(waiting.clone()).await?;
        Ok(waiting)
    }

    /// Resumes by token. Exactly one concurrent caller wins.
    ///
    /// # Errors
    ///
    /// `InvalidToken`, `Expired`, or `AlreadyResumed` per the row state.
    pub async fn resume(
        &self,
        token: &str,
        payload: JsonValue,
    ) -> Result<ResumeRequest, WaitError> {
        let row = self.store.claim(token, payload.clone(), Utc::now()).await?;
        tracing::info!(
            execution_id = %row.execution_id,
            node_id = %row.node_id,
            "wait resumed by callback"
        );
        Ok(ResumeRequest {
            execution_id: row.execution_id,
            node_id: row.node_id,
            payload,
        })
    }

    /// Expires due waits and returns synthetic timed-out resumes.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<ResumeRequest>, StoreError> {
        let expired = self.store.expire_due(now).await?;
        Ok(expired
            .into_iter()
            .map(|row| ResumeRequest {
                execution_id: row.execution_id,
                node_id: row.node_id,
                payload: json!({"timed_out": true}),
            })
            .collect())
    }

    /// Cancels pending waits for an execution.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn cancel_for(&self, execution_id: ExecutionId) -> Result<(), StoreError> {
        self.store.cancel_for(execution_id).await
    }
}
