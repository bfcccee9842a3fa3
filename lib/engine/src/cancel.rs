//! Cluster-wide cancellation.
//!
//! The initiator persists the cancel intent and publishes a notice on the
//! cancel bus. Every worker subscribes; the worker holding the execution
//! cancels its per-execution token, which propagates to the in-flight
//! node's context. A cancel issued before any worker leased the job is
//! caught by the queued→running transition check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tideflow_core::{ExecutionId, UserId};
use tokio_util::sync::CancellationToken;

/// A cancellation request for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelNotice {
    /// The execution to cancel.
    pub execution_id: ExecutionId,
    /// Why it was cancelled.
    pub reason: String,
    /// Who requested the cancellation, if a user did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<UserId>,
    /// When the cancellation was requested.
    pub at: DateTime<Utc>,
}

impl CancelNotice {
    /// Creates a notice timestamped now.
    #[must_use]
    pub fn new(execution_id: ExecutionId, reason: impl Into<String>) -> Self {
        Self {
            execution_id,
            reason: reason.into(),
            requested_by: None,
            at: Utc::now(),
        }
    }
}

/// Errors from the cancel bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelBusError {
    /// Publishing the notice failed.
    Publish { message: String },
    /// Subscribing to notices failed.
    Subscribe { message: String },
}

impl fmt::Display for CancelBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish { message } => write!(f, "cancel publish failed: {message}"),
            Self::Subscribe { message } => write!(f, "cancel subscribe failed: {message}"),
        }
    }
}

impl std::error::Error for CancelBusError {}

/// Broker pub/sub channel for cancellation notices.
#[async_trait]
pub trait CancelBus: Send + Sync {
    /// Publishes a notice to every worker.
    async fn publish(&self, notice: &CancelNotice) -> Result<(), CancelBusError>;

    /// Subscribes to all cancellation notices.
    async fn subscribe(&self) -> Result<BoxStream<'static, CancelNotice>, CancelBusError>;
}

/// An in-process cancel bus over a tokio broadcast channel, for tests and
/// the single-node daemon.
pub struct LocalCancelBus {
    sender: tokio::sync::broadcast::Sender<CancelNotice>,
}

impl LocalCancelBus {
    /// Creates a bus with a small buffer.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(64);
        Self { sender }
    }
}

impl Default for LocalCancelBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CancelBus for LocalCancelBus {
    async fn publish(&self, notice: &CancelNotice) -> Result<(), CancelBusError> {
        // No subscribers is fine; the queued→running check still catches it.
        let _ = self.sender.send(notice.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, CancelNotice>, CancelBusError> {
        let receiver = self.sender.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(notice) => return Some((notice, receiver)),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Tracks the executions in flight on this worker and their cancel
/// tokens.
#[derive(Default)]
pub struct CancellationManager {
    active: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl CancellationManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an execution at job start; returns its cancel token.
    pub fn register(&self, execution_id: ExecutionId) -> CancellationToken {
        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap()
            .insert(execution_id, token.clone());
        token
    }

    /// Unregisters an execution when its job finishes.
    pub fn unregister(&self, execution_id: ExecutionId) {
        self.active.lock().unwrap().remove(&execution_id);
    }

    /// Cancels an execution held by this worker.
    ///
    /// Returns false when this worker does not hold it.
    pub fn cancel_local(&self, execution_id: ExecutionId) -> bool {
        match self.active.lock().unwrap().get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// The executions currently in flight on this worker.
    #[must_use]
    pub fn active_executions(&self) -> Vec<ExecutionId> {
        self.active.lock().unwrap().keys().copied().collect()
    }

    /// Listens on the bus and cancels matching local executions until
    /// `shutdown` fires.
    pub async fn run_listener(
        self: Arc<Self>,
        bus: Arc<dyn CancelBus>,
        shutdown: CancellationToken,
    ) {
        let mut stream = match bus.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "cancel bus subscription failed");
                return;
            }
        };

        use futures::StreamExt;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                notice = stream.next() => {
                    let Some(notice) = notice else { break };
                    if self.cancel_local(notice.execution_id) {
                        tracing::info!(
                            execution_id = %notice.execution_id,
                            reason = %notice.reason,
                            "cancelled local execution"
                        );
                    }
                }
            }
        }
    }
}
