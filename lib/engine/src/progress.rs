//! Live execution progress.
//!
//! Best-effort, TTL-bound snapshots written on every node state change.
//! Writes are fire-and-forget: a failing progress store never fails an
//! execution. Readers fall back to the execution row on a miss.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tideflow_core::ExecutionId;
use tideflow_workflow::{Execution, ExecutionStatus, NodeId};

/// A point-in-time view of a live execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// The execution this snapshot describes.
    pub execution_id: ExecutionId,
    /// Execution status at snapshot time.
    pub status: ExecutionStatus,
    /// The node currently (or last) dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeId>,
    /// Nodes finished so far.
    pub nodes_completed: u32,
    /// Nodes the schedule planned.
    pub nodes_total: u32,
    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Derives a snapshot from a persisted execution row (cache-miss
    /// fallback).
    #[must_use]
    pub fn from_execution(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id,
            status: execution.status,
            current_node: None,
            nodes_completed: execution.nodes_completed,
            nodes_total: execution.nodes_total,
            updated_at: execution.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Short-lived cache of live execution progress.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Records a snapshot. Best-effort: implementations log failures and
    /// never surface them.
    async fn record(&self, snapshot: ProgressSnapshot);

    /// Fetches the latest snapshot for an execution, if still cached.
    async fn fetch(&self, execution_id: ExecutionId) -> Option<ProgressSnapshot>;
}

/// In-memory TTL'd progress store.
#[derive(Debug)]
pub struct InMemoryProgressStore {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<ExecutionId, (ProgressSnapshot, DateTime<Utc>)>>>,
}

impl InMemoryProgressStore {
    /// Creates a store with the given time-to-live.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn record(&self, snapshot: ProgressSnapshot) {
        let expires_at = Utc::now() + self.ttl;
        self.entries
            .write()
            .unwrap()
            .insert(snapshot.execution_id, (snapshot, expires_at));
    }

    async fn fetch(&self, execution_id: ExecutionId) -> Option<ProgressSnapshot> {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap();
        match entries.get(&execution_id) {
            Some((_, expires_at)) if *expires_at <= now => {
                entries.remove(&execution_id);
                None
            }
            Some((snapshot, _)) => Some(snapshot.clone()),
            None => None,
        }
    }
}
