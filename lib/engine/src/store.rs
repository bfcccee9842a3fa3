//! Persistence seams for the engine.
//!
//! Storage layout is external to the core: the engine reads and writes
//! through these traits. The in-memory implementations back the test
//! suite and the single-node daemon.
//!
//! `ExecutionStore::finish` is the compare-and-set that guarantees an
//! execution transitions to a terminal status at most once.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use tideflow_core::{ExecutionId, WorkflowId};
use tideflow_workflow::{
    Execution, ExecutionFailure, ExecutionStatus, NodeExecution, WorkflowDefinition,
};

/// Errors from storage operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Entity not found.
    NotFound { entity: &'static str, id: String },
    /// A compare-and-set or uniqueness constraint failed.
    Conflict { reason: String },
    /// Backend failure.
    Backend { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict { reason } => write!(f, "storage conflict: {reason}"),
            Self::Backend { reason } => write!(f, "storage backend failure: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Versioned workflow definition storage.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Stores a definition under its (id, version).
    async fn put(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    /// Loads a definition. `version: None` loads the latest.
    async fn get(
        &self,
        id: WorkflowId,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition, StoreError>;
}

/// Execution row storage.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Creates a new execution row.
    async fn create(&self, execution: Execution) -> Result<(), StoreError>;

    /// Loads an execution.
    async fn get(&self, id: ExecutionId) -> Result<Execution, StoreError>;

    /// Updates non-terminal execution fields (counts, waiting status).
    async fn update(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Transitions queued → running.
    ///
    /// Returns false when the execution is not queued (for example,
    /// cancelled before any worker leased it).
    async fn try_start(&self, id: ExecutionId) -> Result<bool, StoreError>;

    /// Transitions waiting → running on resume.
    ///
    /// Returns false when the execution is not waiting.
    async fn try_resume(&self, id: ExecutionId) -> Result<bool, StoreError>;

    /// Transitions to a terminal status.
    ///
    /// Returns false when the execution is already terminal; the caller's
    /// transition is then a no-op. This is the at-most-once terminal CAS.
    async fn finish(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<ExecutionFailure>,
    ) -> Result<bool, StoreError>;
}

/// Node execution row storage.
#[async_trait]
pub trait NodeRunStore: Send + Sync {
    /// Inserts or updates a node execution row by its id.
    async fn record(&self, run: NodeExecution) -> Result<(), StoreError>;

    /// Lists rows for an execution in dispatch-sequence order.
    async fn list(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecution>, StoreError>;
}

/// In-memory workflow store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWorkflowStore {
    definitions: Arc<RwLock<HashMap<WorkflowId, BTreeMap<u32, WorkflowDefinition>>>>,
}

impl InMemoryWorkflowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn put(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let mut definitions = self.definitions.write().unwrap();
        definitions
            .entry(definition.id)
            .or_default()
            .insert(definition.version, definition);
        Ok(())
    }

    async fn get(
        &self,
        id: WorkflowId,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition, StoreError> {
        let definitions = self.definitions.read().unwrap();
        let versions = definitions.get(&id).ok_or_else(|| StoreError::NotFound {
            entity: "workflow",
            id: id.to_string(),
        })?;

        let found = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };

        found.cloned().ok_or_else(|| StoreError::NotFound {
            entity: "workflow",
            id: format!("{id}@{version:?}"),
        })
    }
}

/// In-memory execution store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryExecutionStore {
    executions: Arc<RwLock<HashMap<ExecutionId, Execution>>>,
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().unwrap();
        if executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict {
                reason: format!("execution {} already exists", execution.id),
            });
        }
        executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        self.executions
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "execution",
                id: id.to_string(),
            })
    }

    async fn update(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().unwrap();
        let stored = executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "execution",
                id: execution.id.to_string(),
            })?;
        // Terminal rows are owned by `finish`; plain updates must not
        // overwrite a terminal status.
        if stored.status.is_terminal() && !execution.status.is_terminal() {
            return Ok(());
        }
        *stored = execution.clone();
        Ok(())
    }

    async fn try_start(&self, id: ExecutionId) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let stored = executions.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "execution",
            id: id.to_string(),
        })?;
        if stored.status != ExecutionStatus::Queued {
            return Ok(false);
        }
        stored.start();
        Ok(true)
    }

    async fn try_resume(&self, id: ExecutionId) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let stored = executions.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "execution",
            id: id.to_string(),
        })?;
        if stored.status != ExecutionStatus::Waiting {
            return Ok(false);
        }
        stored.resume();
        Ok(true)
    }

    async fn finish(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<ExecutionFailure>,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().unwrap();
        let stored = executions.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "execution",
            id: id.to_string(),
        })?;
        if stored.status.is_terminal() {
            return Ok(false);
        }
        match status {
            ExecutionStatus::Completed => stored.complete(),
            ExecutionStatus::Failed => stored.fail(error.clone().unwrap_or(ExecutionFailure {
                message: "execution failed".to_string(),
                node_id: None,
            })),
            ExecutionStatus::Cancelled => {
                let reason = error
                    .clone()
                    .map_or_else(|| "Cancelled by user".to_string(), |e| e.message);
                stored.cancel(reason);
            }
            ExecutionStatus::TimedOut => stored.time_out(),
            other => {
                return Err(StoreError::Conflict {
                    reason: format!("{other:?} is not a terminal status"),
                });
            }
        }
        Ok(true)
    }
}

/// In-memory node execution store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryNodeRunStore {
    runs: Arc<RwLock<HashMap<ExecutionId, Vec<NodeExecution>>>>,
}

impl InMemoryNodeRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRunStore for InMemoryNodeRunStore {
    async fn record(&self, run: NodeExecution) -> Result<(), StoreError> {
        let mut runs = self.runs.write().unwrap();
        let rows = runs.entry(run.execution_id).or_default();
        match rows.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run,
            None => rows.push(run),
        }
        Ok(())
    }

    async fn list(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecution>, StoreError> {
        let runs = self.runs.read().unwrap();
        let mut rows = runs.get(&execution_id).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.sequence);
        Ok(rows)
    }
}
