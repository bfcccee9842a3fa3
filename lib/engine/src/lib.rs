//! Workflow execution engine for the tideflow platform.
//!
//! This crate runs validated workflow graphs:
//!
//! - **Node Registry**: type string → metadata + executable handler
//! - **Node Runtime**: parameter resolution, timeouts, retries, redaction
//! - **DAG Scheduler**: ready-queue dispatch with branching, fan-in,
//!   conditional skips and loop sub-schedules
//! - **Engine Facade**: `run`, `preview`, `cancel`, `retry`, `replay`,
//!   `resume`
//! - **Cancellation**: cluster-wide cancel signal over a pub/sub bus
//! - **Wait/Resume**: durable suspension with unforgeable resume tokens
//! - **Progress**: best-effort TTL'd live execution snapshots
//!
//! Persistence is reached only through the traits in [`store`]; in-memory
//! implementations back the tests and the single-node daemon.

pub mod cancel;
pub mod context;
pub mod engine;
pub mod error;
pub mod nodes;
pub mod progress;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod wait;

pub use cancel::{CancelBus, CancelBusError, CancelNotice, CancellationManager, LocalCancelBus};
pub use context::{LoopFrame, NodeContext};
pub use engine::{Engine, EngineDeps, PlannedNode, PreviewReport};
pub use error::{EngineError, ErrorKind, NodeError};
pub use progress::{InMemoryProgressStore, ProgressSnapshot, ProgressStore};
pub use registry::{NodeHandler, NodeOutcome, NodeRegistry};
pub use scheduler::RunOutcome;
pub use store::{
    ExecutionStore, InMemoryExecutionStore, InMemoryNodeRunStore, InMemoryWorkflowStore,
    NodeRunStore, StoreError, WorkflowStore,
};
pub use wait::{
    InMemoryWaitStore, ResumeRequest, WaitError, WaitManager, WaitStatus, WaitStore,
    WaitingExecution,
};
