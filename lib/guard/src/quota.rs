//! Workspace quota enforcement.
//!
//! The quota guard decides, at enqueue time, whether a workspace may
//! start another execution. A refused enqueue creates no execution row.

use crate::error::QuotaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tideflow_core::WorkspaceId;

/// Plan limits for a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Executions allowed per calendar month; `None` is unlimited.
    pub max_executions_per_month: Option<u64>,
    /// Concurrently running executions allowed; `None` is unlimited.
    pub max_concurrent: Option<u64>,
}

impl PlanLimits {
    /// An unlimited plan.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_executions_per_month: None,
            max_concurrent: None,
        }
    }
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_executions_per_month: Some(10_000),
            max_concurrent: Some(25),
        }
    }
}

/// Source of current usage numbers for a workspace.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Executions started this calendar month.
    async fn executions_this_month(&self, workspace_id: WorkspaceId) -> u64;

    /// Executions currently queued or running.
    async fn in_flight(&self, workspace_id: WorkspaceId) -> u64;
}

/// Enqueue-time quota decisions.
pub struct QuotaGuard {
    limits: Arc<RwLock<HashMap<WorkspaceId, PlanLimits>>>,
    default_limits: PlanLimits,
    usage: Arc<dyn UsageSource>,
}

impl QuotaGuard {
    /// Creates a guard over a usage source with default plan limits.
    #[must_use]
    pub fn new(usage: Arc<dyn UsageSource>, default_limits: PlanLimits) -> Self {
        Self {
            limits: Arc::new(RwLock::new(HashMap::new())),
            default_limits,
            usage,
        }
    }

    /// Overrides the plan limits of one workspace.
    pub fn set_limits(&self, workspace_id: WorkspaceId, limits: PlanLimits) {
        self.limits.write().unwrap().insert(workspace_id, limits);
    }

    /// Returns the limits in effect for a workspace.
    #[must_use]
    pub fn limits_for(&self, workspace_id: WorkspaceId) -> PlanLimits {
        self.limits
            .read()
            .unwrap()
            .get(&workspace_id)
            .copied()
            .unwrap_or(self.default_limits)
    }

    /// Decides whether an enqueue is allowed for this workspace.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] naming the exhausted limit.
    pub async fn check_enqueue(&self, workspace_id: WorkspaceId) -> Result<(), QuotaError> {
        let limits = self.limits_for(workspace_id);

        if let Some(allowed) = limits.max_executions_per_month {
            let used = self.usage.executions_this_month(workspace_id).await;
            if used >= allowed {
                return Err(QuotaError::Exceeded {
                    workspace_id,
                    limit: "monthly_executions",
                    used,
                    allowed,
                });
            }
        }

        if let Some(allowed) = limits.max_concurrent {
            let used = self.usage.in_flight(workspace_id).await;
            if used >= allowed {
                return Err(QuotaError::Exceeded {
                    workspace_id,
                    limit: "concurrent_executions",
                    used,
                    allowed,
                });
            }
        }

        Ok(())
    }
}

/// In-memory usage counters, for tests and the single-node daemon.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUsage {
    monthly: Arc<RwLock<HashMap<WorkspaceId, u64>>>,
    in_flight: Arc<RwLock<HashMap<WorkspaceId, u64>>>,
}

impl InMemoryUsage {
    /// Creates empty counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an execution start.
    pub fn record_start(&self, workspace_id: WorkspaceId) {
        *self.monthly.write().unwrap().entry(workspace_id).or_insert(0) += 1;
        *self
            .in_flight
            .write()
            .unwrap()
            .entry(workspace_id)
            .or_insert(0) += 1;
    }

    /// Records an execution reaching a terminal state.
    pub fn record_finish(&self, workspace_id: WorkspaceId) {
        if let Some(count) = self.in_flight.write().unwrap().get_mut(&workspace_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl UsageSource for InMemoryUsage {
    async fn executions_this_month(&self, workspace_id: WorkspaceId) -> u64 {
        self.monthly
            .read()
            .unwrap()
            .get(&workspace_id)
            .copied()
            .unwrap_or(0)
    }

    async fn in_flight(&self, workspace_id: WorkspaceId) -> u64 {
        self.in_flight
            .read()
            .unwrap()
            .get(&workspace_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_plan_always_allows() {
        let usage = Arc::new(InMemoryUsage::new());
        let guard = QuotaGuard::new(usage.clone(), PlanLimits::unlimited());
        let ws = WorkspaceId::new();

        for _ in 0..100 {
            usage.record_start(ws);
        }
        assert!(guard.check_enqueue(ws).await.is_ok());
    }

    #[tokio::test]
    async fn monthly_limit_refuses_when_reached() {
        let usage = Arc::new(InMemoryUsage::new());
        let guard = QuotaGuard::new(
            usage.clone(),
            PlanLimits {
                max_executions_per_month: Some(2),
                max_concurrent: None,
            },
        );
        let ws = WorkspaceId::new();

        assert!(guard.check_enqueue(ws).await.is_ok());
        usage.record_start(ws);
        usage.record_start(ws);

        let err = guard.check_enqueue(ws).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Exceeded {
                limit: "monthly_executions",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn concurrent_limit_frees_up_on_finish() {
        let usage = Arc::new(InMemoryUsage::new());
        let guard = QuotaGuard::new(
            usage.clone(),
            PlanLimits {
                max_executions_per_month: None,
                max_concurrent: Some(1),
            },
        );
        let ws = WorkspaceId::new();

        usage.record_start(ws);
        assert!(guard.check_enqueue(ws).await.is_err());

        usage.record_finish(ws);
        assert!(guard.check_enqueue(ws).await.is_ok());
    }

    #[tokio::test]
    async fn per_workspace_overrides() {
        let usage = Arc::new(InMemoryUsage::new());
        let guard = QuotaGuard::new(usage.clone(), PlanLimits::default());
        let ws = WorkspaceId::new();

        guard.set_limits(ws, PlanLimits::unlimited());
        assert!(guard.limits_for(ws).max_executions_per_month.is_none());
        // Other workspaces keep the default.
        assert!(
            guard
                .limits_for(WorkspaceId::new())
                .max_executions_per_month
                .is_some()
        );
    }
}
