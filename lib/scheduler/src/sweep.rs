//! The schedule loop.
//!
//! Every tick the loop selects due schedules, computes the next fire
//! time strictly after now, and swaps it in with a compare-and-set on the
//! schedule's revision. The swap loser backs off: whoever wins the CAS
//! owns the fire, so a tick fires exactly once across competing
//! schedulers. Missed ticks during downtime coalesce into one fire
//! unless the workflow opted into catchup.

use crate::error::ScheduleError;
use crate::schedule::Schedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tideflow_core::ScheduleId;
use tideflow_engine::{StoreError, WorkflowStore};
use tideflow_queue::{EnqueueRequest, ExecutionProducer};
use tideflow_workflow::TriggerType;
use tokio_util::sync::CancellationToken;

/// Backfill cap when catchup is enabled.
const MAX_CATCHUP_FIRES: usize = 25;

/// Schedule storage.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Persists a schedule.
    async fn put(&self, schedule: Schedule) -> Result<(), StoreError>;

    /// Loads a schedule.
    async fn get(&self, id: ScheduleId) -> Result<Schedule, StoreError>;

    /// Active schedules with `next_run_at <= now`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;

    /// Compare-and-set fire: if the stored revision matches, advances
    /// `next_run_at`, records `last_run_at`, bumps `run_count` and the
    /// revision, and returns true. A mismatch means another scheduler
    /// fired this tick; returns false.
    async fn swap_next_run(
        &self,
        id: ScheduleId,
        expected_revision: u64,
        next_run_at: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// In-memory schedule store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryScheduleStore {
    schedules: Arc<RwLock<HashMap<ScheduleId, Schedule>>>,
}

impl InMemoryScheduleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn put(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.schedules
            .write()
            .unwrap()
            .insert(schedule.id, schedule);
        Ok(())
    }

    async fn get(&self, id: ScheduleId) -> Result<Schedule, StoreError> {
        self.schedules
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "schedule",
                id: id.to_string(),
            })
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        Ok(self
            .schedules
            .read()
            .unwrap()
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn swap_next_run(
        &self,
        id: ScheduleId,
        expected_revision: u64,
        next_run_at: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut schedules = self.schedules.write().unwrap();
        let schedule = schedules.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "schedule",
            id: id.to_string(),
        })?;

        if schedule.revision != expected_revision {
            return Ok(false);
        }

        schedule.next_run_at = next_run_at;
        schedule.last_run_at = Some(fired_at);
        schedule.run_count += 1;
        schedule.revision += 1;
        Ok(true)
    }
}

/// Schedule loop settings.
#[derive(Debug, Clone)]
pub struct ScheduleLoopConfig {
    /// Sweep period.
    pub tick: Duration,
}

impl Default for ScheduleLoopConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
        }
    }
}

/// The cron-driven enqueue loop.
pub struct ScheduleLoop {
    store: Arc<dyn ScheduleStore>,
    workflows: Arc<dyn WorkflowStore>,
    producer: Arc<ExecutionProducer>,
    config: ScheduleLoopConfig,
}

impl ScheduleLoop {
    /// Creates the loop.
    #[must_use]
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        workflows: Arc<dyn WorkflowStore>,
        producer: Arc<ExecutionProducer>,
        config: ScheduleLoopConfig,
    ) -> Self {
        Self {
            store,
            workflows,
            producer,
            config,
        }
    }

    /// Runs sweeps until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut timer = tokio::time::interval(self.config.tick);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(tick_secs = self.config.tick.as_secs(), "schedule loop started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::warn!(error = %e, "schedule sweep failed");
                    }
                }
            }
        }
        tracing::info!("schedule loop stopped");
    }

    /// One sweep over the due schedules; returns the number of fires
    /// enqueued.
    ///
    /// # Errors
    ///
    /// Returns storage failures; per-schedule failures are logged and
    /// skipped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self.store.due(now).await?;
        let mut fired = 0;

        for schedule in due {
            match self.fire(&schedule, now).await {
                Ok(count) => fired += count,
                Err(e) => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "schedule fire failed"
                    );
                }
            }
        }

        Ok(fired)
    }

    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<usize, SweepFailure> {
        let Some(due_at) = schedule.next_run_at else {
            return Ok(0);
        };
        let cron = schedule.cron_schedule();

        // Strictly after now: missed ticks during downtime are skipped
        // here and handled below.
        let next_run_at = cron.next_after(now)?;

        let swapped = self
            .store
            .swap_next_run(schedule.id, schedule.revision, next_run_at, due_at)
            .await?;
        if !swapped {
            // Another scheduler owned this tick.
            return Ok(0);
        }

        let definition = self.workflows.get(schedule.workflow_id, None).await?;
        let fires: Vec<DateTime<Utc>> = if definition.settings.catchup {
            let mut missed =
                cron.ticks_between(due_at, now, MAX_CATCHUP_FIRES.saturating_sub(1))?;
            let mut fires = vec![due_at];
            fires.append(&mut missed);
            fires
        } else {
            // Coalesced: one fire covers the whole missed window.
            vec![due_at]
        };

        let mut enqueued = 0;
        for fired_at in fires {
            let request = EnqueueRequest::new(
                definition.workspace_id,
                schedule.workflow_id,
                TriggerType::Schedule,
                schedule.input.clone(),
            )
            .with_idempotency_key(schedule.idempotency_key(fired_at));

            match self.producer.submit(request).await {
                Ok(receipt) => {
                    enqueued += 1;
                    tracing::info!(
                        schedule_id = %schedule.id,
                        execution_id = %receipt.execution_id,
                        fired_at = %fired_at,
                        "schedule fired"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "schedule enqueue refused"
                    );
                }
            }
        }

        Ok(enqueued)
    }
}

/// Internal failure union for one schedule fire.
#[derive(Debug)]
enum SweepFailure {
    Cron(ScheduleError),
    Store(StoreError),
}

impl std::fmt::Display for SweepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl From<ScheduleError> for SweepFailure {
    fn from(e: ScheduleError) -> Self {
        Self::Cron(e)
    }
}

impl From<StoreError> for SweepFailure {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
