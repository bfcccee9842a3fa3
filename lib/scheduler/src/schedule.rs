//! Cron schedules and the persisted schedule entity.

use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use tideflow_core::{ScheduleId, WorkflowId};

/// A cron expression evaluated in an IANA timezone.
///
/// Workflow definitions use the 5-field cron form; the parser is fed a
/// zero seconds field. Next-run computation converts through the
/// schedule's timezone, so daylight-saving transitions are handled by
/// chrono-tz rather than by naive arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    /// The 5-field cron expression.
    pub expression: String,
    /// IANA timezone name (e.g. "Europe/Berlin"); defaults to UTC.
    pub timezone: Option<String>,
}

impl CronSchedule {
    /// Creates a UTC schedule.
    #[must_use]
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            timezone: None,
        }
    }

    /// Sets the timezone.
    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    fn parsed(&self) -> Result<cron::Schedule, ScheduleError> {
        let with_seconds = format!("0 {}", self.expression);
        cron::Schedule::from_str(&with_seconds).map_err(|e| {
            ScheduleError::InvalidCronExpression {
                expression: self.expression.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn tz(&self) -> Result<Tz, ScheduleError> {
        let name = self.timezone.as_deref().unwrap_or("UTC");
        Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone {
            timezone: name.to_string(),
        })
    }

    /// Validates the expression and timezone.
    ///
    /// # Errors
    ///
    /// Returns the specific parse failure.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.parsed()?;
        self.tz()?;
        Ok(())
    }

    /// The next tick strictly after the given instant, DST-correct in
    /// the schedule's timezone.
    ///
    /// # Errors
    ///
    /// Returns parse failures; `Ok(None)` means the expression has no
    /// future tick.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let schedule = self.parsed()?;
        let tz = self.tz()?;
        let local = after.with_timezone(&tz);
        Ok(schedule.after(&local).next().map(|t| t.with_timezone(&Utc)))
    }

    /// The ticks in `(start, end]`, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns parse failures.
    pub fn ticks_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let schedule = self.parsed()?;
        let tz = self.tz()?;
        let local = start.with_timezone(&tz);
        Ok(schedule
            .after(&local)
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= end)
            .take(limit)
            .collect())
    }
}

/// A persisted workflow schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique identifier.
    pub id: ScheduleId,
    /// The workflow this schedule fires.
    pub workflow_id: WorkflowId,
    /// The 5-field cron expression.
    pub cron: String,
    /// IANA timezone name.
    pub timezone: String,
    /// Input data for fired executions.
    pub input: JsonValue,
    /// Whether this schedule fires.
    pub is_active: bool,
    /// The next computed fire time.
    pub next_run_at: Option<DateTime<Utc>>,
    /// When the schedule last fired.
    pub last_run_at: Option<DateTime<Utc>>,
    /// How many times it has fired.
    pub run_count: u64,
    /// Optimistic concurrency revision; bumped on every fire swap.
    pub revision: u64,
}

impl Schedule {
    /// Creates an active schedule with its first run computed from now.
    ///
    /// # Errors
    ///
    /// Returns cron/timezone validation failures.
    pub fn new(
        workflow_id: WorkflowId,
        cron: impl Into<String>,
        timezone: impl Into<String>,
        input: JsonValue,
    ) -> Result<Self, ScheduleError> {
        let cron = cron.into();
        let timezone = timezone.into();
        let cron_schedule = CronSchedule::new(cron.clone()).with_timezone(timezone.clone());
        cron_schedule.validate()?;
        let next_run_at = cron_schedule.next_after(Utc::now())?;

        Ok(Self {
            id: ScheduleId::new(),
            workflow_id,
            cron,
            timezone,
            input,
            is_active: true,
            next_run_at,
            last_run_at: None,
            run_count: 0,
            revision: 0,
        })
    }

    /// The cron evaluator for this schedule.
    #[must_use]
    pub fn cron_schedule(&self) -> CronSchedule {
        CronSchedule::new(self.cron.clone()).with_timezone(self.timezone.clone())
    }

    /// Returns true when the schedule should fire at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// The idempotency key for a fire at the given instant.
    #[must_use]
    pub fn idempotency_key(&self, fired_at: DateTime<Utc>) -> String {
        format!(
            "schedule:{}:{}",
            self.id,
            fired_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn five_field_expression_parses() {
        let schedule = CronSchedule::new("*/5 * * * *");
        assert!(schedule.validate().is_ok());
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let schedule = CronSchedule::new("not a cron");
        assert!(matches!(
            schedule.validate(),
            Err(ScheduleError::InvalidCronExpression { .. })
        ));
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        let schedule = CronSchedule::new("0 7 * * *").with_timezone("Mars/Olympus");
        assert!(matches!(
            schedule.validate(),
            Err(ScheduleError::InvalidTimezone { .. })
        ));
    }

    #[test]
    fn next_after_is_strictly_in_the_future() {
        let schedule = CronSchedule::new("*/5 * * * *");
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap();

        let next = schedule.next_after(at).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 10, 0).unwrap());
        assert!(next > at);
    }

    #[test]
    fn next_after_respects_timezone() {
        // 07:00 in New York is 12:00 UTC in winter (EST, UTC-5).
        let schedule = CronSchedule::new("0 7 * * *").with_timezone("America/New_York");
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();

        let next = schedule.next_after(at).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap());
    }

    #[test]
    fn dst_transition_keeps_local_fire_time() {
        // US DST starts 2026-03-08: 07:00 New York shifts from 12:00 UTC
        // to 11:00 UTC.
        let schedule = CronSchedule::new("0 7 * * *").with_timezone("America/New_York");

        let before = Utc.with_ymd_and_hms(2026, 3, 7, 13, 0, 0).unwrap();
        let next = schedule.next_after(before).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 8, 11, 0, 0).unwrap());
    }

    #[test]
    fn ticks_between_caps_and_bounds() {
        let schedule = CronSchedule::new("*/5 * * * *");
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 12, 20, 0).unwrap();

        let ticks = schedule.ticks_between(start, end, 100).unwrap();
        assert_eq!(ticks.len(), 4); // 12:05, 12:10, 12:15, 12:20
        assert!(ticks.iter().all(|t| *t > start && *t <= end));

        let capped = schedule.ticks_between(start, end, 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn new_schedule_computes_first_run() {
        let schedule =
            Schedule::new(WorkflowId::new(), "*/5 * * * *", "UTC", json!({})).unwrap();
        assert!(schedule.is_active);
        assert!(schedule.next_run_at.is_some());
        assert!(schedule.next_run_at.unwrap() > Utc::now() - chrono::Duration::minutes(5));
        assert_eq!(schedule.run_count, 0);
    }

    #[test]
    fn invalid_schedule_creation_fails() {
        let result = Schedule::new(WorkflowId::new(), "bogus", "UTC", json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn due_check() {
        let mut schedule =
            Schedule::new(WorkflowId::new(), "*/5 * * * *", "UTC", json!({})).unwrap();
        let now = Utc::now();

        schedule.next_run_at = Some(now - chrono::Duration::minutes(1));
        assert!(schedule.is_due(now));

        schedule.next_run_at = Some(now + chrono::Duration::minutes(1));
        assert!(!schedule.is_due(now));

        schedule.next_run_at = Some(now - chrono::Duration::minutes(1));
        schedule.is_active = false;
        assert!(!schedule.is_due(now));
    }

    #[test]
    fn idempotency_key_format() {
        let schedule =
            Schedule::new(WorkflowId::new(), "*/5 * * * *", "UTC", json!({})).unwrap();
        let fired_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap();

        let key = schedule.idempotency_key(fired_at);
        assert!(key.starts_with("schedule:sched_"));
        assert!(key.ends_with("2026-03-01T12:05:00Z"));
        // Same instant, same key.
        assert_eq!(key, schedule.idempotency_key(fired_at));
    }
}
