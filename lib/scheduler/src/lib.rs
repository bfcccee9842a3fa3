//! Cron scheduling for the tideflow platform.
//!
//! - **CronSchedule**: DST-correct next-run computation over IANA
//!   timezones
//! - **Schedule**: the persisted schedule entity with an optimistic
//!   revision for compare-and-swap firing
//! - **ScheduleLoop**: the periodic sweep that fires due schedules
//!   exactly once per tick across competing schedulers

pub mod error;
pub mod schedule;
pub mod sweep;

pub use error::ScheduleError;
pub use schedule::{CronSchedule, Schedule};
pub use sweep::{InMemoryScheduleStore, ScheduleLoop, ScheduleLoopConfig, ScheduleStore};
