//! Centralized worker configuration.
//!
//! Strongly-typed configuration loaded via the `config` crate from
//! environment variables with a `__` separator (e.g.
//! `QUEUE__VISIBILITY_TIMEOUT_SECONDS=900`).

use serde::Deserialize;

/// Worker daemon configuration.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Schedule loop configuration.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Wait sweeper configuration.
    #[serde(default)]
    pub wait: WaitConfig,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

/// Broker queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Visibility timeout for leased jobs, in seconds. Must exceed the
    /// longest per-execution timeout.
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,

    /// Broker delivery attempts before a job is dropped.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
}

fn default_visibility_timeout_seconds() -> u64 {
    15 * 60
}

fn default_max_deliver() -> i64 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
            max_deliver: default_max_deliver(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Concurrent workers; defaults to the CPU count.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Worker-side attempts before a transient failure becomes
    /// permanent.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lease extension period, in seconds.
    #[serde(default = "default_extend_every_seconds")]
    pub extend_every_seconds: u64,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZero::get)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_extend_every_seconds() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            extend_every_seconds: default_extend_every_seconds(),
        }
    }
}

/// Schedule loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Sweep period, in seconds.
    #[serde(default = "default_schedule_tick_seconds")]
    pub tick_seconds: u64,
}

fn default_schedule_tick_seconds() -> u64 {
    10
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_schedule_tick_seconds(),
        }
    }
}

/// Wait timeout sweeper settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WaitConfig {
    /// Sweep period, in seconds.
    #[serde(default = "default_wait_tick_seconds")]
    pub tick_seconds: u64,
}

fn default_wait_tick_seconds() -> u64 {
    30
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_wait_tick_seconds(),
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.visibility_timeout_seconds, 900);
        assert_eq!(config.max_deliver, 3);
    }

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert!(config.concurrency >= 1);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn schedule_tick_default() {
        assert_eq!(ScheduleConfig::default().tick_seconds, 10);
    }
}
