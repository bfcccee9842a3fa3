//! Circuit breakers for outbound calls.
//!
//! Every outbound network node call is wrapped in a breaker keyed by
//! destination host. A breaker opens after repeated failures and fails
//! fast until a cooldown elapses; a half-open probe window then decides
//! whether to close it again.

use crate::error::BreakerError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Failure ratio over the rolling window that trips the breaker.
    pub failure_ratio: f64,
    /// Minimum calls in the window before the ratio applies.
    pub min_calls: u32,
    /// Rolling window length in seconds.
    pub window_seconds: u32,
    /// How long an open breaker rejects before going half-open, in seconds.
    pub open_cooldown_seconds: u32,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_ratio: 0.5,
            min_calls: 10,
            window_seconds: 60,
            open_cooldown_seconds: 30,
            success_threshold: 2,
        }
    }
}

/// The observable state of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// Probe calls flow; outcomes decide between closed and open.
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    window_start: DateTime<Utc>,
    window_calls: u32,
    window_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl BreakerCore {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            window_start: now,
            window_calls: 0,
            window_failures: 0,
            opened_at: None,
        }
    }

    fn roll_window(&mut self, now: DateTime<Utc>, window: Duration) {
        if now - self.window_start >= window {
            self.window_start = now;
            self.window_calls = 0;
            self.window_failures = 0;
        }
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
    }
}

/// Process-wide registry of per-target circuit breakers.
///
/// Read-mostly; mutation points are locked internally.
#[derive(Debug)]
pub struct BreakerManager {
    config: BreakerConfig,
    breakers: Arc<RwLock<HashMap<String, BreakerCore>>>,
}

impl BreakerManager {
    /// Creates a manager with the given thresholds.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Checks whether a call to the target may proceed.
    ///
    /// An open breaker whose cooldown has elapsed transitions to
    /// half-open and admits the probe call.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::CircuitOpen`] while the breaker is open.
    pub fn acquire(&self, target: &str) -> Result<(), BreakerError> {
        let now = Utc::now();
        let mut breakers = self.breakers.write().unwrap();
        let core = breakers
            .entry(target.to_string())
            .or_insert_with(|| BreakerCore::new(now));

        match core.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let cooldown = Duration::seconds(i64::from(self.config.open_cooldown_seconds));
                let elapsed = core.opened_at.is_none_or(|at| now - at >= cooldown);
                if elapsed {
                    core.state = CircuitState::HalfOpen;
                    core.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(BreakerError::CircuitOpen {
                        target: target.to_string(),
                    })
                }
            }
        }
    }

    /// Records a successful call.
    pub fn on_success(&self, target: &str) {
        let now = Utc::now();
        let window = Duration::seconds(i64::from(self.config.window_seconds));
        let mut breakers = self.breakers.write().unwrap();
        let Some(core) = breakers.get_mut(target) else {
            return;
        };

        core.roll_window(now, window);
        core.window_calls += 1;
        core.consecutive_failures = 0;

        if core.state == CircuitState::HalfOpen {
            core.half_open_successes += 1;
            if core.half_open_successes >= self.config.success_threshold {
                core.state = CircuitState::Closed;
                core.opened_at = None;
            }
        }
    }

    /// Records a failed call.
    pub fn on_failure(&self, target: &str) {
        let now = Utc::now();
        let window = Duration::seconds(i64::from(self.config.window_seconds));
        let mut breakers = self.breakers.write().unwrap();
        let core = breakers
            .entry(target.to_string())
            .or_insert_with(|| BreakerCore::new(now));

        core.roll_window(now, window);
        core.window_calls += 1;
        core.window_failures += 1;
        core.consecutive_failures += 1;

        if core.state == CircuitState::HalfOpen {
            core.trip(now);
            return;
        }

        if core.consecutive_failures >= self.config.failure_threshold {
            core.trip(now);
            return;
        }

        if core.window_calls >= self.config.min_calls {
            let ratio = f64::from(core.window_failures) / f64::from(core.window_calls);
            if ratio >= self.config.failure_ratio {
                core.trip(now);
            }
        }
    }

    /// Returns the current state of a target's breaker.
    #[must_use]
    pub fn state(&self, target: &str) -> CircuitState {
        self.breakers
            .read()
            .unwrap()
            .get(target)
            .map_or(CircuitState::Closed, |core| core.state)
    }
}

impl Default for BreakerManager {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl Clone for BreakerManager {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            breakers: Arc::clone(&self.breakers),
        }
    }
}
