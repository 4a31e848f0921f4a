//! Circuit breaker guarding a single upstream dependency.

use crate::errors::CircuitOpenError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; every request is admitted.
    #[default]
    Closed,
    /// Failing fast until the open timeout elapses.
    Open,
    /// Probing whether the dependency recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before opening.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to stay `Open` before admitting a probe.
    #[serde(default = "default_open_timeout")]
    pub open_timeout_seconds: f64,
    /// Successes in `HalfOpen` required to close again.
    #[serde(default = "default_half_open_successes")]
    pub half_open_required_successes: u32,
    /// Failed recoveries in a row before the breaker reports itself unrecoverable.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout() -> f64 {
    60.0
}

fn default_half_open_successes() -> u32 {
    2
}

fn default_max_recovery_attempts() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_seconds: default_open_timeout(),
            half_open_required_successes: default_half_open_successes(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the open timeout.
    #[must_use]
    pub fn with_open_timeout_seconds(mut self, seconds: f64) -> Self {
        self.open_timeout_seconds = seconds;
        self
    }

    /// Sets the successes required to close from half-open.
    #[must_use]
    pub fn with_half_open_required_successes(mut self, successes: u32) -> Self {
        self.half_open_required_successes = successes;
        self
    }

    /// Sets the recovery attempt limit.
    #[must_use]
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Returns the open timeout as a duration, saturating at [`Duration::MAX`].
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.open_timeout_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Dependency name.
    pub service: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures counted toward opening (or while recovering).
    pub failure_count: u32,
    /// Successes observed in half-open.
    pub success_count: u32,
    /// Failed recoveries in a row.
    pub consecutive_recovery_failures: u32,
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    consecutive_recovery_failures: u32,
}

/// Failure-tracking gate for one upstream dependency.
///
/// The three counters live behind one narrow mutex; each public call is a
/// single short critical section and never awaits while holding it. Half-open
/// admission is relaxed: every request arriving while `HalfOpen` is admitted,
/// and the first reported failure sends the breaker back to `Open`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the named dependency.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Returns the dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the stored state without evaluating the open timeout.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns the current failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Decides whether a call may proceed.
    ///
    /// An `Open` breaker whose timeout has elapsed moves to `HalfOpen` and
    /// admits the caller as a probe.
    pub fn allow_request(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map_or(true, |at| at.elapsed() >= self.config.open_timeout());

                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(service = %self.name, "Circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(CircuitOpenError::new(&self.name, inner.failure_count))
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_required_successes {
                    *inner = BreakerInner::default();
                    info!(service = %self.name, "Circuit closed after recovery");
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
            }
            // A call admitted before the breaker opened; it says nothing about recovery.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.failure_count += 1;
                inner.consecutive_recovery_failures += 1;
                warn!(
                    service = %self.name,
                    failure_count = inner.failure_count,
                    recovery_failures = inner.consecutive_recovery_failures,
                    "Circuit re-opened after failed probe"
                );

                if inner.consecutive_recovery_failures >= self.config.max_recovery_attempts {
                    error!(
                        service = %self.name,
                        recovery_failures = inner.consecutive_recovery_failures,
                        unrecoverable = true,
                        "Circuit breaker exhausted its recovery attempts"
                    );
                }
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    error!(
                        service = %self.name,
                        failure_count = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker back to `Closed` with cleared counters.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::default();
        info!(service = %self.name, "Circuit manually reset");
    }

    /// Returns a snapshot of the breaker.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            service: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_recovery_failures: inner.consecutive_recovery_failures,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("success_count", &inner.success_count)
            .finish()
    }
}
