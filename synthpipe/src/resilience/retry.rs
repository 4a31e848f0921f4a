//! Retry policy with exponential backoff and jitter.
//!
//! Retries transient upstream failures and reports every outcome to the
//! dependency's circuit breaker, so a storm of retries is what trips it.

use super::CircuitBreaker;
use crate::errors::{CallError, UpstreamError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
}

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(&self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return delay;
        }

        let mut rng = rand::thread_rng();
        match self {
            Self::None => delay,
            Self::Full => Duration::from_millis(rng.gen_range(0..=millis)),
            Self::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + rng.gen_range(0..=millis - half))
            }
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for each further retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier_seconds: f64,
    /// Upper bound on any single delay.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_seconds: f64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_backoff_cap() -> f64 {
    30.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_multiplier_seconds: default_backoff_multiplier(),
            backoff_cap_seconds: default_backoff_cap(),
            jitter: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the backoff multiplier in seconds.
    #[must_use]
    pub fn with_backoff_multiplier_seconds(mut self, seconds: f64) -> Self {
        self.backoff_multiplier_seconds = seconds;
        self
    }

    /// Sets the backoff cap in seconds.
    #[must_use]
    pub fn with_backoff_cap_seconds(mut self, seconds: f64) -> Self {
        self.backoff_cap_seconds = seconds;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Record of one failed attempt, kept for backoff logging only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// The error the attempt ended with.
    pub error: Option<UpstreamError>,
    /// Sleep scheduled before the next attempt.
    pub wait_before_next_ms: u64,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a new retry policy.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Un-jittered delay after the given 1-based attempt:
    /// `min(cap, multiplier * 2^(attempt-1))`, saturating at [`Duration::MAX`].
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.config.backoff_multiplier_seconds.max(0.0) * 2f64.powi(exponent);
        let capped = raw.min(self.config.backoff_cap_seconds.max(0.0));
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::MAX)
    }

    /// Jittered delay after the given 1-based attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.config.jitter.apply(self.base_delay(attempt))
    }

    /// Decides what to do after `attempt` failed with `error`.
    #[must_use]
    pub fn decide(&self, attempt: u32, error: &UpstreamError) -> RetryDecision {
        if !error.is_retryable() {
            RetryDecision::NotRetryable
        } else if attempt >= self.max_attempts() {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.delay_for(attempt))
        }
    }

    /// Executes `call` with retries, consulting and updating `breaker` if given.
    ///
    /// An open breaker fails the loop immediately without invoking `call`.
    /// Fatal errors are surfaced without touching the breaker.
    pub async fn execute<T, F, Fut>(
        &self,
        call: F,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.run(call, breaker, true).await
    }

    /// Like [`execute`](Self::execute), but a successful call is not yet
    /// reported to `breaker`.
    ///
    /// Used when the call only opens a longer exchange, such as a stream.
    /// The caller reports the exchange's outcome with [`settle`](Self::settle).
    pub async fn execute_deferred<T, F, Fut>(
        &self,
        call: F,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.run(call, breaker, false).await
    }

    /// Reports the outcome of an exchange to `breaker`.
    ///
    /// Successes are recorded. Failures are recorded only if retryable, the
    /// same rule the retry loop applies.
    #[allow(clippy::unused_self)]
    pub fn settle(&self, breaker: Option<&CircuitBreaker>, outcome: Result<(), &UpstreamError>) {
        let Some(b) = breaker else {
            return;
        };
        match outcome {
            Ok(()) => b.record_success(),
            Err(error) if error.is_retryable() => b.record_failure(),
            Err(_) => {}
        }
    }

    async fn run<T, F, Fut>(
        &self,
        mut call: F,
        breaker: Option<&CircuitBreaker>,
        report_success: bool,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempt = 1;

        loop {
            if let Some(b) = breaker {
                b.allow_request()?;
            }

            let error = match call().await {
                Ok(value) => {
                    if report_success {
                        self.settle(breaker, Ok(()));
                    }
                    if attempt > 1 {
                        debug!(attempt, "Upstream call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let decision = self.decide(attempt, &error);
            self.settle(breaker, Err(&error));

            match decision {
                RetryDecision::Retry(delay) => {
                    let record = RetryAttempt {
                        attempt_number: attempt,
                        error: Some(error),
                        wait_before_next_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    };
                    warn!(
                        attempt = record.attempt_number,
                        max_attempts = self.max_attempts(),
                        delay_ms = record.wait_before_next_ms,
                        error = ?record.error,
                        service = breaker.map(CircuitBreaker::name),
                        "Retrying upstream call after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    warn!(attempts = attempt, error = %error, "Upstream retries exhausted");
                    return Err(CallError::RetriesExhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                RetryDecision::NotRetryable => {
                    debug!(attempt, error = %error, "Upstream error is not retryable");
                    return Err(CallError::Fatal(error));
                }
            }
        }
    }
}
