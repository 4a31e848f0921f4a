//! Pipeline configuration.
//!
//! The host loads configuration however it likes and hands the crate a
//! [`PipelineConfig`]. Every field has a serde default, so a partial JSON
//! document is enough.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::metrics::PricingTable;
use crate::pipeline::{Phase, PhaseTimeouts};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Model parameters for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model id.
    #[serde(default = "default_model")]
    pub model: String,
    /// Completion token limit.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_model() -> String {
    "claude-3-5-haiku-20241022".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl ModelSettings {
    /// Creates settings for a model with default limits.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Sets the completion token limit.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Model settings per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Analyze step.
    #[serde(default = "default_analyze_model")]
    pub analyze: ModelSettings,
    /// Process step.
    #[serde(default = "default_process_model")]
    pub process: ModelSettings,
    /// Synthesize step.
    #[serde(default = "default_synthesize_model")]
    pub synthesize: ModelSettings,
}

fn default_analyze_model() -> ModelSettings {
    ModelSettings::default().with_temperature(0.2)
}

fn default_process_model() -> ModelSettings {
    ModelSettings::default()
        .with_max_tokens(2048)
        .with_temperature(0.5)
}

fn default_synthesize_model() -> ModelSettings {
    ModelSettings::new("claude-3-5-sonnet-20241022").with_max_tokens(4096)
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            analyze: default_analyze_model(),
            process: default_process_model(),
            synthesize: default_synthesize_model(),
        }
    }
}

impl ModelsConfig {
    /// Settings for a step.
    #[must_use]
    pub fn for_phase(&self, phase: Phase) -> &ModelSettings {
        match phase {
            Phase::Analyze => &self.analyze,
            Phase::Process => &self.process,
            Phase::Synthesize => &self.synthesize,
        }
    }
}

/// Complete configuration consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retry behaviour for upstream calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Breaker settings shared by every dependency.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-phase time budgets.
    #[serde(default)]
    pub timeouts: PhaseTimeouts,
    /// Minimum process confidence, inclusive.
    #[serde(default = "default_min_confidence")]
    pub min_confidence_threshold: f64,
    /// Model settings per step.
    #[serde(default)]
    pub models: ModelsConfig,
    /// Issue a follow-up call when the stream omits usage.
    #[serde(default = "default_recover_usage")]
    pub recover_streaming_usage: bool,
    /// Token pricing.
    #[serde(default)]
    pub pricing: PricingTable,
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_recover_usage() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timeouts: PhaseTimeouts::default(),
            min_confidence_threshold: default_min_confidence(),
            models: ModelsConfig::default(),
            recover_streaming_usage: default_recover_usage(),
            pricing: PricingTable::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::new("$", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the retry config.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker config.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Sets the phase budgets.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: PhaseTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the minimum confidence threshold.
    #[must_use]
    pub fn with_min_confidence_threshold(mut self, threshold: f64) -> Self {
        self.min_confidence_threshold = threshold;
        self
    }

    /// Sets the per-step models.
    #[must_use]
    pub fn with_models(mut self, models: ModelsConfig) -> Self {
        self.models = models;
        self
    }

    /// Enables or disables usage recovery after streaming.
    #[must_use]
    pub fn with_recover_streaming_usage(mut self, enabled: bool) -> Self {
        self.recover_streaming_usage = enabled;
        self
    }

    /// Sets the pricing table.
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::new("retry.max_attempts", "must be at least 1"));
        }
        check_non_negative("retry.backoff_multiplier_seconds", self.retry.backoff_multiplier_seconds)?;
        check_non_negative("retry.backoff_cap_seconds", self.retry.backoff_cap_seconds)?;

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(ConfigError::new(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if breaker.half_open_required_successes == 0 {
            return Err(ConfigError::new(
                "circuit_breaker.half_open_required_successes",
                "must be at least 1",
            ));
        }
        check_non_negative("circuit_breaker.open_timeout_seconds", breaker.open_timeout_seconds)?;

        for phase in Phase::ALL {
            let seconds = self.timeouts.seconds(phase);
            if !(seconds.is_finite() && seconds > 0.0) {
                return Err(ConfigError::new(
                    format!("timeouts.{phase}_seconds"),
                    format!("must be a positive number of seconds, got {seconds}"),
                ));
            }
            if self.models.for_phase(phase).model.trim().is_empty() {
                return Err(ConfigError::new(
                    format!("models.{phase}.model"),
                    "must not be empty",
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.min_confidence_threshold) {
            return Err(ConfigError::new(
                "min_confidence_threshold",
                format!("must be within [0, 1], got {}", self.min_confidence_threshold),
            ));
        }

        Ok(())
    }
}

fn check_non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::new(field, format!("must be non-negative, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::JitterStrategy;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.open_timeout_seconds, 60.0);
        assert_eq!(config.timeouts.synthesize_seconds, 120.0);
        assert_eq!(config.min_confidence_threshold, 0.5);
        assert!(config.recover_streaming_usage);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_partial_json() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "retry": {"max_attempts": 5, "jitter": "none"},
                "timeouts": {"synthesize_seconds": 10},
                "min_confidence_threshold": 0.75,
                "models": {"analyze": {"model": "claude-3-haiku"}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.jitter, JitterStrategy::None);
        assert_eq!(config.retry.backoff_cap_seconds, 30.0);
        assert_eq!(config.timeouts.synthesize_seconds, 10.0);
        assert_eq!(config.timeouts.analyze_seconds, 30.0);
        assert_eq!(config.models.analyze.model, "claude-3-haiku");
        assert_eq!(config.models.analyze.max_tokens, 1024);
        assert_eq!(config.min_confidence_threshold, 0.75);
    }

    #[test]
    fn test_invalid_json() {
        let err = PipelineConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(err.field, "$");
    }

    #[test]
    fn test_validate_threshold_range() {
        let err = PipelineConfig::new()
            .with_min_confidence_threshold(1.5)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "min_confidence_threshold");
    }

    #[test]
    fn test_validate_timeouts() {
        let err = PipelineConfig::new()
            .with_timeouts(PhaseTimeouts::new().with_process_seconds(0.0))
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "timeouts.process_seconds");
    }

    #[test]
    fn test_validate_attempts() {
        let err = PipelineConfig::new()
            .with_retry(RetryConfig::new().with_max_attempts(0))
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "retry.max_attempts");
    }
}
