//! Per-model token pricing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::MetricsError;
use crate::llm::Usage;

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Input and output rates in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per million prompt tokens.
    pub input_per_mtok: f64,
    /// USD per million completion tokens.
    pub output_per_mtok: f64,
}

impl ModelPricing {
    /// Creates a pricing entry.
    #[must_use]
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    /// Cost of a usage record in USD.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / TOKENS_PER_MILLION
    }
}

/// Pricing lookup keyed by model id.
///
/// Dated model ids (`claude-3-5-haiku-20241022`) resolve to the longest
/// registered prefix when there is no exact entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new()
            .with_model("claude-opus-4", ModelPricing::new(15.0, 75.0))
            .with_model("claude-sonnet-4", ModelPricing::new(3.0, 15.0))
            .with_model("claude-3-7-sonnet", ModelPricing::new(3.0, 15.0))
            .with_model("claude-3-5-sonnet", ModelPricing::new(3.0, 15.0))
            .with_model("claude-3-5-haiku", ModelPricing::new(0.8, 4.0))
            .with_model("claude-3-opus", ModelPricing::new(15.0, 75.0))
            .with_model("claude-3-haiku", ModelPricing::new(0.25, 1.25))
    }
}

impl PricingTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    /// Registers a model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    /// Looks up pricing for a model id.
    #[must_use]
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model).or_else(|| {
            self.models
                .iter()
                .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, pricing)| pricing)
        })
    }

    /// Cost of a usage record, failing for unknown models.
    pub fn cost(&self, usage: &Usage, model: &str) -> Result<f64, MetricsError> {
        self.get(model)
            .map(|pricing| pricing.cost(usage))
            .ok_or_else(|| MetricsError::UnknownModel(model.to_string()))
    }

    /// Number of registered models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no models are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_per_million() {
        let pricing = ModelPricing::new(3.0, 15.0);
        let cost = pricing.cost(&Usage::new(1_000_000, 100_000));
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_exact_then_prefix_lookup() {
        let table = PricingTable::new()
            .with_model("claude-3", ModelPricing::new(1.0, 1.0))
            .with_model("claude-3-5-haiku", ModelPricing::new(0.8, 4.0));

        assert_eq!(table.get("claude-3-5-haiku").unwrap().input_per_mtok, 0.8);
        assert_eq!(
            table.get("claude-3-5-haiku-20241022").unwrap().output_per_mtok,
            4.0
        );
        assert_eq!(table.get("claude-3-opus").unwrap().input_per_mtok, 1.0);
        assert!(table.get("gpt-4o").is_none());
    }

    #[test]
    fn test_unknown_model_error() {
        let table = PricingTable::default();
        let err = table.cost(&Usage::new(1, 1), "mystery-model").unwrap_err();
        assert_eq!(err, MetricsError::UnknownModel("mystery-model".to_string()));
    }
}
