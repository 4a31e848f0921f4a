//! Token, cost and timing aggregation across pipeline steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::pricing::PricingTable;
use crate::errors::MetricsError;
use crate::llm::Usage;

/// Key under which a failed run records its error.
pub const ERROR_STEP: &str = "error";

/// Metrics for one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Wall time spent in the step, including retries.
    pub elapsed_seconds: f64,
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Estimated cost in USD.
    pub cost_usd: f64,
    /// Model that served the step.
    pub model: String,
    /// When the step started.
    pub started_at: DateTime<Utc>,
}

impl StepMetrics {
    /// Total tokens for the step.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Entry in a state's step metadata map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepRecord {
    /// The step finished and reported metrics.
    Completed(StepMetrics),
    /// The step or run failed; carries no numeric fields.
    Failed {
        /// Diagnostic reason.
        error: String,
    },
}

impl StepRecord {
    /// Returns the metrics if the step completed.
    #[must_use]
    pub fn metrics(&self) -> Option<&StepMetrics> {
        match self {
            Self::Completed(metrics) => Some(metrics),
            Self::Failed { .. } => None,
        }
    }
}

/// Totals across the steps of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineTotals {
    /// Input plus output tokens.
    pub total_tokens: u64,
    /// Summed cost in USD.
    pub total_cost_usd: f64,
    /// Summed step wall time.
    pub total_elapsed_seconds: f64,
}

impl PipelineTotals {
    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("total_tokens".to_string(), serde_json::json!(self.total_tokens));
        map.insert("total_cost_usd".to_string(), serde_json::json!(self.total_cost_usd));
        map.insert(
            "total_elapsed_seconds".to_string(),
            serde_json::json!(self.total_elapsed_seconds),
        );
        map
    }
}

/// Totals across a list of upstream calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallTotals {
    /// Input plus output tokens.
    pub total_tokens: u64,
    /// Summed cost in USD.
    pub total_cost_usd: f64,
}

/// Sums metrics of completed steps.
///
/// The `error` entry and any failed step are skipped.
#[must_use]
pub fn aggregate_steps(step_metadata: &BTreeMap<String, StepRecord>) -> PipelineTotals {
    step_metadata
        .iter()
        .filter_map(|(name, record)| match record.metrics() {
            Some(metrics) if name != ERROR_STEP => Some(metrics),
            _ => {
                debug!(step = %name, "Skipping step without metrics");
                None
            }
        })
        .fold(PipelineTotals::default(), |mut totals, metrics| {
            totals.total_tokens += metrics.total_tokens();
            totals.total_cost_usd += metrics.cost_usd;
            totals.total_elapsed_seconds += metrics.elapsed_seconds;
            totals
        })
}

/// Prices and sums paired usage records and model ids.
pub fn aggregate_across_calls<S: AsRef<str>>(
    usages: &[Usage],
    models: &[S],
    pricing: &PricingTable,
) -> Result<CallTotals, MetricsError> {
    if usages.len() != models.len() {
        return Err(MetricsError::LengthMismatch {
            usages: usages.len(),
            models: models.len(),
        });
    }

    usages
        .iter()
        .zip(models)
        .try_fold(CallTotals::default(), |mut totals, (usage, model)| {
            totals.total_cost_usd += pricing.cost(usage, model.as_ref())?;
            totals.total_tokens += usage.total_tokens();
            Ok(totals)
        })
}

/// Builds step metrics with a shared pricing table.
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
    pricing: Arc<PricingTable>,
}

impl MetricsAggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(pricing: Arc<PricingTable>) -> Self {
        Self { pricing }
    }

    /// The pricing table.
    #[must_use]
    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Cost of a single call; unknown models price at zero.
    #[must_use]
    pub fn price(&self, usage: &Usage, model: &str) -> f64 {
        self.pricing.cost(usage, model).unwrap_or_else(|err| {
            warn!(model = %model, error = %err, "No pricing for model, recording zero cost");
            0.0
        })
    }

    /// Builds the metrics record for a finished step.
    #[must_use]
    pub fn step_metrics(
        &self,
        usage: &Usage,
        model: &str,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> StepMetrics {
        StepMetrics {
            elapsed_seconds: elapsed.as_secs_f64(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: self.price(usage, model),
            model: model.to_string(),
            started_at,
        }
    }

    /// Totals of a step metadata map.
    #[must_use]
    pub fn totals(&self, step_metadata: &BTreeMap<String, StepRecord>) -> PipelineTotals {
        aggregate_steps(step_metadata)
    }

    /// Totals across calls with this aggregator's pricing.
    pub fn across_calls<S: AsRef<str>>(
        &self,
        usages: &[Usage],
        models: &[S],
    ) -> Result<CallTotals, MetricsError> {
        aggregate_across_calls(usages, models, &self.pricing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metrics(tokens: u64, cost: f64, elapsed: f64) -> StepRecord {
        StepRecord::Completed(StepMetrics {
            elapsed_seconds: elapsed,
            input_tokens: tokens / 2,
            output_tokens: tokens - tokens / 2,
            cost_usd: cost,
            model: "claude-3-5-haiku".to_string(),
            started_at: Utc::now(),
        })
    }

    #[test]
    fn test_aggregate_steps_sums_real_steps() {
        let mut map = BTreeMap::new();
        map.insert("analyze".to_string(), metrics(150, 0.001, 0.5));
        map.insert("process".to_string(), metrics(500, 0.004, 1.5));
        map.insert("synthesize".to_string(), metrics(350, 0.003, 2.0));

        let totals = aggregate_steps(&map);
        assert_eq!(totals.total_tokens, 1000);
        assert!((totals.total_cost_usd - 0.008).abs() < 1e-12);
        assert!((totals.total_elapsed_seconds - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_steps_skips_error_entry() {
        let mut map = BTreeMap::new();
        map.insert("analyze".to_string(), metrics(150, 0.001, 0.5));
        map.insert(
            ERROR_STEP.to_string(),
            StepRecord::Failed {
                error: "gate rejected".to_string(),
            },
        );

        assert_eq!(aggregate_steps(&map).total_tokens, 150);
    }

    #[test]
    fn test_aggregate_steps_empty() {
        assert_eq!(aggregate_steps(&BTreeMap::new()), PipelineTotals::default());
    }

    #[test]
    fn test_across_calls_length_mismatch() {
        let err = aggregate_across_calls(
            &[Usage::new(1, 1), Usage::new(2, 2)],
            &["claude-3-5-haiku"],
            &PricingTable::default(),
        )
        .unwrap_err();

        assert_eq!(err, MetricsError::LengthMismatch { usages: 2, models: 1 });
    }

    #[test]
    fn test_across_calls_unknown_model() {
        let err = aggregate_across_calls(
            &[Usage::new(1, 1)],
            &["unknown-model"],
            &PricingTable::default(),
        )
        .unwrap_err();

        assert!(matches!(err, MetricsError::UnknownModel(m) if m == "unknown-model"));
    }

    #[test]
    fn test_across_calls_sums() {
        let totals = aggregate_across_calls(
            &[Usage::new(1_000_000, 0), Usage::new(0, 1_000_000)],
            &["claude-3-5-haiku", "claude-3-5-sonnet-20241022"],
            &PricingTable::default(),
        )
        .unwrap();

        assert_eq!(totals.total_tokens, 2_000_000);
        assert!((totals.total_cost_usd - 15.8).abs() < 1e-9);
    }

    #[test]
    fn test_aggregator_prices_unknown_model_at_zero() {
        let aggregator = MetricsAggregator::default();
        let record = aggregator.step_metrics(
            &Usage::new(10, 20),
            "unknown-model",
            Utc::now(),
            Duration::from_millis(1500),
        );

        assert_eq!(record.cost_usd, 0.0);
        assert_eq!(record.total_tokens(), 30);
        assert!((record.elapsed_seconds - 1.5).abs() < 1e-12);
    }
}
