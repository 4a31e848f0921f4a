//! Structured logging setup and span attributes for pipeline runs.
//!
//! Everything the crate logs goes through `tracing`. Hosts either install
//! their own subscriber or call [`init_tracing`] once at startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use crate::metrics::{PipelineTotals, StepMetrics};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// Single-line human-readable.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
/// Fails if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    }
    .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

/// Measures one step against the runtime clock.
///
/// Uses the tokio clock so paused-time tests see virtual elapsed time.
#[derive(Debug)]
pub struct SpanTimer {
    name: String,
    started_at: DateTime<Utc>,
    start: Instant,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wall-clock start time.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

/// Attributes describing one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpanAttributes {
    /// Step name.
    pub step: String,
    /// Model that served the step.
    pub model: String,
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Cost in USD.
    pub cost_usd: f64,
    /// Wall time in seconds.
    pub elapsed_seconds: f64,
}

impl StepSpanAttributes {
    /// Builds attributes from a step's metrics.
    #[must_use]
    pub fn from_metrics(step: impl Into<String>, metrics: &StepMetrics) -> Self {
        Self {
            step: step.into(),
            model: metrics.model.clone(),
            input_tokens: metrics.input_tokens,
            output_tokens: metrics.output_tokens,
            cost_usd: metrics.cost_usd,
            elapsed_seconds: metrics.elapsed_seconds,
        }
    }

    /// Converts to OpenTelemetry GenAI attribute names.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("pipeline.step".to_string(), self.step.clone());
        attrs.insert("gen_ai.request.model".to_string(), self.model.clone());
        attrs.insert(
            "gen_ai.usage.input_tokens".to_string(),
            self.input_tokens.to_string(),
        );
        attrs.insert(
            "gen_ai.usage.output_tokens".to_string(),
            self.output_tokens.to_string(),
        );
        attrs.insert("pipeline.step.cost_usd".to_string(), self.cost_usd.to_string());
        attrs.insert(
            "pipeline.step.elapsed_seconds".to_string(),
            self.elapsed_seconds.to_string(),
        );
        attrs
    }

    /// Logs the step at info level.
    pub fn record(&self) {
        ::tracing::info!(
            step = %self.step,
            model = %self.model,
            input_tokens = self.input_tokens,
            output_tokens = self.output_tokens,
            cost_usd = self.cost_usd,
            elapsed_seconds = self.elapsed_seconds,
            "Step completed"
        );
    }
}

/// Attributes describing a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpanAttributes {
    /// Request id.
    pub request_id: String,
    /// User id, if known.
    pub user_id: Option<String>,
    /// How the run ended.
    pub status: String,
    /// Aggregated totals.
    pub totals: PipelineTotals,
}

impl PipelineSpanAttributes {
    /// Creates new pipeline span attributes.
    #[must_use]
    pub fn new(request_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: status.into(),
            ..Default::default()
        }
    }

    /// Sets the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Sets the totals.
    #[must_use]
    pub fn with_totals(mut self, totals: PipelineTotals) -> Self {
        self.totals = totals;
        self
    }

    /// Converts to OpenTelemetry attributes.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("pipeline.request_id".to_string(), self.request_id.clone());
        if let Some(ref v) = self.user_id {
            attrs.insert("pipeline.user_id".to_string(), v.clone());
        }
        attrs.insert("pipeline.status".to_string(), self.status.clone());
        attrs.insert(
            "pipeline.total_tokens".to_string(),
            self.totals.total_tokens.to_string(),
        );
        attrs.insert(
            "pipeline.total_cost_usd".to_string(),
            self.totals.total_cost_usd.to_string(),
        );
        attrs
    }

    /// Logs the run summary at info level.
    pub fn record(&self) {
        ::tracing::info!(
            status = %self.status,
            total_tokens = self.totals.total_tokens,
            total_cost_usd = self.totals.total_cost_usd,
            total_elapsed_seconds = self.totals.total_elapsed_seconds,
            "Pipeline finished"
        );
    }
}
