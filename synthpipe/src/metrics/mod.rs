//! Token, cost and latency accounting.

mod aggregate;
mod pricing;

pub use aggregate::{
    aggregate_across_calls, aggregate_steps, CallTotals, MetricsAggregator, PipelineTotals,
    StepMetrics, StepRecord, ERROR_STEP,
};
pub use pricing::{ModelPricing, PricingTable};
