//! # Synthpipe
//!
//! Resilient orchestration for answering a user message with a generative-AI
//! API in three steps: analyze the request, process it, then stream a
//! synthesized answer back to the caller.
//!
//! - **Resilience**: per-dependency circuit breakers and retry with
//!   exponential backoff and jitter, cooperating so an open breaker stops
//!   retries immediately
//! - **Validated steps**: every structured step output is schema-checked, and
//!   validation gates route bad output to an error step
//! - **Timeouts and cancellation**: each phase runs under its own deadline,
//!   and a client disconnect stops the upstream stream
//! - **Metrics**: per-step token, cost and latency accounting with run totals
//! - **Tracing**: the request id and user id follow every log line and
//!   upstream request
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use synthpipe::prelude::*;
//!
//! let config = PipelineConfig::from_json_str(&std::fs::read_to_string("synthpipe.json")?)?;
//!
//! // Breakers are keyed by step name and take their settings from
//! // `config.circuit_breaker` when first created. Share one registry across
//! // orchestrators to share breaker state.
//! let registry = CircuitBreakerRegistry::default();
//! let orchestrator = PipelineOrchestrator::from_config(
//!     &config,
//!     client,
//!     &registry,
//!     &DirectoryPromptLoader::new("prompts"),
//! )?;
//!
//! let (sink, mut events) = ChannelSink::new();
//! let outcome = orchestrator
//!     .run(PipelineRequest::new("Explain ownership"), &sink, &CancellationToken::new())
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod contracts;
pub mod errors;
pub mod events;
pub mod llm;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{ModelSettings, ModelsConfig, PipelineConfig};
    pub use crate::context::{spawn_traced, TraceContext};
    pub use crate::contracts::{AnalysisOutput, Complexity, Formatting, ProcessOutput, SynthesisOutput};
    pub use crate::errors::{
        CallError, CircuitOpenError, ConfigError, PipelineFailure, StepError, SynthpipeError,
        UpstreamError,
    };
    pub use crate::events::{ChannelSink, ErrorEvent, NoOpSink, StreamEvent, TokenSink};
    pub use crate::llm::{
        DirectoryPromptLoader, LlmRequest, LlmResponse, PromptLoader, StaticPromptLoader,
        StreamChunk, TokenStream, UpstreamClient, Usage,
    };
    pub use crate::metrics::{MetricsAggregator, PipelineTotals, PricingTable, StepMetrics};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        OutcomeStatus, PhaseTimeouts, PipelineOrchestrator, PipelineOutcome, PipelinePhase,
        PipelineRequest,
    };
    pub use crate::resilience::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, RetryConfig,
        RetryPolicy,
    };
}
