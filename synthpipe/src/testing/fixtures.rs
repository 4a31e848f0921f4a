//! Test fixtures for pipeline testing.

use serde_json::json;
use std::sync::Arc;

use super::mocks::ScriptedUpstream;
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::contracts::Complexity;
use crate::events::CollectingSink;
use crate::llm::{StaticPromptLoader, Usage};
use crate::pipeline::{Phase, PipelineOrchestrator, PipelineOutcome, PipelineRequest};
use crate::resilience::{CircuitBreakerRegistry, JitterStrategy, RetryConfig};

/// Prompts whose text is the step name, which is also the route
/// [`ScriptedUpstream`] matches on.
#[must_use]
pub fn routing_prompts() -> StaticPromptLoader {
    Phase::ALL
        .iter()
        .fold(StaticPromptLoader::new(), |loader, phase| {
            loader.with_prompt(phase.as_str(), phase.as_str())
        })
}

/// Defaults with deterministic, fast retries.
#[must_use]
pub fn fast_config() -> PipelineConfig {
    PipelineConfig::new().with_retry(
        RetryConfig::new()
            .with_jitter(JitterStrategy::None)
            .with_backoff_multiplier_seconds(0.01)
            .with_backoff_cap_seconds(0.05),
    )
}

/// An analyze reply.
#[must_use]
pub fn analysis_json(intent: &str, complexity: Complexity) -> serde_json::Value {
    json!({
        "intent": intent,
        "key_entities": ["rust"],
        "complexity": complexity,
        "context": {"language": "en"}
    })
}

/// A process reply.
#[must_use]
pub fn process_json(content: &str, confidence: f64) -> serde_json::Value {
    json!({
        "content": content,
        "confidence": confidence,
        "metadata": {}
    })
}

/// A client scripted for one successful run.
#[must_use]
pub fn happy_upstream(tokens: &[&str]) -> ScriptedUpstream {
    ScriptedUpstream::new()
        .with_call_json(
            Phase::Analyze.as_str(),
            &analysis_json("explain ownership", Complexity::Moderate),
            Usage::new(100, 50),
        )
        .with_call_json(
            Phase::Process.as_str(),
            &process_json("Ownership moves values; borrows lend them.", 0.9),
            Usage::new(300, 200),
        )
        .with_stream(Phase::Synthesize.as_str(), tokens, Some(Usage::new(150, 200)))
}

/// An orchestrator wired to a scripted client.
#[derive(Debug)]
pub struct TestPipeline {
    /// The orchestrator under test.
    pub orchestrator: PipelineOrchestrator,
    /// The scripted upstream.
    pub client: Arc<ScriptedUpstream>,
    /// Breakers shared with the orchestrator.
    pub registry: CircuitBreakerRegistry,
}

impl TestPipeline {
    /// Builds a pipeline with [`fast_config`].
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[must_use]
    pub fn new(client: ScriptedUpstream) -> Self {
        Self::with_config(&fast_config(), client)
    }

    /// Builds a pipeline with the given config and a fresh registry.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[must_use]
    pub fn with_config(config: &PipelineConfig, client: ScriptedUpstream) -> Self {
        let registry = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        Self::with_registry(config, client, registry)
    }

    /// Builds a pipeline sharing an existing registry.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[must_use]
    pub fn with_registry(
        config: &PipelineConfig,
        client: ScriptedUpstream,
        registry: CircuitBreakerRegistry,
    ) -> Self {
        let client = Arc::new(client);
        let orchestrator = PipelineOrchestrator::from_config(
            config,
            client.clone(),
            &registry,
            &routing_prompts(),
        )
        .unwrap_or_else(|err| panic!("invalid test pipeline: {err}"));

        Self {
            orchestrator,
            client,
            registry,
        }
    }

    /// Runs one request into a collecting sink.
    pub async fn run(&self, message: &str) -> (PipelineOutcome, CollectingSink) {
        let sink = CollectingSink::new();
        let outcome = self
            .orchestrator
            .run(
                PipelineRequest::new(message).with_request_id("test-request"),
                &sink,
                &CancellationToken::new(),
            )
            .await;
        (outcome, sink)
    }
}
