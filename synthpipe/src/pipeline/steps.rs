//! The analyze, process and synthesize steps.
//!
//! Each step owns a [`StepRuntime`]: the upstream client plus the retry
//! policy and circuit breaker for that step's dependency, injected at
//! construction. Steps read pipeline state and return a [`StateDelta`];
//! they never mutate state themselves.

use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::phase::{Phase, PhaseBudget};
use super::state::{Message, PipelineState, Role, StateDelta};
use crate::config::ModelSettings;
use crate::contracts::{
    AnalysisOutput, ProcessOutput, StepSchema, SynthesisOutput, TypedStepOutput,
};
use crate::errors::{CallError, PromptError, SchemaValidationError, StepError, UpstreamError};
use crate::events::TokenSink;
use crate::llm::{LlmRequest, LlmResponse, PromptLoader, TokenStream, UpstreamClient, Usage};
use crate::metrics::{MetricsAggregator, StepMetrics, StepRecord};
use crate::observability::{SpanTimer, StepSpanAttributes};
use crate::resilience::{CircuitBreaker, RetryPolicy};

/// Dependencies of one step.
pub struct StepRuntime {
    phase: Phase,
    client: Arc<dyn UpstreamClient>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    model: ModelSettings,
    system_prompt: String,
    metrics: MetricsAggregator,
}

impl StepRuntime {
    /// Creates a runtime with an explicit system prompt.
    #[must_use]
    pub fn new(
        phase: Phase,
        client: Arc<dyn UpstreamClient>,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        model: ModelSettings,
        system_prompt: impl Into<String>,
        metrics: MetricsAggregator,
    ) -> Self {
        Self {
            phase,
            client,
            retry,
            breaker,
            model,
            system_prompt: system_prompt.into(),
            metrics,
        }
    }

    /// Creates a runtime, loading the system prompt for `phase`.
    pub fn from_loader(
        phase: Phase,
        client: Arc<dyn UpstreamClient>,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        model: ModelSettings,
        prompts: &dyn PromptLoader,
        metrics: MetricsAggregator,
    ) -> Result<Self, PromptError> {
        let system_prompt = prompts.load(phase.as_str())?;
        Ok(Self::new(
            phase,
            client,
            retry,
            breaker,
            model,
            system_prompt,
            metrics,
        ))
    }

    /// The step this runtime serves.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The dependency's breaker.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Model settings.
    #[must_use]
    pub fn model(&self) -> &ModelSettings {
        &self.model
    }

    /// System prompt.
    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Builds a request carrying the active trace headers.
    #[must_use]
    pub fn request(&self, user_prompt: impl Into<String>) -> LlmRequest {
        LlmRequest::new(self.system_prompt.clone(), user_prompt, self.model.model.clone())
            .with_max_tokens(self.model.max_tokens)
            .with_temperature(self.model.temperature)
            .with_trace_headers()
    }

    /// Issues a complete call through retry and the breaker.
    pub async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, CallError> {
        self.retry
            .execute(
                || {
                    let client = Arc::clone(&self.client);
                    let request = request.clone();
                    async move { client.call(request).await }
                },
                Some(&self.breaker),
            )
            .await
    }

    /// Opens a stream through retry and the breaker.
    ///
    /// Only opening is retried; once fragments flow, an interruption ends the
    /// step. The breaker hears about success only when the stream is settled
    /// with [`settle_stream`](Self::settle_stream).
    pub async fn open_stream(&self, request: &LlmRequest) -> Result<TokenStream, CallError> {
        self.retry
            .execute_deferred(
                || {
                    let client = Arc::clone(&self.client);
                    let request = request.clone();
                    async move { client.stream(request).await }
                },
                Some(&self.breaker),
            )
            .await
    }

    /// Reports how an opened stream ended to the breaker.
    pub fn settle_stream(&self, outcome: Result<(), &UpstreamError>) {
        self.retry.settle(Some(&self.breaker), outcome);
    }

    fn step_metrics(&self, usage: &Usage, served_by: &str, timer: &SpanTimer) -> StepMetrics {
        let model = if served_by.is_empty() {
            self.model.model.as_str()
        } else {
            served_by
        };
        let metrics = self
            .metrics
            .step_metrics(usage, model, timer.started_at(), timer.elapsed());
        StepSpanAttributes::from_metrics(timer.name(), &metrics).record();
        metrics
    }

    async fn structured<T: StepSchema>(
        &self,
        user_prompt: String,
    ) -> Result<(T, StepMetrics), StepError> {
        let timer = SpanTimer::start(self.phase.as_str());

        let request = self.request(user_prompt);
        let response = self.call(&request).await?;
        let output = TypedStepOutput::<T>::new()
            .parse_text(&response.text)
            .map_err(|err| {
                warn!(step = %self.phase, schema = T::NAME, error = %err, "Step output failed validation");
                err
            })?;

        let metrics = self.step_metrics(&response.usage, &response.model, &timer);
        Ok((output, metrics))
    }
}

impl fmt::Debug for StepRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRuntime")
            .field("phase", &self.phase)
            .field("breaker", &self.breaker.name())
            .field("model", &self.model.model)
            .finish_non_exhaustive()
    }
}

fn transcript(state: &PipelineState) -> String {
    state
        .messages()
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            format!("{role}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn missing(field: &str, phase: Phase) -> StepError {
    StepError::Schema(SchemaValidationError::new(
        field,
        format!("must be present before {phase}"),
    ))
}

/// Works out what the user wants.
#[derive(Debug)]
pub struct AnalyzeStep {
    runtime: StepRuntime,
}

impl AnalyzeStep {
    /// Creates the step.
    #[must_use]
    pub fn new(runtime: StepRuntime) -> Self {
        Self { runtime }
    }

    /// The step's runtime.
    #[must_use]
    pub fn runtime(&self) -> &StepRuntime {
        &self.runtime
    }

    /// Runs the step.
    pub async fn run(&self, state: &PipelineState) -> Result<StateDelta, StepError> {
        let prompt = format!("Conversation:\n{}", transcript(state));
        let (analysis, metrics) = self.runtime.structured::<AnalysisOutput>(prompt).await?;

        Ok(StateDelta::new(Phase::Analyze.as_str())
            .with_message(Message::assistant(to_json(&analysis)))
            .with_analysis(analysis)
            .with_record(StepRecord::Completed(metrics)))
    }
}

/// Produces the content the answer is built from.
#[derive(Debug)]
pub struct ProcessStep {
    runtime: StepRuntime,
}

impl ProcessStep {
    /// Creates the step.
    #[must_use]
    pub fn new(runtime: StepRuntime) -> Self {
        Self { runtime }
    }

    /// The step's runtime.
    #[must_use]
    pub fn runtime(&self) -> &StepRuntime {
        &self.runtime
    }

    /// Runs the step.
    pub async fn run(&self, state: &PipelineState) -> Result<StateDelta, StepError> {
        let analysis = state
            .analysis()
            .ok_or_else(|| missing("analysis", Phase::Process))?;
        let prompt = format!(
            "Request:\n{}\n\nAnalysis:\n{}",
            state.latest_user_message().unwrap_or_default(),
            to_json(analysis)
        );
        let (processed, metrics) = self.runtime.structured::<ProcessOutput>(prompt).await?;

        Ok(StateDelta::new(Phase::Process.as_str())
            .with_message(Message::assistant(to_json(&processed)))
            .with_processed_content(processed)
            .with_record(StepRecord::Completed(metrics)))
    }
}

/// How a synthesize run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisRun {
    /// The stream finished and the answer is ready.
    Completed(StateDelta),
    /// The sink reported the client gone; nothing more was sent upstream.
    Disconnected {
        /// Text received before the disconnect.
        partial: String,
    },
}

/// Streams the final answer to the sink.
#[derive(Debug)]
pub struct SynthesizeStep {
    runtime: StepRuntime,
    recover_usage: bool,
}

impl SynthesizeStep {
    /// Creates the step.
    #[must_use]
    pub fn new(runtime: StepRuntime, recover_usage: bool) -> Self {
        Self {
            runtime,
            recover_usage,
        }
    }

    /// The step's runtime.
    #[must_use]
    pub fn runtime(&self) -> &StepRuntime {
        &self.runtime
    }

    /// Runs the step, forwarding every fragment to `sink` as it arrives.
    pub async fn run(
        &self,
        state: &PipelineState,
        sink: &dyn TokenSink,
        budget: &PhaseBudget,
    ) -> Result<SynthesisRun, StepError> {
        let processed = state
            .processed_content()
            .ok_or_else(|| missing("processed_content", Phase::Synthesize))?;
        let intent = state.analysis().map(|a| a.intent.as_str()).unwrap_or_default();
        let prompt = format!(
            "Request:\n{}\n\nIntent: {intent}\n\nProcessed content:\n{}",
            state.latest_user_message().unwrap_or_default(),
            processed.content
        );

        let timer = SpanTimer::start(Phase::Synthesize.as_str());
        let request = self.runtime.request(prompt);
        let mut stream = self.runtime.open_stream(&request).await?;

        let mut text = String::new();
        let mut usage = None;
        let mut forwarded = 0usize;

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.runtime.settle_stream(Err(&err));
                    warn!(forwarded, error = %err, "Synthesis stream interrupted");
                    return Err(StepError::Call(CallError::Fatal(err)));
                }
            };

            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.text.is_empty() {
                continue;
            }

            text.push_str(&chunk.text);
            if sink.emit(&chunk.text).is_err() {
                info!(forwarded, "Client disconnected during synthesis");
                return Ok(SynthesisRun::Disconnected { partial: text });
            }
            forwarded += 1;
        }
        debug!(forwarded, "Synthesis stream finished");
        self.runtime.settle_stream(Ok(()));

        let synthesis = SynthesisOutput::from_text(text)?;
        let usage = match usage {
            Some(usage) => usage,
            None if self.recover_usage => self.recover_usage(&request, budget).await,
            None => {
                debug!("Stream reported no usage");
                Usage::default()
            }
        };
        let metrics = self.runtime.step_metrics(&usage, &request.model, &timer);

        Ok(SynthesisRun::Completed(
            StateDelta::new(Phase::Synthesize.as_str())
                .with_message(Message::assistant(synthesis.final_text.clone()))
                .with_synthesis(synthesis)
                .with_record(StepRecord::Completed(metrics)),
        ))
    }

    /// Best-effort follow-up call for usage the stream omitted.
    ///
    /// Bypasses retry and the breaker, is bounded by the phase deadline,
    /// and never fails the step.
    async fn recover_usage(&self, request: &LlmRequest, budget: &PhaseBudget) -> Usage {
        let call = self.runtime.client.call(request.clone());
        match tokio::time::timeout_at(budget.deadline(), call).await {
            Ok(Ok(response)) => {
                debug!(
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    "Recovered streaming usage"
                );
                response.usage
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Usage recovery call failed");
                Usage::default()
            }
            Err(_) => {
                warn!(
                    remaining_ms = u64::try_from(budget.remaining().as_millis()).unwrap_or(u64::MAX),
                    "Usage recovery call ran out of time"
                );
                Usage::default()
            }
        }
    }
}
