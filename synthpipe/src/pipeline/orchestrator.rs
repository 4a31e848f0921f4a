//! The pipeline state machine.
//!
//! `Start -> Analyzing -> (gate) -> Processing -> (gate) -> Synthesizing -> Done`,
//! with `Error` reachable from every working state and `Error -> Done`.
//! Whatever happens inside a phase, [`PipelineOrchestrator::run`] returns a
//! well-formed [`PipelineOutcome`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::gates::{
    AnalysisValidationGate, ProcessValidationGate, ValidationGate, ValidationResult,
};
use super::phase::{run_phase, Phase, PhaseBudget, PhaseInterrupt, PhaseTimeouts, PipelinePhase};
use super::state::{Message, PipelineState, StateDelta};
use super::steps::{AnalyzeStep, ProcessStep, StepRuntime, SynthesisRun, SynthesizeStep};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::context::TraceContext;
use crate::errors::{PipelineFailure, StepError, SynthpipeError, FALLBACK_ERROR_MESSAGE};
use crate::events::{ErrorEvent, TokenSink};
use crate::llm::{PromptLoader, UpstreamClient};
use crate::metrics::{MetricsAggregator, PipelineTotals, StepRecord, ERROR_STEP};
use crate::observability::PipelineSpanAttributes;
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};

/// An incoming request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// The new user message.
    pub message: String,
    /// Earlier conversation, oldest first.
    #[serde(default)]
    pub history: Vec<Message>,
    /// Request id; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Authenticated user, if any.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl PipelineRequest {
    /// Creates a request with no history.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: Vec::new(),
            request_id: None,
            user_id: None,
        }
    }

    /// Sets the conversation history.
    #[must_use]
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// Sets the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn trace_context(&self) -> TraceContext {
        let request_id = self
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ctx = TraceContext::new(request_id);
        match self.user_id {
            Some(ref user_id) => ctx.with_user_id(user_id.clone()),
            None => ctx,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The answer was streamed in full.
    Completed,
    /// The run took the error branch.
    Failed,
    /// The client went away or the host cancelled.
    Cancelled,
}

impl OutcomeStatus {
    /// Snake-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Final state.
    pub state: PipelineState,
    /// How the run ended.
    pub status: OutcomeStatus,
    /// Totals of the completed steps.
    pub totals: PipelineTotals,
    /// Every state visited, in order.
    pub path: Vec<PipelinePhase>,
}

impl PipelineOutcome {
    /// Returns true if the run completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    /// The failure, if the run took the error branch.
    #[must_use]
    pub fn failure(&self) -> Option<&PipelineFailure> {
        self.state.failure()
    }

    /// Returns true if the run passed through `phase`.
    #[must_use]
    pub fn visited(&self, phase: PipelinePhase) -> bool {
        self.path.contains(&phase)
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("status".to_string(), serde_json::json!(self.status));
        map.insert("path".to_string(), serde_json::json!(self.path));
        map.insert("totals".to_string(), serde_json::json!(self.totals));
        map.insert(
            "final_response".to_string(),
            serde_json::json!(self.state.final_response()),
        );
        if let Some(failure) = self.failure() {
            map.insert("failure".to_string(), serde_json::json!(failure.to_dict()));
        }
        map
    }
}

/// Transition chosen by a gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Move on to the next state.
    Advance(PipelinePhase),
    /// Route to `Error` with the rejection.
    Reject(PipelineFailure),
}

/// How the synthesize phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStatus {
    /// The full answer is in state.
    Completed,
    /// The sink went away mid-stream.
    Disconnected,
}

enum Interrupt {
    Failed(PipelineFailure),
    Cancelled(String),
}

/// Sequences the steps of one request.
pub struct PipelineOrchestrator {
    analyze: AnalyzeStep,
    process: ProcessStep,
    synthesize: SynthesizeStep,
    analysis_gate: AnalysisValidationGate,
    process_gate: ProcessValidationGate,
    timeouts: PhaseTimeouts,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator from prepared steps.
    #[must_use]
    pub fn new(
        analyze: AnalyzeStep,
        process: ProcessStep,
        synthesize: SynthesizeStep,
        process_gate: ProcessValidationGate,
        timeouts: PhaseTimeouts,
    ) -> Self {
        Self {
            analyze,
            process,
            synthesize,
            analysis_gate: AnalysisValidationGate,
            process_gate,
            timeouts,
        }
    }

    /// Wires the three steps from configuration.
    ///
    /// Each step's dependency gets the breaker registered under the step
    /// name, created from `config.circuit_breaker` on first use and shared
    /// with every other orchestrator built on the same registry. Prompt
    /// loading failures surface here, at startup.
    pub fn from_config(
        config: &PipelineConfig,
        client: Arc<dyn UpstreamClient>,
        registry: &CircuitBreakerRegistry,
        prompts: &dyn PromptLoader,
    ) -> Result<Self, SynthpipeError> {
        config.validate()?;

        let retry = RetryPolicy::new(config.retry.clone());
        let metrics = MetricsAggregator::new(Arc::new(config.pricing.clone()));
        let runtime = |phase: Phase| {
            StepRuntime::from_loader(
                phase,
                Arc::clone(&client),
                retry.clone(),
                registry.get_or_create_with(phase.as_str(), &config.circuit_breaker),
                config.models.for_phase(phase).clone(),
                prompts,
                metrics.clone(),
            )
        };

        Ok(Self::new(
            AnalyzeStep::new(runtime(Phase::Analyze)?),
            ProcessStep::new(runtime(Phase::Process)?),
            SynthesizeStep::new(runtime(Phase::Synthesize)?, config.recover_streaming_usage),
            ProcessValidationGate::new(config.min_confidence_threshold),
            config.timeouts.clone(),
        ))
    }

    /// Phase budgets.
    #[must_use]
    pub fn timeouts(&self) -> &PhaseTimeouts {
        &self.timeouts
    }

    /// Runs the analyze step and merges its output.
    pub async fn run_analyze(&self, state: &mut PipelineState) -> Result<(), StepError> {
        let delta = self.analyze.run(state).await?;
        state.apply(delta)?;
        Ok(())
    }

    /// Decides whether the analysis lets the pipeline continue.
    #[must_use]
    pub fn gate_after_analyze(&self, state: &PipelineState) -> GateDecision {
        let result = state.analysis().map_or_else(
            || ValidationResult::reject("analysis output is missing"),
            |analysis| self.analysis_gate.validate(analysis),
        );
        decide(Phase::Analyze, result, PipelinePhase::Processing)
    }

    /// Runs the process step and merges its output.
    pub async fn run_process(&self, state: &mut PipelineState) -> Result<(), StepError> {
        let delta = self.process.run(state).await?;
        state.apply(delta)?;
        Ok(())
    }

    /// Decides whether the processed content is good enough to synthesize.
    #[must_use]
    pub fn gate_after_process(&self, state: &PipelineState) -> GateDecision {
        let result = state.processed_content().map_or_else(
            || ValidationResult::reject("processed content is missing"),
            |processed| self.process_gate.validate(processed),
        );
        decide(Phase::Process, result, PipelinePhase::Synthesizing)
    }

    /// Streams the answer to `sink` and merges the final response.
    pub async fn run_synthesize(
        &self,
        state: &mut PipelineState,
        sink: &dyn TokenSink,
        budget: &PhaseBudget,
    ) -> Result<SynthesisStatus, StepError> {
        match self.synthesize.run(state, sink, budget).await? {
            SynthesisRun::Completed(delta) => {
                state.apply(delta)?;
                Ok(SynthesisStatus::Completed)
            }
            SynthesisRun::Disconnected { partial } => {
                debug!(partial_chars = partial.len(), "Discarding partial synthesis");
                Ok(SynthesisStatus::Disconnected)
            }
        }
    }

    /// Sets the final response to a message describing the failure.
    ///
    /// Never fails; without a recorded failure a generic message is used.
    pub fn run_error(&self, state: &mut PipelineState) {
        let (message, reason) = state.failure().map_or_else(
            || (FALLBACK_ERROR_MESSAGE.to_string(), "unknown failure".to_string()),
            |failure| (failure.user_message(), failure.reason()),
        );

        let mut delta = StateDelta::new(ERROR_STEP).with_record(StepRecord::Failed { error: reason });
        if state.final_response().is_none() {
            delta = delta.with_final_response(message);
        }
        if let Err(err) = state.apply(delta) {
            warn!(error = %err, "Error step could not update state");
        }
    }

    /// Runs the whole pipeline for one request.
    ///
    /// Tokens of the synthesized answer go to `sink` as they arrive. On
    /// success `sink.complete` is called once; on the error branch
    /// `sink.fail` is called once; a cancelled run calls neither.
    pub async fn run(
        &self,
        request: PipelineRequest,
        sink: &dyn TokenSink,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let ctx = request.trace_context();
        let span = info_span!(
            "pipeline",
            request_id = %ctx.request_id,
            user_id = ctx.user_id.as_deref().unwrap_or("")
        );

        ctx.clone()
            .scope(self.drive(request, ctx, sink, cancel))
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        request: PipelineRequest,
        ctx: TraceContext,
        sink: &dyn TokenSink,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let mut messages = request.history;
        messages.push(Message::user(request.message));
        let mut state = PipelineState::new(ctx.request_id, ctx.user_id, messages);

        let mut path = vec![PipelinePhase::Start];
        let mut status = OutcomeStatus::Completed;
        let mut current = PipelinePhase::Analyzing;
        info!("Pipeline started");

        while !current.is_terminal() {
            path.push(current);

            let step = match current {
                PipelinePhase::Analyzing => {
                    let budget = self.timeouts.start(Phase::Analyze);
                    let ran = self.guarded(&budget, cancel, self.run_analyze(&mut state)).await;
                    ran.map(|()| self.gate_after_analyze(&state))
                }
                PipelinePhase::Processing => {
                    let budget = self.timeouts.start(Phase::Process);
                    let ran = self.guarded(&budget, cancel, self.run_process(&mut state)).await;
                    ran.map(|()| self.gate_after_process(&state))
                }
                PipelinePhase::Synthesizing => {
                    let budget = self.timeouts.start(Phase::Synthesize);
                    let ran = self
                        .guarded(&budget, cancel, self.run_synthesize(&mut state, sink, &budget))
                        .await;
                    match ran {
                        Ok(SynthesisStatus::Completed) => {
                            Ok(GateDecision::Advance(PipelinePhase::Done))
                        }
                        Ok(SynthesisStatus::Disconnected) => {
                            Err(Interrupt::Cancelled("client disconnected".to_string()))
                        }
                        Err(interrupt) => Err(interrupt),
                    }
                }
                PipelinePhase::Error => {
                    self.run_error(&mut state);
                    status = OutcomeStatus::Failed;
                    Ok(GateDecision::Advance(PipelinePhase::Done))
                }
                PipelinePhase::Start | PipelinePhase::Done => {
                    Ok(GateDecision::Advance(PipelinePhase::Done))
                }
            };

            let next = match step {
                Ok(GateDecision::Advance(next)) => next,
                Ok(GateDecision::Reject(failure)) | Err(Interrupt::Failed(failure)) => {
                    warn!(
                        phase = %failure.phase(),
                        kind = failure.kind(),
                        reason = %failure.reason(),
                        "Routing pipeline to error step"
                    );
                    state.record_failure(failure);
                    PipelinePhase::Error
                }
                Err(Interrupt::Cancelled(reason)) => {
                    info!(phase = %current, reason = %reason, "Pipeline cancelled");
                    status = OutcomeStatus::Cancelled;
                    PipelinePhase::Done
                }
            };

            debug_assert!(current.can_transition_to(next), "{current} -> {next}");
            debug!(from = %current, to = %next, "Pipeline transition");
            current = next;
        }
        path.push(PipelinePhase::Done);

        let totals = state.totals();
        match status {
            OutcomeStatus::Completed => sink.complete(&totals),
            OutcomeStatus::Failed => {
                let request_id = Some(state.trace_id().to_string());
                let event = state.failure().map_or_else(
                    || ErrorEvent::fallback(request_id.clone()),
                    |failure| ErrorEvent::from_failure(failure, request_id.clone()),
                );
                sink.fail(&event);
            }
            OutcomeStatus::Cancelled => {}
        }

        PipelineSpanAttributes::new(state.trace_id(), status.as_str())
            .with_user_id(state.user_id().map(str::to_string))
            .with_totals(totals)
            .record();

        PipelineOutcome {
            state,
            status,
            totals,
            path,
        }
    }

    async fn guarded<T, F>(
        &self,
        budget: &PhaseBudget,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, Interrupt>
    where
        F: Future<Output = Result<T, StepError>>,
    {
        let phase = budget.phase();
        let span = info_span!("phase", phase = %phase);

        match run_phase(budget, cancel, fut.instrument(span)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Interrupt::Failed(PipelineFailure::Step {
                phase: phase.as_str().to_string(),
                error,
            })),
            Err(PhaseInterrupt::TimedOut(timeout)) => {
                Err(Interrupt::Failed(PipelineFailure::PhaseTimeout(timeout)))
            }
            Err(PhaseInterrupt::Panicked(message)) => Err(Interrupt::Failed(
                PipelineFailure::Panicked {
                    phase: phase.as_str().to_string(),
                    message,
                },
            )),
            Err(PhaseInterrupt::Cancelled(reason)) => Err(Interrupt::Cancelled(reason)),
        }
    }
}

fn decide(phase: Phase, result: ValidationResult, next: PipelinePhase) -> GateDecision {
    if result.valid {
        return GateDecision::Advance(next);
    }

    let reason = result
        .reason
        .unwrap_or_else(|| "validation failed".to_string());
    warn!(phase = %phase, reason = %reason, "Validation gate rejected step output");
    GateDecision::Reject(PipelineFailure::GateRejected {
        phase: phase.as_str().to_string(),
        reason,
    })
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("analyze", self.analyze.runtime())
            .field("process", self.process.runtime())
            .field("synthesize", self.synthesize.runtime())
            .field("min_confidence", &self.process_gate.min_confidence())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}
