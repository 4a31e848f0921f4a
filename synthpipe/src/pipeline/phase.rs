//! Pipeline phases and per-phase time budgets.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cancellation::CancellationToken;
use crate::errors::PhaseTimeout;

/// One of the three time-boxed pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Understand the request.
    Analyze,
    /// Work through it.
    Process,
    /// Stream the final answer.
    Synthesize,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 3] = [Self::Analyze, Self::Process, Self::Synthesize];

    /// Step name, also the upstream dependency name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Process => "process",
            Self::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Not started.
    Start,
    /// Running the analyze step.
    Analyzing,
    /// Running the process step.
    Processing,
    /// Streaming the synthesize step.
    Synthesizing,
    /// Producing the fallback response.
    Error,
    /// Terminal.
    Done,
}

impl PipelinePhase {
    /// The working state for a step.
    #[must_use]
    pub fn running(phase: Phase) -> Self {
        match phase {
            Phase::Analyze => Self::Analyzing,
            Phase::Process => Self::Processing,
            Phase::Synthesize => Self::Synthesizing,
        }
    }

    /// The step this state runs, if any.
    #[must_use]
    pub fn step(&self) -> Option<Phase> {
        match self {
            Self::Analyzing => Some(Phase::Analyze),
            Self::Processing => Some(Phase::Process),
            Self::Synthesizing => Some(Phase::Synthesize),
            Self::Start | Self::Error | Self::Done => None,
        }
    }

    /// Returns true for `Done`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns true if the state machine permits `self -> next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use PipelinePhase::{Analyzing, Done, Error, Processing, Start, Synthesizing};
        // Any working state may end in Done directly when the run is cancelled.
        matches!(
            (self, next),
            (Start, Analyzing)
                | (Analyzing, Processing)
                | (Processing, Synthesizing)
                | (Start | Analyzing | Processing | Synthesizing, Error)
                | (Start | Analyzing | Processing | Synthesizing | Error, Done)
        )
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Analyzing => "analyzing",
            Self::Processing => "processing",
            Self::Synthesizing => "synthesizing",
            Self::Error => "error",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Time budget for each phase, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    /// Analyze budget.
    #[serde(default = "default_analyze_timeout")]
    pub analyze_seconds: f64,
    /// Process budget.
    #[serde(default = "default_process_timeout")]
    pub process_seconds: f64,
    /// Synthesize budget, covering the whole stream.
    #[serde(default = "default_synthesize_timeout")]
    pub synthesize_seconds: f64,
}

fn default_analyze_timeout() -> f64 {
    30.0
}

fn default_process_timeout() -> f64 {
    60.0
}

fn default_synthesize_timeout() -> f64 {
    120.0
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            analyze_seconds: default_analyze_timeout(),
            process_seconds: default_process_timeout(),
            synthesize_seconds: default_synthesize_timeout(),
        }
    }
}

impl PhaseTimeouts {
    /// Creates the default budgets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the analyze budget.
    #[must_use]
    pub fn with_analyze_seconds(mut self, seconds: f64) -> Self {
        self.analyze_seconds = seconds;
        self
    }

    /// Sets the process budget.
    #[must_use]
    pub fn with_process_seconds(mut self, seconds: f64) -> Self {
        self.process_seconds = seconds;
        self
    }

    /// Sets the synthesize budget.
    #[must_use]
    pub fn with_synthesize_seconds(mut self, seconds: f64) -> Self {
        self.synthesize_seconds = seconds;
        self
    }

    /// Budget in seconds for a phase.
    #[must_use]
    pub fn seconds(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Analyze => self.analyze_seconds,
            Phase::Process => self.process_seconds,
            Phase::Synthesize => self.synthesize_seconds,
        }
    }

    /// Starts the clock on a phase.
    #[must_use]
    pub fn start(&self, phase: Phase) -> PhaseBudget {
        PhaseBudget::new(phase, self.seconds(phase))
    }
}

// Budget used when the configured one overflows `Duration` or the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// A running phase's deadline.
#[derive(Debug, Clone, Copy)]
pub struct PhaseBudget {
    phase: Phase,
    timeout_seconds: f64,
    deadline: Instant,
}

impl PhaseBudget {
    /// Starts a budget of `timeout_seconds` from now.
    #[must_use]
    pub fn new(phase: Phase, timeout_seconds: f64) -> Self {
        let budget = if timeout_seconds > 0.0 {
            Duration::try_from_secs_f64(timeout_seconds).unwrap_or(FAR_FUTURE)
        } else {
            Duration::ZERO
        };
        let now = Instant::now();
        Self {
            phase,
            timeout_seconds,
            deadline: now.checked_add(budget).unwrap_or(now + FAR_FUTURE),
        }
    }

    /// The phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The configured budget.
    #[must_use]
    pub fn timeout_seconds(&self) -> f64 {
        self.timeout_seconds
    }

    /// When the phase must be finished.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// The timeout error for this phase.
    #[must_use]
    pub fn timeout_error(&self) -> PhaseTimeout {
        PhaseTimeout::new(self.phase.as_str(), self.timeout_seconds)
    }
}

/// Why a phase did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseInterrupt {
    /// The budget ran out; in-flight work was dropped.
    TimedOut(PhaseTimeout),
    /// The run was cancelled cooperatively.
    Cancelled(String),
    /// The phase panicked.
    Panicked(String),
}

/// Runs one phase under its budget and the run's cancellation token.
///
/// On timeout or cancellation the phase future is dropped, which cancels
/// every in-flight upstream call and retry sleep it owns. Panics are
/// caught and reported instead of unwinding into the caller.
pub async fn run_phase<F>(
    budget: &PhaseBudget,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, PhaseInterrupt>
where
    F: Future,
{
    let phase = budget.phase();
    let guarded = AssertUnwindSafe(fut).catch_unwind();

    tokio::select! {
        biased;

        () = cancel.cancelled() => {
            let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
            debug!(phase = %phase, reason = %reason, "Phase cancelled");
            Err(PhaseInterrupt::Cancelled(reason))
        }
        result = tokio::time::timeout_at(budget.deadline(), guarded) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                error!(phase = %phase, panic = %message, "Phase panicked");
                Err(PhaseInterrupt::Panicked(message))
            }
            Err(_) => {
                warn!(
                    phase = %phase,
                    timeout_seconds = budget.timeout_seconds(),
                    "Phase timed out"
                );
                Err(PhaseInterrupt::TimedOut(budget.timeout_error()))
            }
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Analyze.to_string(), "analyze");
        assert_eq!(PipelinePhase::running(Phase::Synthesize), PipelinePhase::Synthesizing);
        assert_eq!(PipelinePhase::Processing.step(), Some(Phase::Process));
        assert!(PipelinePhase::Error.step().is_none());
    }

    #[test]
    fn test_transitions() {
        assert!(PipelinePhase::Start.can_transition_to(PipelinePhase::Analyzing));
        assert!(PipelinePhase::Analyzing.can_transition_to(PipelinePhase::Error));
        assert!(PipelinePhase::Error.can_transition_to(PipelinePhase::Done));
        assert!(!PipelinePhase::Analyzing.can_transition_to(PipelinePhase::Synthesizing));
        assert!(!PipelinePhase::Done.can_transition_to(PipelinePhase::Error));
        assert!(!PipelinePhase::Error.can_transition_to(PipelinePhase::Processing));
    }

    #[test]
    fn test_timeouts_default() {
        let timeouts = PhaseTimeouts::default();
        assert_eq!(timeouts.seconds(Phase::Analyze), 30.0);
        assert_eq!(timeouts.seconds(Phase::Process), 60.0);
        assert_eq!(timeouts.seconds(Phase::Synthesize), 120.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_phase_completes() {
        let budget = PhaseBudget::new(Phase::Analyze, 5.0);
        let cancel = CancellationToken::new();

        let value = run_phase(&budget, &cancel, async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert_eq!(value, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_phase_with_huge_budget_does_not_time_out() {
        let budget = PhaseBudget::new(Phase::Analyze, 1e20);
        let cancel = CancellationToken::new();

        let value = run_phase(&budget, &cancel, async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            7
        })
        .await;

        assert_eq!(value, Ok(7));
        assert_eq!(budget.timeout_seconds(), 1e20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_budget_expires_at_once() {
        let budget = PhaseBudget::new(Phase::Process, -1.0);
        let cancel = CancellationToken::new();

        let result = run_phase(&budget, &cancel, async {
            tokio::time::sleep(Duration::from_millis(1)).await;
        })
        .await;

        assert!(matches!(result, Err(PhaseInterrupt::TimedOut(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_phase_times_out() {
        let budget = PhaseBudget::new(Phase::Synthesize, 2.0);
        let cancel = CancellationToken::new();

        let result = run_phase(&budget, &cancel, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

        assert_eq!(
            result,
            Err(PhaseInterrupt::TimedOut(PhaseTimeout::new("synthesize", 2.0)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_phase_cancelled_first() {
        let budget = PhaseBudget::new(Phase::Process, 5.0);
        let cancel = CancellationToken::new();
        cancel.cancel("client disconnected");

        let result = run_phase(&budget, &cancel, async { 1 }).await;
        assert_eq!(
            result,
            Err(PhaseInterrupt::Cancelled("client disconnected".to_string()))
        );
    }

    #[tokio::test]
    async fn test_run_phase_catches_panic() {
        let budget = PhaseBudget::new(Phase::Analyze, 5.0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            run_phase(&budget, &cancel, async { panic!("boom") }).await;
        assert_eq!(result, Err(PhaseInterrupt::Panicked("boom".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_remaining() {
        let budget = PhaseBudget::new(Phase::Analyze, 3.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(budget.remaining(), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(budget.remaining(), Duration::ZERO);
    }
}
