//! The analyze, process and synthesize pipeline.
//!
//! This module provides:
//! - Per-request pipeline state with write-once step outputs
//! - Validation gates between steps
//! - The three upstream-backed steps
//! - Phase budgets with timeout and cancellation enforcement
//! - The orchestrator state machine

mod gates;
mod orchestrator;
mod phase;
mod state;
mod steps;

pub use gates::{AnalysisValidationGate, ProcessValidationGate, ValidationGate, ValidationResult};
pub use orchestrator::{
    GateDecision, OutcomeStatus, PipelineOrchestrator, PipelineOutcome, PipelineRequest,
    SynthesisStatus,
};
pub use phase::{run_phase, Phase, PhaseBudget, PhaseInterrupt, PhaseTimeouts, PipelinePhase};
pub use state::{Message, PipelineState, Role, StateDelta, StepMetrics};
pub use steps::{AnalyzeStep, ProcessStep, StepRuntime, SynthesisRun, SynthesizeStep};
