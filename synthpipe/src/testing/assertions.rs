//! Test assertions for pipeline outcomes.

use crate::pipeline::{OutcomeStatus, PipelineOutcome, PipelinePhase};

/// Asserts that the run completed with a final response.
pub fn assert_completed(outcome: &PipelineOutcome) {
    assert_eq!(
        outcome.status,
        OutcomeStatus::Completed,
        "Expected completion, got {:?} with failure {:?}",
        outcome.status,
        outcome.failure()
    );
    assert!(
        outcome.state.final_response().is_some(),
        "Completed run has no final response"
    );
}

/// Asserts that the run took the error branch for `phase` with `kind`.
pub fn assert_failed_in(outcome: &PipelineOutcome, phase: &str, kind: &str) {
    assert_eq!(outcome.status, OutcomeStatus::Failed, "Expected a failed run");
    let failure = outcome
        .failure()
        .unwrap_or_else(|| panic!("Failed run has no recorded failure"));
    assert_eq!(failure.phase(), phase, "Failure in unexpected phase: {failure}");
    assert_eq!(failure.kind(), kind, "Unexpected failure kind: {failure}");
    assert!(
        outcome
            .state
            .final_response()
            .is_some_and(|text| !text.trim().is_empty()),
        "Failed run must carry a non-empty fallback response"
    );
}

/// Asserts the exact sequence of states visited.
pub fn assert_path(outcome: &PipelineOutcome, expected: &[PipelinePhase]) {
    assert_eq!(outcome.path, expected, "Unexpected pipeline path");
}
