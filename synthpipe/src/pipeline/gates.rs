//! Validation gates between pipeline steps.
//!
//! Gates are pure: they look at a step's output and decide whether the
//! pipeline may advance. A rejection carries a reason naming the violated
//! constraint.

use serde::{Deserialize, Serialize};

use crate::contracts::{AnalysisOutput, ProcessOutput};

/// Result of a gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the output passed.
    pub valid: bool,
    /// Why it did not.
    pub reason: Option<String>,
}

impl ValidationResult {
    /// A passing result.
    #[must_use]
    pub fn pass() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    /// A rejection.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }

    /// Returns true if the output passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// A check on one step's output.
pub trait ValidationGate<T>: Send + Sync {
    /// Checks the output.
    fn validate(&self, output: &T) -> ValidationResult;
}

/// Requires a non-empty intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisValidationGate;

impl ValidationGate<AnalysisOutput> for AnalysisValidationGate {
    fn validate(&self, output: &AnalysisOutput) -> ValidationResult {
        if output.intent.trim().is_empty() {
            return ValidationResult::reject("analysis intent must not be empty");
        }
        ValidationResult::pass()
    }
}

/// Requires non-empty content and enough confidence.
#[derive(Debug, Clone, Copy)]
pub struct ProcessValidationGate {
    min_confidence: f64,
}

impl Default for ProcessValidationGate {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl ProcessValidationGate {
    /// Creates a gate with an inclusive confidence threshold.
    #[must_use]
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// The threshold.
    #[must_use]
    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }
}

impl ValidationGate<ProcessOutput> for ProcessValidationGate {
    fn validate(&self, output: &ProcessOutput) -> ValidationResult {
        if output.content.trim().is_empty() {
            return ValidationResult::reject("processed content must not be empty");
        }
        if output.confidence < self.min_confidence {
            return ValidationResult::reject(format!(
                "confidence {} is below the minimum threshold of {}",
                output.confidence, self.min_confidence
            ));
        }
        ValidationResult::pass()
    }
}
