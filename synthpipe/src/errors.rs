//! Error types for the synthpipe orchestration core.
//!
//! Upstream failures are classified here as retryable or fatal, and every
//! failure that can reach the orchestrator boundary has a variant that renders
//! into a user-facing message and a dictionary for structured error events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for synthpipe operations.
#[derive(Debug, Error)]
pub enum SynthpipeError {
    /// An upstream call failed after retry handling.
    #[error("{0}")]
    Call(#[from] CallError),

    /// A step output did not match its schema.
    #[error("{0}")]
    Schema(#[from] SchemaValidationError),

    /// A pipeline phase ran past its time budget.
    #[error("{0}")]
    PhaseTimeout(#[from] PhaseTimeout),

    /// Metrics aggregation failed.
    #[error("{0}")]
    Metrics(#[from] MetricsError),

    /// A prompt could not be loaded.
    #[error("{0}")]
    Prompt(#[from] PromptError),

    /// Configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A state field was written twice.
    #[error("{0}")]
    OutputConflict(#[from] OutputConflictError),
}

/// Failure reported by the upstream LLM client.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamError {
    /// The provider throttled the request.
    #[error("Upstream rate limited")]
    RateLimited {
        /// Server hint for when to retry, if one was given.
        retry_after_seconds: Option<f64>,
    },

    /// The provider returned a 5xx response.
    #[error("Upstream server error ({status}): {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Error body or summary.
        message: String,
    },

    /// The request timed out at the transport level.
    #[error("Upstream request timed out")]
    Timeout,

    /// The connection could not be established or was reset.
    #[error("Upstream connection failed: {0}")]
    ConnectionFailed(String),

    /// Any other failure, including 4xx responses.
    #[error("Upstream error: {0}")]
    Other(String),
}

impl UpstreamError {
    /// Creates a server error.
    #[must_use]
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            message: message.into(),
        }
    }

    /// Creates a connection failure.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Creates an unclassified failure.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Returns true if the failure is transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout | Self::ConnectionFailed(_) => true,
            Self::ServerError { status, .. } => (500..600).contains(status),
            Self::Other(_) => false,
        }
    }

    /// Short machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Timeout => "timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Other(_) => "other",
        }
    }
}

/// Raised when a circuit breaker refuses a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit open for '{service_name}' after {failure_count} failures")]
pub struct CircuitOpenError {
    /// The guarded dependency.
    pub service_name: String,
    /// Failure count at the time of refusal.
    pub failure_count: u32,
}

impl CircuitOpenError {
    /// Creates a new circuit open error.
    #[must_use]
    pub fn new(service_name: impl Into<String>, failure_count: u32) -> Self {
        Self {
            service_name: service_name.into(),
            failure_count,
        }
    }
}

/// Outcome of a failed call made through a retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The breaker refused the call; no network attempt was made for this attempt.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    /// Every attempt failed with a retryable error.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last observed error.
        last: UpstreamError,
    },

    /// A non-retryable error ended the attempt loop.
    #[error("{0}")]
    Fatal(UpstreamError),
}

impl CallError {
    /// Returns the underlying upstream error, if any.
    #[must_use]
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            Self::CircuitOpen(_) => None,
            Self::RetriesExhausted { last, .. } => Some(last),
            Self::Fatal(e) => Some(e),
        }
    }

    /// Returns true if the breaker short-circuited the call.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }
}

/// A step output violated its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Schema validation failed for '{field}': {constraint}")]
pub struct SchemaValidationError {
    /// Offending field (or `$` for the whole document).
    pub field: String,
    /// The violated constraint.
    pub constraint: String,
}

impl SchemaValidationError {
    /// Creates a new schema validation error.
    #[must_use]
    pub fn new(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            constraint: constraint.into(),
        }
    }
}

/// A pipeline phase exceeded its time budget.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Phase '{phase}' timed out after {timeout_seconds}s")]
pub struct PhaseTimeout {
    /// Phase name (`analyze`, `process`, `synthesize`).
    pub phase: String,
    /// Configured budget in seconds.
    pub timeout_seconds: f64,
}

impl PhaseTimeout {
    /// Creates a new phase timeout.
    #[must_use]
    pub fn new(phase: impl Into<String>, timeout_seconds: f64) -> Self {
        Self {
            phase: phase.into(),
            timeout_seconds,
        }
    }
}

/// Errors from token and cost aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    /// The usage and model lists differ in length.
    #[error("Length mismatch: {usages} usages for {models} models")]
    LengthMismatch {
        /// Number of usage records.
        usages: usize,
        /// Number of model ids.
        models: usize,
    },

    /// No pricing is known for a model.
    #[error("Unknown model: {0}")]
    UnknownModel(String),
}

/// Errors from loading step prompts.
#[derive(Debug, Error)]
pub enum PromptError {
    /// No prompt is registered for the step.
    #[error("No prompt found for step '{0}'")]
    NotFound(String),

    /// The prompt file exists but is empty.
    #[error("Prompt for step '{0}' is empty")]
    Empty(String),

    /// Reading the prompt failed.
    #[error("Failed to read prompt for step '{step}': {source}")]
    Io {
        /// Step name.
        step: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid configuration '{field}': {message}")]
pub struct ConfigError {
    /// Dotted path to the field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Raised when a write-once state field is written again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Output conflict for step '{step}': {message}")]
pub struct OutputConflictError {
    /// The step name.
    pub step: String,
    /// Additional message.
    pub message: String,
}

impl OutputConflictError {
    /// Creates a new output conflict error.
    #[must_use]
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Errors a single pipeline step can produce.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    /// The upstream call failed.
    #[error("{0}")]
    Call(#[from] CallError),

    /// The structured output did not validate.
    #[error("{0}")]
    Schema(#[from] SchemaValidationError),

    /// The step tried to overwrite state it already produced.
    #[error("{0}")]
    StateConflict(#[from] OutputConflictError),
}

impl From<CircuitOpenError> for StepError {
    fn from(err: CircuitOpenError) -> Self {
        Self::Call(CallError::CircuitOpen(err))
    }
}

/// Why a run was routed to the error branch.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineFailure {
    /// A validation gate rejected a step's output.
    GateRejected {
        /// Phase whose output was rejected.
        phase: String,
        /// Reason emitted by the gate.
        reason: String,
    },

    /// A step failed.
    Step {
        /// Phase that failed.
        phase: String,
        /// The step error.
        error: StepError,
    },

    /// A phase ran out of time.
    PhaseTimeout(PhaseTimeout),

    /// A phase panicked.
    Panicked {
        /// Phase that panicked.
        phase: String,
        /// Panic payload, if it was a string.
        message: String,
    },
}

impl PipelineFailure {
    /// Returns the phase the failure occurred in.
    #[must_use]
    pub fn phase(&self) -> &str {
        match self {
            Self::GateRejected { phase, .. }
            | Self::Step { phase, .. }
            | Self::Panicked { phase, .. } => phase,
            Self::PhaseTimeout(t) => &t.phase,
        }
    }

    /// Short machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GateRejected { .. } => "gate_rejected",
            Self::Step {
                error: StepError::Call(CallError::CircuitOpen(_)),
                ..
            } => "circuit_open",
            Self::Step {
                error: StepError::Call(_),
                ..
            } => "upstream_error",
            Self::Step {
                error: StepError::Schema(_),
                ..
            } => "schema_validation",
            Self::Step {
                error: StepError::StateConflict(_),
                ..
            } => "state_conflict",
            Self::PhaseTimeout(_) => "phase_timeout",
            Self::Panicked { .. } => "internal",
        }
    }

    /// Diagnostic reason, suitable for logs and error events.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::GateRejected { reason, .. } => reason.clone(),
            Self::Step { error, .. } => error.to_string(),
            Self::PhaseTimeout(t) => t.to_string(),
            Self::Panicked { message, .. } => format!("Internal error: {message}"),
        }
    }

    /// Human-readable message shown to the end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::GateRejected { reason, .. } => {
                format!("I couldn't complete your request: {reason}.")
            }
            Self::Step {
                error: StepError::Call(CallError::CircuitOpen(_)),
                ..
            } => "The AI service is temporarily unavailable. Please try again shortly."
                .to_string(),
            Self::Step {
                error: StepError::Call(_),
                ..
            } => "The AI service failed to respond. Please try again.".to_string(),
            Self::Step { .. } => {
                "I received an unexpected response while working on your request.".to_string()
            }
            Self::PhaseTimeout(t) => format!(
                "Your request took too long during the {} step. Please try again.",
                t.phase
            ),
            Self::Panicked { .. } => FALLBACK_ERROR_MESSAGE.to_string(),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("phase".to_string(), serde_json::json!(self.phase()));
        map.insert("reason".to_string(), serde_json::json!(self.reason()));

        match self {
            Self::PhaseTimeout(t) => {
                map.insert("timeout_seconds".to_string(), serde_json::json!(t.timeout_seconds));
            }
            Self::Step {
                error: StepError::Call(CallError::CircuitOpen(open)),
                ..
            } => {
                map.insert("service".to_string(), serde_json::json!(open.service_name));
                map.insert("failure_count".to_string(), serde_json::json!(open.failure_count));
            }
            Self::Step {
                error: StepError::Schema(schema),
                ..
            } => {
                map.insert("field".to_string(), serde_json::json!(schema.field));
                map.insert("constraint".to_string(), serde_json::json!(schema.constraint));
            }
            _ => {}
        }

        map
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.phase(), self.kind(), self.reason())
    }
}

/// Message used when no failure context is available.
pub const FALLBACK_ERROR_MESSAGE: &str =
    "Sorry, something went wrong while handling your request. Please try again.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_classification() {
        assert!(UpstreamError::RateLimited { retry_after_seconds: None }.is_retryable());
        assert!(UpstreamError::Timeout.is_retryable());
        assert!(UpstreamError::connection("reset").is_retryable());
        assert!(UpstreamError::server(503, "unavailable").is_retryable());
        assert!(!UpstreamError::server(400, "bad request").is_retryable());
        assert!(!UpstreamError::other("invalid api key").is_retryable());
    }

    #[test]
    fn test_upstream_error_serialize() {
        let json = serde_json::to_value(UpstreamError::server(502, "bad gateway")).unwrap();
        assert_eq!(json["type"], "server_error");
        assert_eq!(json["status"], 502);
    }

    #[test]
    fn test_circuit_open_message() {
        let err = CircuitOpenError::new("analyze", 5);
        assert_eq!(err.to_string(), "Circuit open for 'analyze' after 5 failures");
    }

    #[test]
    fn test_call_error_upstream() {
        let exhausted = CallError::RetriesExhausted {
            attempts: 3,
            last: UpstreamError::Timeout,
        };
        assert_eq!(exhausted.upstream(), Some(&UpstreamError::Timeout));
        assert!(!exhausted.is_circuit_open());

        let open = CallError::from(CircuitOpenError::new("x", 1));
        assert!(open.upstream().is_none());
        assert!(open.is_circuit_open());
    }

    #[test]
    fn test_phase_timeout_failure_to_dict() {
        let failure = PipelineFailure::PhaseTimeout(PhaseTimeout::new("synthesize", 2.0));
        let dict = failure.to_dict();

        assert_eq!(dict.get("type").unwrap(), "phase_timeout");
        assert_eq!(dict.get("phase").unwrap(), "synthesize");
        assert_eq!(dict.get("timeout_seconds").unwrap(), 2.0);
    }

    #[test]
    fn test_schema_failure_kind() {
        let failure = PipelineFailure::Step {
            phase: "process".to_string(),
            error: StepError::Schema(SchemaValidationError::new("confidence", "must be in [0, 1]")),
        };
        assert_eq!(failure.kind(), "schema_validation");
        assert_eq!(failure.to_dict().get("field").unwrap(), "confidence");
        assert!(!failure.user_message().is_empty());
    }

    #[test]
    fn test_gate_rejection_display() {
        let failure = PipelineFailure::GateRejected {
            phase: "analyze".to_string(),
            reason: "intent must not be empty".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "[analyze:gate_rejected] intent must not be empty"
        );
    }
}
