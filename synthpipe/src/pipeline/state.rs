//! Per-request pipeline state.
//!
//! State is created fresh for each request and only changes through
//! [`PipelineState::apply`], which enforces the write-once fields and the
//! append-only message log.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::contracts::{AnalysisOutput, ProcessOutput, SynthesisOutput};
use crate::errors::{OutputConflictError, PipelineFailure};
use crate::metrics::{PipelineTotals, StepRecord};

pub use crate::metrics::StepMetrics;

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user.
    User,
    /// The pipeline.
    Assistant,
}

/// A conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
}

impl Message {
    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Changes returned by one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    step: String,
    messages: Vec<Message>,
    analysis: Option<AnalysisOutput>,
    processed_content: Option<ProcessOutput>,
    synthesis: Option<SynthesisOutput>,
    final_response: Option<String>,
    record: Option<StepRecord>,
}

impl StateDelta {
    /// An empty delta produced by `step`.
    #[must_use]
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            ..Self::default()
        }
    }

    /// Step that produced the delta.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Appends a message.
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Sets the analysis.
    #[must_use]
    pub fn with_analysis(mut self, analysis: AnalysisOutput) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// Sets the processed content.
    #[must_use]
    pub fn with_processed_content(mut self, processed: ProcessOutput) -> Self {
        self.processed_content = Some(processed);
        self
    }

    /// Sets the synthesis and the final response it carries.
    #[must_use]
    pub fn with_synthesis(mut self, synthesis: SynthesisOutput) -> Self {
        self.final_response = Some(synthesis.final_text.clone());
        self.synthesis = Some(synthesis);
        self
    }

    /// Sets the final response only.
    #[must_use]
    pub fn with_final_response(mut self, text: impl Into<String>) -> Self {
        self.final_response = Some(text.into());
        self
    }

    /// Sets the step metadata entry.
    #[must_use]
    pub fn with_record(mut self, record: StepRecord) -> Self {
        self.record = Some(record);
        self
    }
}

/// Accumulated state of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    messages: Vec<Message>,
    analysis: Option<AnalysisOutput>,
    processed_content: Option<ProcessOutput>,
    synthesis: Option<SynthesisOutput>,
    final_response: Option<String>,
    step_metadata: BTreeMap<String, StepRecord>,
    trace_id: String,
    user_id: Option<String>,
    failure: Option<PipelineFailure>,
}

impl PipelineState {
    /// Creates state seeded with prior messages.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, user_id: Option<String>, messages: Vec<Message>) -> Self {
        Self {
            messages,
            analysis: None,
            processed_content: None,
            synthesis: None,
            final_response: None,
            step_metadata: BTreeMap::new(),
            trace_id: trace_id.into(),
            user_id,
            failure: None,
        }
    }

    /// Attaches a failure, as if a step had failed.
    #[must_use]
    pub fn with_failure(mut self, failure: PipelineFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Conversation so far, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The most recent user message.
    #[must_use]
    pub fn latest_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Analyze step output.
    #[must_use]
    pub fn analysis(&self) -> Option<&AnalysisOutput> {
        self.analysis.as_ref()
    }

    /// Process step output.
    #[must_use]
    pub fn processed_content(&self) -> Option<&ProcessOutput> {
        self.processed_content.as_ref()
    }

    /// Synthesize step output.
    #[must_use]
    pub fn synthesis(&self) -> Option<&SynthesisOutput> {
        self.synthesis.as_ref()
    }

    /// The response returned to the user.
    #[must_use]
    pub fn final_response(&self) -> Option<&str> {
        self.final_response.as_deref()
    }

    /// Per-step metrics and failure records.
    #[must_use]
    pub fn step_metadata(&self) -> &BTreeMap<String, StepRecord> {
        &self.step_metadata
    }

    /// Request id.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// User id, if known.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Why the run went to the error branch, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<&PipelineFailure> {
        self.failure.as_ref()
    }

    /// Records the failure that routes the run to the error branch.
    ///
    /// The first failure wins.
    pub fn record_failure(&mut self, failure: PipelineFailure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }

    /// Totals of the completed steps.
    #[must_use]
    pub fn totals(&self) -> PipelineTotals {
        crate::metrics::aggregate_steps(&self.step_metadata)
    }

    /// Merges a step's delta.
    ///
    /// Fails without changing anything if the delta would overwrite a field
    /// that is already set.
    pub fn apply(&mut self, delta: StateDelta) -> Result<(), OutputConflictError> {
        let conflict = |field: &str| {
            OutputConflictError::new(delta.step.clone(), format!("{field} is already set"))
        };

        if delta.analysis.is_some() && self.analysis.is_some() {
            return Err(conflict("analysis"));
        }
        if delta.processed_content.is_some() && self.processed_content.is_some() {
            return Err(conflict("processed_content"));
        }
        if delta.synthesis.is_some() && self.synthesis.is_some() {
            return Err(conflict("synthesis"));
        }
        if delta.final_response.is_some() && self.final_response.is_some() {
            return Err(conflict("final_response"));
        }
        if delta.record.is_some() && self.step_metadata.contains_key(&delta.step) {
            return Err(conflict("step metadata"));
        }

        let StateDelta {
            step,
            messages,
            analysis,
            processed_content,
            synthesis,
            final_response,
            record,
        } = delta;

        self.messages.extend(messages);
        if analysis.is_some() {
            self.analysis = analysis;
        }
        if processed_content.is_some() {
            self.processed_content = processed_content;
        }
        if synthesis.is_some() {
            self.synthesis = synthesis;
        }
        if final_response.is_some() {
            self.final_response = final_response;
        }
        if let Some(record) = record {
            self.step_metadata.insert(step, record);
        }
        Ok(())
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("trace_id".to_string(), serde_json::json!(self.trace_id));
        map.insert("user_id".to_string(), serde_json::json!(self.user_id));
        map.insert("messages".to_string(), serde_json::json!(self.messages));
        map.insert("analysis".to_string(), serde_json::json!(self.analysis));
        map.insert(
            "processed_content".to_string(),
            serde_json::json!(self.processed_content),
        );
        map.insert("final_response".to_string(), serde_json::json!(self.final_response));
        map.insert("step_metadata".to_string(), serde_json::json!(self.step_metadata));
        if let Some(ref failure) = self.failure {
            map.insert("failure".to_string(), serde_json::json!(failure.to_dict()));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Complexity;
    use crate::metrics::ERROR_STEP;
    use chrono::Utc;

    fn analysis(intent: &str) -> AnalysisOutput {
        AnalysisOutput {
            intent: intent.to_string(),
            key_entities: vec![],
            complexity: Complexity::Simple,
            context: serde_json::Map::new(),
        }
    }

    fn record(tokens: u64) -> StepRecord {
        StepRecord::Completed(StepMetrics {
            elapsed_seconds: 1.0,
            input_tokens: tokens,
            output_tokens: 0,
            cost_usd: 0.0,
            model: "m".to_string(),
            started_at: Utc::now(),
        })
    }

    #[test]
    fn test_new_state() {
        let state = PipelineState::new("req-1", None, vec![Message::user("hi")]);
        assert_eq!(state.trace_id(), "req-1");
        assert_eq!(state.latest_user_message(), Some("hi"));
        assert!(state.analysis().is_none());
        assert!(state.final_response().is_none());
    }

    #[test]
    fn test_apply_sets_fields_and_appends() {
        let mut state = PipelineState::new("req-1", None, vec![Message::user("hi")]);
        state
            .apply(
                StateDelta::new("analyze")
                    .with_analysis(analysis("greet"))
                    .with_message(Message::assistant("{}"))
                    .with_record(record(10)),
            )
            .unwrap();

        assert_eq!(state.analysis().unwrap().intent, "greet");
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.totals().total_tokens, 10);
    }

    #[test]
    fn test_apply_rejects_overwrite_atomically() {
        let mut state = PipelineState::new("req-1", None, vec![]);
        state
            .apply(StateDelta::new("analyze").with_analysis(analysis("a")))
            .unwrap();

        let err = state
            .apply(
                StateDelta::new("analyze")
                    .with_analysis(analysis("b"))
                    .with_message(Message::assistant("dup")),
            )
            .unwrap_err();

        assert_eq!(err.step, "analyze");
        assert_eq!(state.analysis().unwrap().intent, "a");
        assert!(state.messages().is_empty());
    }

    #[test]
    fn test_final_response_written_once() {
        let mut state = PipelineState::new("req-1", None, vec![]);
        state
            .apply(StateDelta::new(ERROR_STEP).with_final_response("sorry"))
            .unwrap();
        assert!(state
            .apply(StateDelta::new(ERROR_STEP).with_final_response("again"))
            .is_err());
        assert_eq!(state.final_response(), Some("sorry"));
    }

    #[test]
    fn test_first_failure_wins() {
        let mut state = PipelineState::new("req-1", None, vec![]);
        state.record_failure(PipelineFailure::GateRejected {
            phase: "analyze".to_string(),
            reason: "first".to_string(),
        });
        state.record_failure(PipelineFailure::GateRejected {
            phase: "process".to_string(),
            reason: "second".to_string(),
        });
        assert_eq!(state.failure().unwrap().phase(), "analyze");
    }

    #[test]
    fn test_to_dict() {
        let state = PipelineState::new("req-1", Some("u-1".to_string()), vec![]);
        let dict = state.to_dict();
        assert_eq!(dict.get("trace_id").unwrap(), "req-1");
        assert_eq!(dict.get("user_id").unwrap(), "u-1");
        assert!(!dict.contains_key("failure"));
    }
}
