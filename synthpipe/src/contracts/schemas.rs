//! Structured output schemas for the three pipeline steps.

use crate::errors::SchemaValidationError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// JSON type a schema field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A JSON string.
    String,
    /// A JSON number.
    Number,
    /// A JSON array of strings.
    StringArray,
    /// A JSON object.
    Object,
    /// A JSON string drawn from a fixed set.
    OneOf(&'static [&'static str]),
}

/// A field in a step schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Field name as emitted by the model.
    pub name: &'static str,
    /// Accepted alternative spelling.
    pub alias: Option<&'static str>,
    /// Expected JSON type.
    pub kind: FieldKind,
    /// Whether the field must be present.
    pub required: bool,
}

impl FieldSpec {
    const fn required(name: &'static str, alias: Option<&'static str>, kind: FieldKind) -> Self {
        Self {
            name,
            alias,
            kind,
            required: true,
        }
    }

    const fn optional(name: &'static str, alias: Option<&'static str>, kind: FieldKind) -> Self {
        Self {
            name,
            alias,
            kind,
            required: false,
        }
    }
}

/// A structured step output with a declared schema.
pub trait StepSchema: Serialize + DeserializeOwned + Send + Sync {
    /// Schema name used in diagnostics.
    const NAME: &'static str;

    /// Declared fields.
    fn fields() -> &'static [FieldSpec];

    /// Semantic checks beyond JSON shape.
    fn check(&self) -> Result<(), SchemaValidationError> {
        Ok(())
    }
}

/// Complexity of a request as judged by the analyze step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// A single, direct answer.
    Simple,
    /// Some reasoning or several parts.
    Moderate,
    /// Multi-step reasoning.
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Output of the analyze step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    /// What the user is trying to achieve.
    pub intent: String,
    /// Salient entities, in order of appearance.
    #[serde(default, alias = "keyEntities")]
    pub key_entities: Vec<String>,
    /// Estimated complexity.
    pub complexity: Complexity,
    /// Free-form context for later steps.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

const ANALYSIS_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("intent", None, FieldKind::String),
    FieldSpec::optional("key_entities", Some("keyEntities"), FieldKind::StringArray),
    FieldSpec::required(
        "complexity",
        None,
        FieldKind::OneOf(&["simple", "moderate", "complex"]),
    ),
    FieldSpec::optional("context", None, FieldKind::Object),
];

impl StepSchema for AnalysisOutput {
    const NAME: &'static str = "AnalysisOutput";

    fn fields() -> &'static [FieldSpec] {
        ANALYSIS_FIELDS
    }
}

/// Output of the process step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// The processed content handed to synthesis.
    pub content: String,
    /// Model's confidence in the content, in `[0, 1]`.
    pub confidence: f64,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

const PROCESS_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("content", None, FieldKind::String),
    FieldSpec::required("confidence", None, FieldKind::Number),
    FieldSpec::optional("metadata", None, FieldKind::Object),
];

impl StepSchema for ProcessOutput {
    const NAME: &'static str = "ProcessOutput";

    fn fields() -> &'static [FieldSpec] {
        PROCESS_FIELDS
    }

    fn check(&self) -> Result<(), SchemaValidationError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(SchemaValidationError::new(
                "confidence",
                format!("must be within [0, 1], got {}", self.confidence),
            ));
        }
        Ok(())
    }
}

/// How the synthesized text is formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Formatting {
    /// Markdown.
    Markdown,
    /// Plain prose.
    Plain,
    /// Machine-readable JSON.
    Structured,
}

impl Formatting {
    /// Infers the formatting of a finished response.
    #[must_use]
    pub fn detect(text: &str) -> Self {
        let trimmed = text.trim();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
        {
            return Self::Structured;
        }

        let markdown = trimmed.lines().any(|line| {
            let line = line.trim_start();
            line.starts_with('#')
                || line.starts_with("- ")
                || line.starts_with("* ")
                || line.starts_with("```")
                || line.starts_with("> ")
        }) || trimmed.contains("**")
            || trimmed.contains("](");

        if markdown {
            Self::Markdown
        } else {
            Self::Plain
        }
    }
}

impl fmt::Display for Formatting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Markdown => write!(f, "markdown"),
            Self::Plain => write!(f, "plain"),
            Self::Structured => write!(f, "structured"),
        }
    }
}

/// Output of the synthesize step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisOutput {
    /// The final response text.
    #[serde(alias = "finalText")]
    pub final_text: String,
    /// Detected formatting.
    pub formatting: Formatting,
}

const SYNTHESIS_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("final_text", Some("finalText"), FieldKind::String),
    FieldSpec::required(
        "formatting",
        None,
        FieldKind::OneOf(&["markdown", "plain", "structured"]),
    ),
];

impl SynthesisOutput {
    /// Builds the output from streamed text, detecting its formatting.
    pub fn from_text(text: impl Into<String>) -> Result<Self, SchemaValidationError> {
        let final_text = text.into();
        let output = Self {
            formatting: Formatting::detect(&final_text),
            final_text,
        };
        output.check()?;
        Ok(output)
    }
}

impl StepSchema for SynthesisOutput {
    const NAME: &'static str = "SynthesisOutput";

    fn fields() -> &'static [FieldSpec] {
        SYNTHESIS_FIELDS
    }

    fn check(&self) -> Result<(), SchemaValidationError> {
        if self.final_text.trim().is_empty() {
            return Err(SchemaValidationError::new("final_text", "must not be empty"));
        }
        Ok(())
    }
}
