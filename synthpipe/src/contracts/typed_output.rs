//! Typed output helper that validates structured step payloads.
//!
//! Model responses are free text that is expected to contain one JSON
//! object. `TypedStepOutput` extracts that object, checks it against the
//! schema's declared fields, deserializes it with serde and finally runs the
//! schema's semantic checks.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::marker::PhantomData;

use super::schemas::{FieldKind, FieldSpec, StepSchema};
use crate::errors::SchemaValidationError;

/// Field name used when the whole document is at fault.
pub const DOCUMENT_FIELD: &str = "$";

/// Configuration for typed output validation.
#[derive(Debug, Clone, Default)]
pub struct TypedOutputConfig {
    /// Reject fields the schema does not declare.
    pub strict: bool,
}

impl TypedOutputConfig {
    /// Creates a new config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables strict validation.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

/// Typed step output parser with validation.
#[derive(Debug)]
pub struct TypedStepOutput<T> {
    config: TypedOutputConfig,
    _marker: PhantomData<T>,
}

impl<T: StepSchema> TypedStepOutput<T> {
    /// Creates a new typed output handler.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TypedOutputConfig::default())
    }

    /// Creates a new typed output handler with config.
    #[must_use]
    pub fn with_config(config: TypedOutputConfig) -> Self {
        Self {
            config,
            _marker: PhantomData,
        }
    }

    /// Parses raw model text into a validated payload.
    pub fn parse_text(&self, text: &str) -> Result<T, SchemaValidationError> {
        let json = extract_json_object(text).ok_or_else(|| {
            SchemaValidationError::new(DOCUMENT_FIELD, "response does not contain a JSON object")
        })?;
        let value: Value = serde_json::from_str(json).map_err(|e| {
            SchemaValidationError::new(DOCUMENT_FIELD, format!("invalid JSON: {e}"))
        })?;
        self.from_json(value)
    }

    /// Validates a JSON value and deserializes it.
    pub fn from_json(&self, value: Value) -> Result<T, SchemaValidationError> {
        let Value::Object(map) = value else {
            return Err(SchemaValidationError::new(
                DOCUMENT_FIELD,
                "payload must be a JSON object",
            ));
        };

        validate_fields(&map, T::fields(), self.config.strict)?;

        let payload: T = serde_json::from_value(Value::Object(map)).map_err(|e| {
            SchemaValidationError::new(DOCUMENT_FIELD, format!("{} mismatch: {e}", T::NAME))
        })?;
        payload.check()?;
        Ok(payload)
    }

    /// Validates a payload and returns its dictionary form.
    pub fn serialize(&self, payload: &T) -> Result<HashMap<String, Value>, SchemaValidationError> {
        payload.check()?;
        match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
            Ok(_) => Err(SchemaValidationError::new(
                DOCUMENT_FIELD,
                "payload must serialize to an object",
            )),
            Err(e) => Err(SchemaValidationError::new(
                DOCUMENT_FIELD,
                format!("serialization error: {e}"),
            )),
        }
    }
}

impl<T: StepSchema> Default for TypedStepOutput<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the JSON object in a model response.
///
/// Accepts bare JSON, fenced code blocks, and objects embedded in prose.
#[must_use]
pub fn extract_json_object(text: &str) -> Option<&str> {
    let mut body = text.trim();

    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }

    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

/// Checks presence and JSON types of declared fields.
pub fn validate_fields(
    map: &Map<String, Value>,
    fields: &[FieldSpec],
    strict: bool,
) -> Result<(), SchemaValidationError> {
    for spec in fields {
        let value = map
            .get(spec.name)
            .or_else(|| spec.alias.and_then(|alias| map.get(alias)));

        match value {
            None | Some(Value::Null) if spec.required => {
                return Err(SchemaValidationError::new(spec.name, "is required"));
            }
            None | Some(Value::Null) => {}
            Some(value) => check_kind(spec, value)?,
        }
    }

    if strict {
        if let Some(unknown) = map.keys().find(|key| {
            !fields
                .iter()
                .any(|spec| spec.name == key.as_str() || spec.alias == Some(key.as_str()))
        }) {
            return Err(SchemaValidationError::new(unknown.clone(), "is not a declared field"));
        }
    }

    Ok(())
}

fn check_kind(spec: &FieldSpec, value: &Value) -> Result<(), SchemaValidationError> {
    let ok = match spec.kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Object => value.is_object(),
        FieldKind::StringArray => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string)),
        FieldKind::OneOf(allowed) => {
            return match value.as_str() {
                Some(s) if allowed.contains(&s) => Ok(()),
                _ => Err(SchemaValidationError::new(
                    spec.name,
                    format!("must be one of [{}]", allowed.join(", ")),
                )),
            };
        }
    };

    if ok {
        Ok(())
    } else {
        let expected = match spec.kind {
            FieldKind::String => "a string",
            FieldKind::Number => "a number",
            FieldKind::Object => "an object",
            FieldKind::StringArray => "a list of strings",
            FieldKind::OneOf(_) => "an allowed value",
        };
        Err(SchemaValidationError::new(spec.name, format!("must be {expected}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{AnalysisOutput, Complexity, ProcessOutput};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), Some(r#"{"a":1}"#));
        assert_eq!(
            extract_json_object("```json\n{\"a\": 1}\n```"),
            Some("{\"a\": 1}")
        );
        assert_eq!(
            extract_json_object("Here you go: {\"a\": {\"b\": 2}} thanks"),
            Some("{\"a\": {\"b\": 2}}")
        );
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn test_parse_analysis() {
        let parser = TypedStepOutput::<AnalysisOutput>::new();
        let out = parser
            .parse_text(r#"{"intent":"summarize","key_entities":["doc"],"complexity":"moderate"}"#)
            .unwrap();

        assert_eq!(out.intent, "summarize");
        assert_eq!(out.complexity, Complexity::Moderate);
    }

    #[test]
    fn test_empty_intent_is_schema_valid() {
        let parser = TypedStepOutput::<AnalysisOutput>::new();
        let out = parser
            .parse_text(r#"{"intent":"","complexity":"simple"}"#)
            .unwrap();
        assert!(out.intent.is_empty());
    }

    #[test]
    fn test_missing_required_field() {
        let parser = TypedStepOutput::<AnalysisOutput>::new();
        let err = parser.parse_text(r#"{"complexity":"simple"}"#).unwrap_err();
        assert_eq!(err.field, "intent");
        assert_eq!(err.constraint, "is required");
    }

    #[test]
    fn test_enum_violation() {
        let parser = TypedStepOutput::<AnalysisOutput>::new();
        let err = parser
            .parse_text(r#"{"intent":"x","complexity":"extreme"}"#)
            .unwrap_err();
        assert_eq!(err.field, "complexity");
        assert!(err.constraint.contains("simple"));
    }

    #[test]
    fn test_wrong_type() {
        let parser = TypedStepOutput::<ProcessOutput>::new();
        let err = parser
            .parse_text(r#"{"content":"x","confidence":"high"}"#)
            .unwrap_err();
        assert_eq!(err.field, "confidence");
    }

    #[test]
    fn test_range_violation() {
        let parser = TypedStepOutput::<ProcessOutput>::new();
        let err = parser
            .parse_text(r#"{"content":"x","confidence":1.5}"#)
            .unwrap_err();
        assert_eq!(err.field, "confidence");
    }

    #[test]
    fn test_strict_rejects_unknown_fields() {
        let parser = TypedStepOutput::<ProcessOutput>::with_config(TypedOutputConfig::new().strict());
        let err = parser
            .parse_text(r#"{"content":"x","confidence":0.7,"extra":true}"#)
            .unwrap_err();
        assert_eq!(err.field, "extra");
    }

    #[test]
    fn test_not_json() {
        let parser = TypedStepOutput::<ProcessOutput>::new();
        let err = parser.parse_text("I cannot help with that").unwrap_err();
        assert_eq!(err.field, DOCUMENT_FIELD);
    }

    #[test]
    fn test_serialize() {
        let parser = TypedStepOutput::<ProcessOutput>::new();
        let data = parser
            .serialize(&ProcessOutput {
                content: "c".to_string(),
                confidence: 0.9,
                metadata: Map::new(),
            })
            .unwrap();
        assert_eq!(data.get("content").unwrap(), "c");
    }
}
