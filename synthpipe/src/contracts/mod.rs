//! Step output contracts.
//!
//! Each pipeline step returns a structured payload that must validate
//! against its schema before it is accepted into pipeline state.

mod schemas;
mod typed_output;

pub use schemas::{
    AnalysisOutput, Complexity, FieldKind, FieldSpec, Formatting, ProcessOutput, StepSchema,
    SynthesisOutput,
};
pub use typed_output::{
    extract_json_object, validate_fields, TypedOutputConfig, TypedStepOutput, DOCUMENT_FIELD,
};
