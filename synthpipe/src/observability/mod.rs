//! Logging setup and span attributes.

mod tracing;

pub use self::tracing::{
    init_tracing, LogFormat, PipelineSpanAttributes, SpanTimer, StepSpanAttributes,
    DEFAULT_LOG_FILTER,
};
