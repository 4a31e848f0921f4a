//! Testing utilities for synthpipe pipelines.
//!
//! This module provides:
//! - `ScriptedUpstream`, a deterministic upstream client
//! - Fixtures that wire an orchestrator to it
//! - Assertions on pipeline outcomes

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_completed, assert_failed_in, assert_path};
pub use fixtures::{
    analysis_json, fast_config, happy_upstream, process_json, routing_prompts, TestPipeline,
};
pub use mocks::{ScriptedCall, ScriptedStream, ScriptedUpstream};
