//! Trace context propagation.
//!
//! This module provides:
//! - `TraceContext` carrying request and user ids
//! - Task-local scoped activation with `with_context`
//! - `spawn_traced` for copy-on-branch propagation into spawned tasks

mod trace;

pub use trace::{spawn_traced, with_context, TraceContext, REQUEST_ID_HEADER, USER_ID_HEADER};
