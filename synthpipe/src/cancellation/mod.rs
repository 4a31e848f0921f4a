//! Cooperative cancellation.
//!
//! A `CancellationToken` is shared between the host (which cancels it when the
//! client goes away) and the orchestrator (which stops producing tokens and
//! issues no further upstream calls once it fires).

mod token;

pub use token::CancellationToken;
