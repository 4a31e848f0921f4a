//! Resilience primitives for upstream calls.
//!
//! This module provides:
//! - `CircuitBreaker` for failing fast on an unhealthy dependency
//! - `CircuitBreakerRegistry` sharing one breaker per dependency name
//! - `RetryPolicy` for bounded exponential backoff that reports to the breaker

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use registry::CircuitBreakerRegistry;
pub use retry::{JitterStrategy, RetryAttempt, RetryConfig, RetryDecision, RetryPolicy};
