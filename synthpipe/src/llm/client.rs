//! Upstream LLM client contract and wire types.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::context::{TraceContext, REQUEST_ID_HEADER, USER_ID_HEADER};
use crate::errors::UpstreamError;

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

impl Usage {
    /// Creates a usage record.
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Returns total tokens.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A single upstream request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// System prompt for the step.
    pub system_prompt: String,
    /// User-facing prompt built from pipeline state.
    pub user_prompt: String,
    /// Model id.
    pub model: String,
    /// Completion token limit.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Extra transport headers, e.g. trace ids.
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl LlmRequest {
    /// Creates a request with no extra headers.
    #[must_use]
    pub fn new(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            model: model.into(),
            max_tokens: 1024,
            temperature: 0.7,
            extra_headers: BTreeMap::new(),
        }
    }

    /// Sets the completion token limit.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Adds a transport header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// Adds the trace headers of the active context, if one is active.
    #[must_use]
    pub fn with_trace_headers(mut self) -> Self {
        if let Some(ctx) = TraceContext::current() {
            self.extra_headers.extend(ctx.headers());
        }
        self
    }

    /// Request id header value, if present.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.extra_headers.get(REQUEST_ID_HEADER).map(String::as_str)
    }

    /// User id header value, if present.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.extra_headers.get(USER_ID_HEADER).map(String::as_str)
    }
}

/// A complete (non-streaming) upstream response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Response text.
    pub text: String,
    /// Token usage.
    pub usage: Usage,
    /// Model that served the request.
    pub model: String,
}

impl LlmResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(text: impl Into<String>, usage: Usage, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage,
            model: model.into(),
        }
    }

    /// Converts to span attributes.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("llm.model".to_string(), serde_json::json!(self.model));
        map.insert("llm.input_tokens".to_string(), serde_json::json!(self.usage.input_tokens));
        map.insert("llm.output_tokens".to_string(), serde_json::json!(self.usage.output_tokens));
        map.insert("llm.total_tokens".to_string(), serde_json::json!(self.usage.total_tokens()));
        map
    }
}

/// One fragment of a streamed response.
///
/// Usage is only ever attached to the final fragment, and may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text fragment.
    pub text: String,
    /// Usage, on the final fragment only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// A text fragment without usage.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    /// A final fragment carrying usage.
    #[must_use]
    pub fn last(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            usage: Some(usage),
        }
    }
}

/// Ordered stream of response fragments.
pub type TokenStream = BoxStream<'static, Result<StreamChunk, UpstreamError>>;

/// The upstream LLM dependency.
///
/// Implementations are black-box RPC clients; the pipeline wraps every
/// call in retry and circuit-breaker handling.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Issues a complete request.
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, UpstreamError>;

    /// Opens a streaming request.
    ///
    /// Errors returned here happen before the first fragment; errors inside
    /// the stream interrupt it mid-way.
    async fn stream(&self, request: LlmRequest) -> Result<TokenStream, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_total() {
        assert_eq!(Usage::new(100, 50).total_tokens(), 150);
    }

    #[test]
    fn test_request_builder() {
        let request = LlmRequest::new("sys", "user", "claude-3-5-haiku")
            .with_max_tokens(256)
            .with_temperature(0.2)
            .with_header("X-Custom", "1");

        assert_eq!(request.max_tokens, 256);
        assert!((request.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(request.extra_headers.get("X-Custom").unwrap(), "1");
        assert!(request.request_id().is_none());
    }

    #[tokio::test]
    async fn test_trace_headers_from_active_context() {
        let request = TraceContext::new("req-9")
            .with_user_id("user-3")
            .scope(async { LlmRequest::new("s", "u", "m").with_trace_headers() })
            .await;

        assert_eq!(request.request_id(), Some("req-9"));
        assert_eq!(request.user_id(), Some("user-3"));
    }

    #[test]
    fn test_trace_headers_without_context() {
        let request = LlmRequest::new("s", "u", "m").with_trace_headers();
        assert!(request.extra_headers.is_empty());
    }

    #[test]
    fn test_response_attributes() {
        let response = LlmResponse::new("hi", Usage::new(3, 4), "m");
        let attrs = response.to_otel_attributes();
        assert_eq!(attrs.get("llm.total_tokens").unwrap(), 7);
    }
}
