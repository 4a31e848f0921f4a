//! Scripted upstream client for testing.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::errors::UpstreamError;
use crate::llm::{LlmRequest, LlmResponse, StreamChunk, TokenStream, UpstreamClient, Usage};

/// A scripted reply to a complete call.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// Reply with text after an optional delay.
    Reply {
        /// Response text.
        text: String,
        /// Reported usage.
        usage: Usage,
        /// Simulated latency.
        delay: Duration,
    },
    /// Fail after an optional delay.
    Fail {
        /// Error to return.
        error: UpstreamError,
        /// Simulated latency.
        delay: Duration,
    },
}

/// A scripted streaming reply.
#[derive(Debug, Clone)]
pub enum ScriptedStream {
    /// Yield fragments, then optionally end with an error.
    Fragments {
        /// Fragments in order.
        tokens: Vec<String>,
        /// Usage attached to the final fragment.
        usage: Option<Usage>,
        /// Delay before each fragment.
        per_token_delay: Duration,
        /// Error yielded after the fragments.
        interrupt: Option<UpstreamError>,
    },
    /// Fail to open.
    Fail(UpstreamError),
}

#[derive(Debug, Default)]
struct Route {
    calls: VecDeque<ScriptedCall>,
    streams: VecDeque<ScriptedStream>,
    call_count: usize,
    stream_count: usize,
}

/// Deterministic [`UpstreamClient`] driven by scripts.
///
/// Requests are routed by their system prompt. Each route plays its
/// scripted replies in order and keeps repeating the last one once the
/// script runs out.
#[derive(Debug, Default)]
pub struct ScriptedUpstream {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedUpstream {
    /// Creates a client with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a complete-call reply.
    #[must_use]
    pub fn with_call(self, route: &str, reply: ScriptedCall) -> Self {
        self.routes
            .lock()
            .entry(route.to_string())
            .or_default()
            .calls
            .push_back(reply);
        self
    }

    /// Queues a successful text reply.
    #[must_use]
    pub fn with_call_text(self, route: &str, text: impl Into<String>, usage: Usage) -> Self {
        self.with_call(
            route,
            ScriptedCall::Reply {
                text: text.into(),
                usage,
                delay: Duration::ZERO,
            },
        )
    }

    /// Queues a JSON reply.
    #[must_use]
    pub fn with_call_json(self, route: &str, value: &serde_json::Value, usage: Usage) -> Self {
        self.with_call_text(route, value.to_string(), usage)
    }

    /// Queues a failure.
    #[must_use]
    pub fn with_call_error(self, route: &str, error: UpstreamError) -> Self {
        self.with_call(
            route,
            ScriptedCall::Fail {
                error,
                delay: Duration::ZERO,
            },
        )
    }

    /// Queues a streaming reply.
    #[must_use]
    pub fn with_stream_script(self, route: &str, script: ScriptedStream) -> Self {
        self.routes
            .lock()
            .entry(route.to_string())
            .or_default()
            .streams
            .push_back(script);
        self
    }

    /// Queues a stream that yields `tokens`.
    #[must_use]
    pub fn with_stream(self, route: &str, tokens: &[&str], usage: Option<Usage>) -> Self {
        self.with_stream_script(route, fragments(tokens, usage, Duration::ZERO, None))
    }

    /// Queues a stream that waits `per_token_delay` before each fragment.
    #[must_use]
    pub fn with_slow_stream(self, route: &str, tokens: &[&str], per_token_delay: Duration) -> Self {
        self.with_stream_script(route, fragments(tokens, None, per_token_delay, None))
    }

    /// Queues a stream that fails after yielding `tokens`.
    #[must_use]
    pub fn with_stream_interrupted(self, route: &str, tokens: &[&str], error: UpstreamError) -> Self {
        self.with_stream_script(route, fragments(tokens, None, Duration::ZERO, Some(error)))
    }

    /// Queues a stream that fails to open.
    #[must_use]
    pub fn with_stream_error(self, route: &str, error: UpstreamError) -> Self {
        self.with_stream_script(route, ScriptedStream::Fail(error))
    }

    /// Complete calls received on a route.
    #[must_use]
    pub fn calls(&self, route: &str) -> usize {
        self.routes.lock().get(route).map_or(0, |r| r.call_count)
    }

    /// Streams opened on a route.
    #[must_use]
    pub fn streams(&self, route: &str) -> usize {
        self.routes.lock().get(route).map_or(0, |r| r.stream_count)
    }

    /// All requests received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    /// Total requests of either kind.
    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_call(&self, request: &LlmRequest) -> Option<ScriptedCall> {
        self.requests.lock().push(request.clone());
        let mut routes = self.routes.lock();
        let route = routes.entry(request.system_prompt.clone()).or_default();
        route.call_count += 1;
        next_or_last(&mut route.calls)
    }

    fn next_stream(&self, request: &LlmRequest) -> Option<ScriptedStream> {
        self.requests.lock().push(request.clone());
        let mut routes = self.routes.lock();
        let route = routes.entry(request.system_prompt.clone()).or_default();
        route.stream_count += 1;
        next_or_last(&mut route.streams)
    }
}

fn fragments(
    tokens: &[&str],
    usage: Option<Usage>,
    per_token_delay: Duration,
    interrupt: Option<UpstreamError>,
) -> ScriptedStream {
    ScriptedStream::Fragments {
        tokens: tokens.iter().map(|t| (*t).to_string()).collect(),
        usage,
        per_token_delay,
        interrupt,
    }
}

fn next_or_last<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

fn unscripted(request: &LlmRequest) -> UpstreamError {
    UpstreamError::other(format!(
        "no scripted reply for route '{}'",
        request.system_prompt
    ))
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, UpstreamError> {
        match self.next_call(&request) {
            Some(ScriptedCall::Reply { text, usage, delay }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(LlmResponse::new(text, usage, request.model))
            }
            Some(ScriptedCall::Fail { error, delay }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Err(error)
            }
            None => Err(unscripted(&request)),
        }
    }

    async fn stream(&self, request: LlmRequest) -> Result<TokenStream, UpstreamError> {
        let (tokens, usage, delay, interrupt) = match self.next_stream(&request) {
            Some(ScriptedStream::Fragments {
                tokens,
                usage,
                per_token_delay,
                interrupt,
            }) => (tokens, usage, per_token_delay, interrupt),
            Some(ScriptedStream::Fail(error)) => return Err(error),
            None => return Err(unscripted(&request)),
        };

        let last = tokens.len().saturating_sub(1);
        let mut items: Vec<Result<StreamChunk, UpstreamError>> = tokens
            .into_iter()
            .enumerate()
            .map(|(i, text)| match usage {
                Some(usage) if i == last => Ok(StreamChunk::last(text, usage)),
                _ => Ok(StreamChunk::text(text)),
            })
            .collect();
        if let Some(error) = interrupt {
            items.push(Err(error));
        }

        Ok(futures::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(route: &str) -> LlmRequest {
        LlmRequest::new(route, "user", "model")
    }

    #[tokio::test]
    async fn test_calls_play_in_order_then_repeat_last() {
        let client = ScriptedUpstream::new()
            .with_call_error("analyze", UpstreamError::Timeout)
            .with_call_text("analyze", "ok", Usage::new(1, 2));

        assert!(client.call(request("analyze")).await.is_err());
        assert_eq!(client.call(request("analyze")).await.unwrap().text, "ok");
        assert_eq!(client.call(request("analyze")).await.unwrap().text, "ok");
        assert_eq!(client.calls("analyze"), 3);
    }

    #[tokio::test]
    async fn test_unscripted_route_fails() {
        let client = ScriptedUpstream::new();
        let err = client.call(request("nowhere")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(client.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_stream_attaches_usage_to_last_fragment() {
        let client =
            ScriptedUpstream::new().with_stream("synthesize", &["a", "b"], Some(Usage::new(1, 1)));

        let chunks: Vec<_> = client
            .stream(request("synthesize"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].as_ref().unwrap().usage.is_none());
        assert_eq!(chunks[1].as_ref().unwrap().usage, Some(Usage::new(1, 1)));
        assert_eq!(client.streams("synthesize"), 1);
    }

    #[tokio::test]
    async fn test_interrupted_stream() {
        let client = ScriptedUpstream::new().with_stream_interrupted(
            "synthesize",
            &["a"],
            UpstreamError::Timeout,
        );

        let chunks: Vec<_> = client
            .stream(request("synthesize"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], Err(UpstreamError::Timeout));
    }
}
