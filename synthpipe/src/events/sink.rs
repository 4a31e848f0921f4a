//! Token sink trait and implementations.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::{PipelineFailure, FALLBACK_ERROR_MESSAGE};
use crate::metrics::PipelineTotals;

/// The consumer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Sink closed")]
pub struct SinkClosed;

/// Structured error payload sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Phase the failure occurred in.
    pub phase: String,
    /// Machine-readable failure kind.
    pub kind: String,
    /// Diagnostic reason.
    pub reason: String,
    /// Message for the end user.
    pub message: String,
    /// Request id, when a trace context was active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorEvent {
    /// Builds the event for a pipeline failure.
    #[must_use]
    pub fn from_failure(failure: &PipelineFailure, request_id: Option<String>) -> Self {
        Self {
            phase: failure.phase().to_string(),
            kind: failure.kind().to_string(),
            reason: failure.reason(),
            message: failure.user_message(),
            request_id,
        }
    }

    /// Event used when no failure context is available.
    #[must_use]
    pub fn fallback(request_id: Option<String>) -> Self {
        Self {
            phase: "pipeline".to_string(),
            kind: "internal".to_string(),
            reason: "no failure recorded".to_string(),
            message: FALLBACK_ERROR_MESSAGE.to_string(),
            request_id,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

/// Event delivered to a streaming consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A synthesized text fragment.
    Token {
        /// The fragment.
        text: String,
    },
    /// The run finished successfully.
    Done {
        /// Run totals.
        totals: PipelineTotals,
    },
    /// The run ended on the error branch.
    Error(ErrorEvent),
}

/// Streaming output consumer for a pipeline run.
///
/// Called synchronously from within the synthesize phase; `emit` must not
/// block. An `Err(SinkClosed)` from `emit` means the client disconnected.
pub trait TokenSink: Send + Sync {
    /// Forwards one token.
    fn emit(&self, token: &str) -> Result<(), SinkClosed>;

    /// Signals successful completion.
    fn complete(&self, totals: &PipelineTotals);

    /// Signals a failed run.
    fn fail(&self, error: &ErrorEvent);
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl TokenSink for NoOpSink {
    fn emit(&self, _token: &str) -> Result<(), SinkClosed> {
        Ok(())
    }

    fn complete(&self, _totals: &PipelineTotals) {}

    fn fail(&self, _error: &ErrorEvent) {}
}

/// Forwards events over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiving half.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns true once the receiver has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).map_err(|_| SinkClosed)
    }
}

impl TokenSink for ChannelSink {
    fn emit(&self, token: &str) -> Result<(), SinkClosed> {
        self.send(StreamEvent::Token {
            text: token.to_string(),
        })
    }

    fn complete(&self, totals: &PipelineTotals) {
        if self.send(StreamEvent::Done { totals: *totals }).is_err() {
            debug!("Receiver dropped before completion event");
        }
    }

    fn fail(&self, error: &ErrorEvent) {
        if self.send(StreamEvent::Error(error.clone())).is_err() {
            debug!("Receiver dropped before error event");
        }
    }
}

/// A collecting sink for testing purposes.
///
/// Can be told to report closure after a number of tokens to simulate a
/// client disconnect.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: RwLock<Vec<StreamEvent>>,
    close_after: Option<usize>,
}

impl CollectingSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `SinkClosed` once `tokens` tokens have been accepted.
    #[must_use]
    pub fn closing_after(tokens: usize) -> Self {
        Self {
            events: RwLock::default(),
            close_after: Some(tokens),
        }
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.read().clone()
    }

    /// Returns the collected tokens in order.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Token { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the concatenated tokens.
    #[must_use]
    pub fn text(&self) -> String {
        self.tokens().concat()
    }

    /// Returns the completion totals, if completed.
    #[must_use]
    pub fn completed(&self) -> Option<PipelineTotals> {
        self.events.read().iter().find_map(|event| match event {
            StreamEvent::Done { totals } => Some(*totals),
            _ => None,
        })
    }

    /// Returns the error event, if failed.
    #[must_use]
    pub fn error(&self) -> Option<ErrorEvent> {
        self.events.read().iter().find_map(|event| match event {
            StreamEvent::Error(error) => Some(error.clone()),
            _ => None,
        })
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl TokenSink for CollectingSink {
    fn emit(&self, token: &str) -> Result<(), SinkClosed> {
        let mut events = self.events.write();
        if let Some(limit) = self.close_after {
            let accepted = events
                .iter()
                .filter(|e| matches!(e, StreamEvent::Token { .. }))
                .count();
            if accepted >= limit {
                return Err(SinkClosed);
            }
        }
        events.push(StreamEvent::Token {
            text: token.to_string(),
        });
        Ok(())
    }

    fn complete(&self, totals: &PipelineTotals) {
        self.events.write().push(StreamEvent::Done { totals: *totals });
    }

    fn fail(&self, error: &ErrorEvent) {
        self.events.write().push(StreamEvent::Error(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PhaseTimeout;

    fn timeout_event() -> ErrorEvent {
        ErrorEvent::from_failure(
            &PipelineFailure::PhaseTimeout(PhaseTimeout::new("synthesize", 2.0)),
            Some("req-1".to_string()),
        )
    }

    #[test]
    fn test_noop_sink() {
        let sink = NoOpSink;
        assert!(sink.emit("x").is_ok());
        sink.complete(&PipelineTotals::default());
        sink.fail(&timeout_event());
    }

    #[test]
    fn test_error_event_from_failure() {
        let event = timeout_event();
        assert_eq!(event.phase, "synthesize");
        assert_eq!(event.kind, "phase_timeout");
        assert_eq!(event.to_dict().get("request_id").unwrap(), "req-1");
    }

    #[test]
    fn test_fallback_event() {
        let event = ErrorEvent::fallback(None);
        assert_eq!(event.kind, "internal");
        assert_eq!(event.message, FALLBACK_ERROR_MESSAGE);
    }

    #[test]
    fn test_stream_event_serialize() {
        let json = serde_json::to_value(StreamEvent::Token {
            text: "Hi".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "token");
        assert_eq!(json["text"], "Hi");

        let json = serde_json::to_value(StreamEvent::Error(timeout_event())).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["phase"], "synthesize");
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit("a").unwrap();
        sink.emit("b").unwrap();
        sink.complete(&PipelineTotals::default());

        assert_eq!(rx.recv().await, Some(StreamEvent::Token { text: "a".into() }));
        assert_eq!(rx.recv().await, Some(StreamEvent::Token { text: "b".into() }));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Done { .. })));
    }

    #[test]
    fn test_channel_sink_reports_closed() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);

        assert!(sink.is_closed());
        assert_eq!(sink.emit("lost"), Err(SinkClosed));
        sink.fail(&timeout_event());
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        assert!(sink.is_empty());

        sink.emit("Hello").unwrap();
        sink.emit(", world").unwrap();
        sink.complete(&PipelineTotals::default());

        assert_eq!(sink.text(), "Hello, world");
        assert_eq!(sink.len(), 3);
        assert!(sink.completed().is_some());
        assert!(sink.error().is_none());
    }

    #[test]
    fn test_collecting_sink_closing_after() {
        let sink = CollectingSink::closing_after(1);
        assert!(sink.emit("one").is_ok());
        assert_eq!(sink.emit("two"), Err(SinkClosed));
        assert_eq!(sink.tokens(), vec!["one".to_string()]);
    }
}
