//! End-to-end scenarios through the public API.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use synthpipe::prelude::*;
use synthpipe::testing::{
    analysis_json, assert_completed, assert_failed_in, fast_config, happy_upstream,
    process_json, routing_prompts, ScriptedUpstream, TestPipeline,
};

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn json_config_and_prompt_directory_drive_a_full_run() {
    let dir = tempfile::tempdir().unwrap();
    for step in ["analyze", "process", "synthesize"] {
        std::fs::write(dir.path().join(format!("{step}.txt")), format!("{step}\n")).unwrap();
    }

    let config = assert_ok!(PipelineConfig::from_json_str(
        r#"{
            "retry": {"max_attempts": 2, "jitter": "none"},
            "timeouts": {"synthesize_seconds": 30},
            "circuit_breaker": {"failure_threshold": 2, "open_timeout_seconds": 15},
            "min_confidence_threshold": 0.6
        }"#
    ));
    assert_eq!(config.retry.max_attempts, 2);
    assert_eq!(config.timeouts.analyze_seconds, 30.0);

    let registry = CircuitBreakerRegistry::default();
    let orchestrator = assert_ok!(PipelineOrchestrator::from_config(
        &config,
        Arc::new(happy_upstream(&["Hello", ", ", "world"])),
        &registry,
        &DirectoryPromptLoader::new(dir.path()),
    ));

    let (sink, mut rx) = ChannelSink::new();
    let outcome = orchestrator
        .run(
            PipelineRequest::new("Say hello"),
            &sink,
            &CancellationToken::new(),
        )
        .await;

    assert_completed(&outcome);
    let events = drain(&mut rx);
    assert_eq!(events.len(), 4);
    assert_eq!(
        events[0],
        StreamEvent::Token {
            text: "Hello".to_string()
        }
    );
    assert_eq!(
        events[3],
        StreamEvent::Done {
            totals: outcome.totals
        }
    );
    assert_eq!(registry.len(), 3);
    for snapshot in registry.snapshot() {
        let breaker = registry.get(&snapshot.service).unwrap();
        assert_eq!(breaker.config().failure_threshold, 2);
        assert_eq!(breaker.config().open_timeout_seconds, 15.0);
    }
}

#[tokio::test]
async fn missing_prompt_file_is_a_startup_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("analyze.txt"), "analyze").unwrap();

    let result = PipelineOrchestrator::from_config(
        &PipelineConfig::default(),
        Arc::new(ScriptedUpstream::new()),
        &CircuitBreakerRegistry::default(),
        &DirectoryPromptLoader::new(dir.path()),
    );

    let err = assert_err!(result);
    assert!(err.to_string().contains("process"));
}

#[test]
fn invalid_json_config_is_rejected() {
    assert_err!(PipelineConfig::from_json_str(r#"{"retry": {"max_attempts": 0}}"#));
    assert_err!(PipelineConfig::from_json_str(r#"{"min_confidence_threshold": -0.1}"#));
    assert_err!(PipelineConfig::from_json_str("not json"));
}

#[tokio::test]
async fn dropped_receiver_cancels_the_run() {
    let pipeline = TestPipeline::new(happy_upstream(&["a", "b"]));
    let (sink, rx) = ChannelSink::new();
    drop(rx);

    let outcome = pipeline
        .orchestrator
        .run(PipelineRequest::new("hi"), &sink, &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, OutcomeStatus::Cancelled);
    assert!(outcome.state.final_response().is_none());
}

#[tokio::test]
async fn error_branch_sends_one_error_event() {
    let client = ScriptedUpstream::new()
        .with_call_json(
            "analyze",
            &analysis_json("answer", Complexity::Complex),
            Usage::new(10, 10),
        )
        .with_call_text("process", "I'd rather not say.", Usage::new(10, 10));
    let pipeline = TestPipeline::new(client);
    let (sink, mut rx) = ChannelSink::new();

    let outcome = pipeline
        .orchestrator
        .run(
            PipelineRequest::new("hi").with_request_id("req-err"),
            &sink,
            &CancellationToken::new(),
        )
        .await;

    assert_failed_in(&outcome, "process", "schema_validation");
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error(event) => {
            assert_eq!(event.phase, "process");
            assert_eq!(event.request_id.as_deref(), Some("req-err"));
            assert_eq!(
                outcome.state.final_response(),
                Some(event.message.as_str())
            );
        }
        other => panic!("expected an error event, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_through_half_open_after_timeout() {
    let config = fast_config().with_circuit_breaker(
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_open_timeout_seconds(60.0)
            .with_half_open_required_successes(2),
    );
    let client = [UpstreamError::Timeout, UpstreamError::Timeout, UpstreamError::Timeout]
        .into_iter()
        .fold(ScriptedUpstream::new(), |c, e| c.with_call_error("analyze", e))
        .with_call_json(
            "analyze",
            &analysis_json("recover", Complexity::Simple),
            Usage::new(1, 1),
        )
        .with_call_json("process", &process_json("fine", 0.9), Usage::new(1, 1))
        .with_stream("synthesize", &["ok"], Some(Usage::new(1, 1)));
    let pipeline = TestPipeline::with_config(&config, client);
    let breaker = || pipeline.registry.get("analyze").unwrap();

    let (first, _) = pipeline.run("one").await;
    assert_failed_in(&first, "analyze", "upstream_error");
    assert_eq!(breaker().state(), CircuitState::Open);

    let (second, _) = pipeline.run("two").await;
    assert_failed_in(&second, "analyze", "circuit_open");

    tokio::time::advance(Duration::from_secs(61)).await;

    let (third, _) = pipeline.run("three").await;
    assert_completed(&third);
    assert_eq!(breaker().state(), CircuitState::HalfOpen);

    let (fourth, _) = pipeline.run("four").await;
    assert_completed(&fourth);
    assert_eq!(breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn missing_stream_usage_is_recovered_with_a_follow_up_call() {
    let client = ScriptedUpstream::new()
        .with_call_json(
            "analyze",
            &analysis_json("answer", Complexity::Simple),
            Usage::new(100, 50),
        )
        .with_call_json("process", &process_json("content", 0.9), Usage::new(300, 200))
        .with_stream("synthesize", &["no ", "usage"], None)
        .with_call_text("synthesize", "no usage", Usage::new(150, 200));
    let pipeline = TestPipeline::new(client);

    let (outcome, _) = pipeline.run("hi").await;

    assert_completed(&outcome);
    assert_eq!(outcome.totals.total_tokens, 1000);
    assert_eq!(pipeline.client.calls("synthesize"), 1);
}

#[tokio::test]
async fn usage_recovery_can_be_disabled() {
    let client = ScriptedUpstream::new()
        .with_call_json(
            "analyze",
            &analysis_json("answer", Complexity::Simple),
            Usage::new(100, 50),
        )
        .with_call_json("process", &process_json("content", 0.9), Usage::new(300, 200))
        .with_stream("synthesize", &["no usage"], None);
    let config = fast_config().with_recover_streaming_usage(false);
    let pipeline = TestPipeline::with_config(&config, client);

    let (outcome, _) = pipeline.run("hi").await;

    assert_completed(&outcome);
    assert_eq!(outcome.totals.total_tokens, 650);
    assert_eq!(pipeline.client.calls("synthesize"), 0);
}

#[tokio::test]
async fn failed_usage_recovery_does_not_fail_the_run() {
    let client = ScriptedUpstream::new()
        .with_call_json(
            "analyze",
            &analysis_json("answer", Complexity::Simple),
            Usage::new(100, 50),
        )
        .with_call_json("process", &process_json("content", 0.9), Usage::new(300, 200))
        .with_stream("synthesize", &["still fine"], None)
        .with_call_error("synthesize", UpstreamError::server(500, "down"));
    let pipeline = TestPipeline::new(client);

    let (outcome, sink) = pipeline.run("hi").await;

    assert_completed(&outcome);
    assert_eq!(sink.text(), "still fine");
    assert_eq!(outcome.totals.total_tokens, 650);
    // Recovery bypasses the breaker.
    assert_eq!(
        pipeline.registry.get("synthesize").unwrap().failure_count(),
        0
    );
}

#[tokio::test]
async fn routing_prompts_cover_every_step() {
    let prompts = routing_prompts();
    for step in ["analyze", "process", "synthesize"] {
        assert_eq!(assert_ok!(prompts.load(step)), step);
    }
}
