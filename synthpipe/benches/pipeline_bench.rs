//! Benchmarks for the hot paths of a pipeline run.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;

use synthpipe::contracts::{extract_json_object, AnalysisOutput, TypedStepOutput};
use synthpipe::metrics::{aggregate_steps, StepMetrics, StepRecord};
use synthpipe::pipeline::{ProcessValidationGate, ValidationGate};
use synthpipe::prelude::{
    CircuitBreaker, CircuitBreakerConfig, ProcessOutput, RetryConfig, RetryPolicy,
};

const ANALYSIS_REPLY: &str = "Here is my analysis:\n```json\n{\"intent\": \"explain ownership\", \
\"key_entities\": [\"rust\", \"borrowing\"], \"complexity\": \"moderate\", \
\"context\": {\"audience\": \"beginner\"}}\n```";

fn parsing_benchmark(c: &mut Criterion) {
    c.bench_function("extract_json_object", |b| {
        b.iter(|| extract_json_object(black_box(ANALYSIS_REPLY)));
    });

    let parser = TypedStepOutput::<AnalysisOutput>::new();
    c.bench_function("parse_analysis", |b| {
        b.iter(|| parser.parse_text(black_box(ANALYSIS_REPLY)));
    });
}

fn resilience_benchmark(c: &mut Criterion) {
    let policy = RetryPolicy::new(RetryConfig::default());
    c.bench_function("retry_delay_for", |b| {
        b.iter(|| {
            for attempt in 1..=5 {
                black_box(policy.delay_for(black_box(attempt)));
            }
        });
    });

    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    c.bench_function("breaker_allow_and_record", |b| {
        b.iter(|| {
            if breaker.allow_request().is_ok() {
                breaker.record_success();
            }
        });
    });
}

fn gate_and_metrics_benchmark(c: &mut Criterion) {
    let gate = ProcessValidationGate::default();
    let output = ProcessOutput {
        content: "Ownership moves values; borrows lend them.".to_string(),
        confidence: 0.72,
        metadata: serde_json::Map::new(),
    };
    c.bench_function("process_gate", |b| {
        b.iter(|| gate.validate(black_box(&output)));
    });

    let mut steps = BTreeMap::new();
    for (step, tokens) in [("analyze", 150), ("process", 500), ("synthesize", 350)] {
        steps.insert(
            step.to_string(),
            StepRecord::Completed(StepMetrics {
                elapsed_seconds: 1.0,
                input_tokens: tokens / 2,
                output_tokens: tokens / 2,
                cost_usd: 0.001,
                model: "claude-3-5-haiku-20241022".to_string(),
                started_at: Utc::now(),
            }),
        );
    }
    steps.insert(
        "error".to_string(),
        StepRecord::Failed {
            error: "gate rejected".to_string(),
        },
    );
    c.bench_function("aggregate_steps", |b| {
        b.iter(|| aggregate_steps(black_box(&steps)));
    });
}

criterion_group!(
    benches,
    parsing_benchmark,
    resilience_benchmark,
    gate_and_metrics_benchmark
);
criterion_main!(benches);
