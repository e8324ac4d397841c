// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pipeline composition tests for nocap
//!
//! These tests drive chains, routers and aggregate trackers through the public
//! API only, the way a pipeline built from config would be used.
//!
//! # Test Categories
//!
//! - Weighted aggregate progress
//! - Chain disposal of intermediate data
//! - Router dispatch
//! - Cancellation propagation through chains
//! - End-to-end progress of a two-step chain

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nocap::command::{CancellationToken, Command, TimeEstimate};
use nocap::progress::{AggregateProgressTracker, MutableProgressTracker, ProgressSnapshot, ProgressTracker};
use nocap::commands::{TextOperation, TextTransform};
use nocap::{CommandChain, CommandError, DataRouter, TypedData, TypedDataType};

const EPSILON: f64 = 1e-9;

fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < EPSILON, "expected {}, got {}", expected, actual);
}

/// Shared record of which named values were disposed, in order.
#[derive(Clone, Default)]
struct DisposalLog(Arc<Mutex<Vec<String>>>);

impl DisposalLog {
    fn tracked(&self, data: TypedData) -> TypedData {
        let log = self.0.clone();
        let name = data.name().to_string();
        data.with_disposer(move || log.lock().unwrap().push(name))
    }

    fn count(&self, name: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|n| *n == name).count()
    }

    fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Text step that appends its own name and tags its output for disposal tracking.
struct Step {
    name: String,
    log: DisposalLog,
    accepts: TypedDataType,
    calls: AtomicUsize,
    fail_with: Option<CommandError>,
}

impl Step {
    fn new(name: &str, log: &DisposalLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            accepts: TypedDataType::Text,
            calls: AtomicUsize::new(0),
            fail_with: None,
        }
    }

    fn accepting(name: &str, log: &DisposalLog, accepts: TypedDataType) -> Self {
        Self {
            accepts,
            ..Self::new(name, log)
        }
    }

    fn cancelling(name: &str, log: &DisposalLog, cause: &str) -> Self {
        Self {
            fail_with: Some(CommandError::cancelled(name, Some(cause.to_string()))),
            ..Self::new(name, log)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Command for Step {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        vec![self.accepts]
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::FAST
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        _cancel: &CancellationToken,
    ) -> nocap::Result<TypedData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_accepts(input)?;
        if let Some(CommandError::Cancelled(cancellation)) = &self.fail_with {
            return Err(CommandError::Cancelled(cancellation.clone()));
        }

        let text = format!("{}>{}", input.describe(), self.name);
        progress.complete();
        Ok(self.log.tracked(TypedData::from_text(text, format!("{}-out", self.name))))
    }
}

/// Multiplies the integer in its text input; reports halfway before finishing.
struct Multiply {
    name: &'static str,
    factor: i64,
}

impl Command for Multiply {
    fn name(&self) -> &str {
        self.name
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        vec![TypedDataType::Text]
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::MEDIUM
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> nocap::Result<TypedData> {
        let value: i64 = input
            .as_text()
            .and_then(|t| t.trim().parse().ok())
            .ok_or_else(|| CommandError::InvalidArgument("expected an integer".into()))?;
        progress.set_progress(0.5);
        cancel.check(self.name)?;
        progress.set_progress(1.0);
        Ok(TypedData::from_text((value * self.factor).to_string(), self.name))
    }
}

/// Hands its input straight on, optionally tagging the output with a disposer that panics.
struct PassThrough {
    explode_on_dispose: bool,
}

impl Command for PassThrough {
    fn name(&self) -> &str {
        "pass"
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        vec![TypedDataType::Text]
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::INSTANTANEOUS
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        _cancel: &CancellationToken,
    ) -> nocap::Result<TypedData> {
        self.ensure_accepts(input)?;
        progress.complete();
        let output = input.take();
        if self.explode_on_dispose {
            Ok(output.with_disposer(|| panic!("disposer exploded")))
        } else {
            Ok(output)
        }
    }
}

fn run(command: &dyn Command, mut input: TypedData) -> (nocap::Result<TypedData>, TypedData) {
    let result = command.process(&mut input, &Arc::new(MutableProgressTracker::new()), &CancellationToken::new());
    (result, input)
}

// =============================================================================
// AGGREGATE PROGRESS
// =============================================================================

#[test]
fn test_aggregate_matches_weighted_mean() {
    let weights = [1.0, 2.0, 3.0, 4.0];
    let leaves: Vec<Arc<MutableProgressTracker>> = weights.iter().map(|_| Arc::new(MutableProgressTracker::new())).collect();
    let aggregate = AggregateProgressTracker::new(
        leaves
            .iter()
            .zip(weights)
            .map(|(leaf, w)| (leaf.clone() as Arc<dyn ProgressTracker>, w))
            .collect(),
    )
    .unwrap();

    let cases: [[f64; 4]; 4] = [
        [0.0, 0.0, 0.0, 0.0],
        [1.0, 1.0, 1.0, 1.0],
        [1.0, 0.0, 0.5, 0.25],
        [0.2, 0.4, 0.6, 0.8],
    ];
    for values in cases {
        for (leaf, value) in leaves.iter().zip(values) {
            leaf.set_progress(value);
        }
        let expected: f64 = values.iter().zip(weights).map(|(p, w)| p * w).sum::<f64>() / 10.0;
        assert_close(aggregate.progress(), expected);
    }
}

#[test]
fn test_aggregate_zero_weights_use_mean_and_empty_is_zero() {
    let a = Arc::new(MutableProgressTracker::new());
    let b = Arc::new(MutableProgressTracker::new());
    let aggregate = AggregateProgressTracker::new(vec![
        (a.clone() as Arc<dyn ProgressTracker>, 0.0),
        (b.clone() as Arc<dyn ProgressTracker>, 0.0),
    ])
    .unwrap();
    a.set_progress(1.0);
    assert_close(aggregate.progress(), 0.5);

    let empty = AggregateProgressTracker::new(Vec::new()).unwrap();
    assert_close(empty.progress(), 0.0);
}

#[test]
fn test_nested_aggregate_propagates_leaf_writes() {
    let leaf = Arc::new(MutableProgressTracker::new());
    let sibling: Arc<dyn ProgressTracker> = Arc::new(MutableProgressTracker::new());
    let inner = AggregateProgressTracker::equal(vec![leaf.clone() as Arc<dyn ProgressTracker>, sibling]);
    let outer = AggregateProgressTracker::new(vec![
        (inner.clone() as Arc<dyn ProgressTracker>, 1.0),
        (Arc::new(MutableProgressTracker::new()) as Arc<dyn ProgressTracker>, 1.0),
    ])
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    outer.subscribe(Arc::new(move |s: &ProgressSnapshot| sink.lock().unwrap().push(s.progress)));

    leaf.set_progress(1.0);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_close(seen[0], 0.25);
}

// =============================================================================
// CHAIN DISPOSAL
// =============================================================================

#[test]
fn test_chain_disposes_intermediates_only() {
    let log = DisposalLog::default();
    let chain = CommandChain::new("abc")
        .then(Arc::new(Step::new("a", &log)))
        .then(Arc::new(Step::new("b", &log)))
        .then(Arc::new(Step::new("c", &log)));

    let input = log.tracked(TypedData::from_text("in", "input"));
    let (result, input) = run(&chain, input);
    let output = result.unwrap();

    assert_eq!(output.as_text(), Some("in>a>b>c"));
    assert_eq!(log.count("a-out"), 1);
    assert_eq!(log.count("b-out"), 1);
    assert_eq!(log.count("c-out"), 0, "final output belongs to the caller");
    assert_eq!(log.count("input"), 0, "the chain never disposes its input");
    assert!(!input.is_disposed());
    assert_eq!(log.names(), ["a-out", "b-out"]);
}

#[test]
fn test_empty_chain_returns_input() {
    let chain = CommandChain::new("empty");
    assert!(chain.input_data_types().is_empty());

    let (result, _) = run(&chain, TypedData::from_text("same", "s"));
    assert_eq!(result.unwrap().as_text(), Some("same"));
}

#[test]
fn test_chain_never_disposes_input_moved_out_by_a_step() {
    let log = DisposalLog::default();
    let chain = CommandChain::new("shout")
        .then(Arc::new(PassThrough { explode_on_dispose: false }))
        .then(Arc::new(TextTransform::new(vec![TextOperation::Upper])));

    let input = log.tracked(TypedData::from_text("hi", "input"));
    let (result, input) = run(&chain, input);

    assert_eq!(result.unwrap().as_text(), Some("HI"));
    assert_eq!(log.count("input"), 0);
    assert!(!input.is_disposed());

    drop(input);
    assert_eq!(log.count("input"), 1, "the caller still disposes its own input");
}

#[test]
fn test_chain_survives_panicking_disposer() {
    let chain = CommandChain::new("fragile")
        .then(Arc::new(PassThrough { explode_on_dispose: true }))
        .then(Arc::new(TextTransform::new(vec![TextOperation::Upper])));

    let (result, _) = run(&chain, TypedData::from_text("ok", "in"));
    assert_eq!(result.unwrap().as_text(), Some("OK"));
}

// =============================================================================
// ROUTER
// =============================================================================

#[test]
fn test_router_calls_only_matching_route() {
    let log = DisposalLog::default();
    let for_text = Arc::new(Step::new("text-route", &log));
    let for_bytes = Arc::new(Step::accepting("bytes-route", &log, TypedDataType::RawData));

    let router = DataRouter::new("by type")
        .route(TypedDataType::Text, for_text.clone())
        .unwrap()
        .route(TypedDataType::RawData, for_bytes.clone())
        .unwrap();

    let (result, _) = run(&router, TypedData::from_text("x", "x"));
    assert_eq!(result.unwrap().as_text(), Some("x>text-route"));
    assert_eq!((for_text.calls(), for_bytes.calls()), (1, 0));

    let (result, _) = run(&router, TypedData::from_raw_data(vec![1, 2, 3], "blob"));
    assert_eq!(result.unwrap().as_text(), Some("3 bytes>bytes-route"));
    assert_eq!((for_text.calls(), for_bytes.calls()), (1, 1));
}

#[test]
fn test_router_rejects_unrouted_type() {
    let log = DisposalLog::default();
    let router = DataRouter::new("text only")
        .route(TypedDataType::Text, Arc::new(Step::new("t", &log)))
        .unwrap();

    let uri = reqwest::Url::parse("https://example.com/").unwrap();
    let (result, _) = run(&router, TypedData::from_uri(uri, "link"));
    assert!(matches!(result, Err(CommandError::Unrouted(TypedDataType::Uri))));
}

// =============================================================================
// CANCELLATION
// =============================================================================

#[test]
fn test_cancellation_in_second_step_propagates() {
    let log = DisposalLog::default();
    let first = Arc::new(Step::new("first", &log));
    let second = Arc::new(Step::cancelling("second", &log, "user closed the window"));
    let third = Arc::new(Step::new("third", &log));
    let chain = CommandChain::new("three")
        .then(first.clone())
        .then(second.clone())
        .then(third.clone());

    let (result, input) = run(&chain, TypedData::from_text("in", "input"));

    let cancellation = match result {
        Err(CommandError::Cancelled(cancellation)) => cancellation,
        other => panic!("expected cancellation, got {:?}", other.map(|d| d.describe())),
    };
    assert_eq!(cancellation.command, "second");
    assert_eq!(cancellation.cause.as_deref(), Some("user closed the window"));

    assert_eq!(log.count("first-out"), 1, "first output is released before the signal escapes");
    assert_eq!(third.calls(), 0);
    assert!(!input.is_disposed());
}

#[test]
fn test_cancelled_token_stops_chain_before_next_step() {
    let log = DisposalLog::default();
    let step = Arc::new(Step::new("never", &log));
    let chain = CommandChain::new("stopped").then(step.clone());

    let token = CancellationToken::new();
    token.cancel("shutdown");
    let mut input = TypedData::from_text("in", "input");
    let err = chain
        .process(&mut input, &Arc::new(MutableProgressTracker::new()), &token)
        .unwrap_err();

    assert!(err.is_cancellation());
    assert_eq!(err.cancellation().and_then(|c| c.cause.as_deref()), Some("shutdown"));
    assert_eq!(step.calls(), 0);
}

// =============================================================================
// END TO END
// =============================================================================

#[test]
fn test_double_then_triple_progress() {
    let chain = CommandChain::new("x6")
        .then(Arc::new(Multiply { name: "double", factor: 2 }))
        .then(Arc::new(Multiply { name: "triple", factor: 3 }));

    let progress = Arc::new(MutableProgressTracker::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    progress.subscribe(Arc::new(move |s: &ProgressSnapshot| sink.lock().unwrap().push(s.progress)));

    let mut input = TypedData::from_text("7", "seven");
    let output = chain.process(&mut input, &progress, &CancellationToken::new()).unwrap();

    assert_eq!(output.as_text(), Some("42"));
    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|p| (p - 0.25).abs() < EPSILON), "halfway through double is 0.25: {:?}", seen);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress never goes backwards: {:?}", seen);
    assert_close(progress.progress(), 1.0);
}
