#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

// Span propagation through the interpreter
//
// Every span opened is closed exactly once, with a status derived from the
// body's outcome, and the ambient span is restored on every exit path.

use std::fmt;
use std::time::Duration;

use assert_matches::assert_matches;
use weft_effects::testing::TestRuntime;
use weft_effects::{
    attributes, AttributeValue, Attributes, BatchProcessor, Effect, InMemoryExporter, Interruptor,
    MetricsExporter, Outcome, RunOptions, Runtime, SpanStatus, INTERRUPTED_ATTRIBUTE,
};

#[derive(Debug, Clone, PartialEq)]
struct Rejected(&'static str);

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected: {}", self.0)
    }
}

fn no_attributes() -> Attributes {
    Attributes::new()
}

// ============================================================================
// Pairing and status
// ============================================================================

#[tokio::test]
async fn test_nested_spans_link_parent_and_child() {
    let harness = TestRuntime::new();
    let effect: Effect<u32, Rejected> = Effect::succeed(1)
        .with_span("db.query", attributes([("table", "users".into())]))
        .map(|n| n + 1)
        .with_span("handler", no_attributes());

    let report = harness.runtime.run_with(effect, RunOptions::new()).await;
    assert_eq!(report.outcome, Outcome::Success(2));

    let trace = report.trace;
    assert_eq!(trace.len(), 2);
    assert!(trace.all_closed());
    let handler = trace.find("handler").unwrap();
    let query = trace.find("db.query").unwrap();
    assert_eq!(handler.parent, None);
    assert_eq!(query.parent, Some(handler.id));
    assert_eq!(query.attribute("table").and_then(AttributeValue::as_str), Some("users"));
    assert_eq!(handler.status, SpanStatus::Ok);
    assert_eq!(query.status, SpanStatus::Ok);
}

#[tokio::test]
async fn test_failure_and_defect_close_with_error() {
    let harness = TestRuntime::new();
    let failing: Effect<u32, Rejected> =
        Effect::fail(Rejected("quota")).with_span("charge", no_attributes());
    let report = harness.runtime.run_with(failing, RunOptions::new()).await;
    assert_eq!(report.outcome, Outcome::Failure(Rejected("quota")));
    assert_eq!(
        report.trace.find("charge").unwrap().status,
        SpanStatus::Error {
            message: "rejected: quota".into()
        }
    );

    let dying: Effect<u32, Rejected> =
        Effect::die_message("ledger corrupt").with_span("charge", no_attributes());
    let report = harness.runtime.run_with(dying, RunOptions::new()).await;
    let status = &report.trace.find("charge").unwrap().status;
    assert!(status.is_error());
    assert!(status.to_string().contains("ledger corrupt"));
}

#[tokio::test]
async fn test_recovered_failure_inside_span_closes_ok() {
    let harness = TestRuntime::new();
    let effect: Effect<u32, Rejected> = Effect::fail(Rejected("first try"))
        .with_span("attempt", no_attributes())
        .catch_all(|_| Effect::succeed(7))
        .with_span("request", no_attributes());
    let report = harness.runtime.run_with(effect, RunOptions::new()).await;
    assert_eq!(report.outcome, Outcome::Success(7));
    assert!(report.trace.find("attempt").unwrap().status.is_error());
    assert_eq!(report.trace.find("request").unwrap().status, SpanStatus::Ok);
}

#[tokio::test]
async fn test_ambient_span_is_restored_between_siblings() {
    let harness = TestRuntime::new();
    let first: Effect<(), Rejected> = Effect::unit().with_span("first", no_attributes());
    let second: Effect<(), Rejected> = Effect::unit().with_span("second", no_attributes());
    let effect = first.then(second).with_span("root", no_attributes());

    let trace = harness.runtime.run_with(effect, RunOptions::new()).await.trace;
    let root = trace.find("root").unwrap();
    let names: Vec<_> = trace
        .children_of(root.id)
        .into_iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(names, vec!["first", "second"]);
}

// ============================================================================
// Suspension and annotation
// ============================================================================

#[tokio::test]
async fn test_span_stays_current_across_suspension() {
    let harness = TestRuntime::new();
    let effect: Effect<(), Rejected> = Effect::sleep(Duration::from_millis(50))
        .then(Effect::annotate_current_span(attributes([("after.sleep", true.into())])))
        .with_span("slow", no_attributes());

    let trace = harness.runtime.run_with(effect, RunOptions::new()).await.trace;
    let slow = trace.find("slow").unwrap();
    assert_eq!(slow.duration(), Some(Duration::from_millis(50)));
    assert_eq!(slow.attribute("after.sleep"), Some(&AttributeValue::Bool(true)));
}

#[tokio::test]
async fn test_annotate_outside_any_span_is_a_no_op() {
    let harness = TestRuntime::new();
    let effect: Effect<(), Rejected> =
        Effect::annotate_current_span(attributes([("orphan", 1.into())]));
    let report = harness.runtime.run_with(effect, RunOptions::new()).await;
    assert_eq!(report.outcome, Outcome::Success(()));
    assert!(report.trace.is_empty());
}

#[tokio::test]
async fn test_annotation_lands_on_innermost_span() {
    let harness = TestRuntime::new();
    let effect: Effect<(), Rejected> =
        Effect::annotate_current_span(attributes([("level", "inner".into())]))
            .with_span("inner", no_attributes())
            .then(Effect::annotate_current_span(attributes([("level", "outer".into())])))
            .with_span("outer", no_attributes());
    let trace = harness.runtime.run_with(effect, RunOptions::new()).await.trace;
    assert_eq!(
        trace.find("inner").unwrap().attribute("level").and_then(AttributeValue::as_str),
        Some("inner")
    );
    assert_eq!(
        trace.find("outer").unwrap().attribute("level").and_then(AttributeValue::as_str),
        Some("outer")
    );
}

// ============================================================================
// Concurrency and cancellation
// ============================================================================

#[tokio::test]
async fn test_forked_fiber_inherits_ambient_span() {
    let harness = TestRuntime::new();
    let child: Effect<u32, Rejected> = Effect::succeed(5).with_span("child", no_attributes());
    let effect = child
        .fork()
        .flat_map(|fiber| fiber.join())
        .with_span("parent", no_attributes());

    let report = harness.runtime.run_with(effect, RunOptions::new()).await;
    assert_eq!(report.outcome, Outcome::Success(5));
    let parent = report.trace.find("parent").unwrap();
    let child = report.trace.find("child").unwrap();
    assert_eq!(child.parent, Some(parent.id));
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_span_closes_ok_and_marked() {
    let runtime = Runtime::builder().build();
    let interruptor = Interruptor::new();
    let effect: Effect<(), Rejected> = Effect::sleep(Duration::from_secs(60))
        .with_span("inner", no_attributes())
        .with_span("outer", no_attributes());

    let trigger = interruptor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.interrupt();
    });
    let report = runtime
        .run_with(effect, RunOptions::new().with_interruptor(interruptor))
        .await;

    assert_matches!(report.outcome, Outcome::Interrupted);
    assert!(report.trace.all_closed());
    for name in ["inner", "outer"] {
        let span = report.trace.find(name).unwrap();
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(
            span.attribute(INTERRUPTED_ATTRIBUTE),
            Some(&AttributeValue::Bool(true))
        );
    }
}

// ============================================================================
// Export pipeline
// ============================================================================

#[tokio::test]
async fn test_exported_spans_carry_trace_and_service() {
    let harness = TestRuntime::new();
    let effect: Effect<u32, Rejected> = Effect::succeed(1)
        .with_span("leaf", no_attributes())
        .with_span("root", no_attributes());
    let report = harness.runtime.run_with(effect, RunOptions::new()).await;

    // children close first
    assert_eq!(harness.spans.names(), vec!["leaf", "root"]);
    for span in harness.spans.spans() {
        assert_eq!(span.trace_id, report.trace.trace_id);
        assert_eq!(span.service_name, "weft-test");
    }
    let leaf = harness.spans.find("leaf").unwrap();
    assert_eq!(leaf.parent_id, Some(report.trace.find("root").unwrap().id));
}

#[tokio::test]
async fn test_batch_processor_flushes_at_end_of_run() {
    let metrics = MetricsExporter::new(InMemoryExporter::new());
    let runtime = Runtime::builder()
        .processor(BatchProcessor::new(metrics.clone(), 2))
        .build();
    let effect: Effect<(), Rejected> = Effect::unit()
        .with_span("a", no_attributes())
        .then(Effect::fail(Rejected("no")).with_span("b", no_attributes()))
        .catch_all(|_| Effect::<(), Rejected>::unit().with_span("c", no_attributes()));

    let _ = runtime.run(effect).await;
    assert_eq!(metrics.inner().spans().len(), 3);
    assert_eq!(metrics.inner().batch_count(), 2);
    assert_eq!(metrics.ok_count(), 2);
    assert_eq!(metrics.error_count(), 1);
}
