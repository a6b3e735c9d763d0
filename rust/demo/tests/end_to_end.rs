#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

// End-to-end user requests through the runtime and the reply mapping

use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::json;
use weft_demo::{
    fetch_user, handle, service_layer, AuditLog, EnrichedUser, FaultyDirectory, InMemoryDirectory,
    UserError,
};
use weft_effects::testing::TestRuntime;
use weft_effects::{AttributeValue, DefectKind, Outcome, Reply, RunOptions, SpanStatus, TraceRoot};

struct Fixture {
    harness: TestRuntime,
    directory: Arc<InMemoryDirectory>,
    audit: Arc<AuditLog>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            harness: TestRuntime::new(),
            directory: Arc::new(InMemoryDirectory::seeded()),
            audit: Arc::new(AuditLog::new()),
        }
    }

    async fn request(&self, user_id: &str) -> Reply {
        let layer = service_layer(self.directory.clone(), self.audit.clone());
        handle(&self.harness.runtime, user_id, layer, None).await
    }

    async fn outcome(&self, user_id: &str) -> Outcome<EnrichedUser, UserError> {
        let layer = service_layer(self.directory.clone(), self.audit.clone());
        self.harness.runtime.run(fetch_user(user_id).provide(layer)).await
    }
}

// ============================================================================
// Replies
// ============================================================================

#[tokio::test]
async fn test_known_user_is_200_with_enriched_body() {
    let fixture = Fixture::new();
    let reply = fixture.request("123").await;

    assert_eq!(reply.status(), Some(200));
    let body = reply.body().unwrap();
    assert_eq!(body["id"], json!("123"));
    assert_eq!(body["name"], json!("Ada Lovelace"));
    assert_eq!(body["email_domain"], json!("example.com"));
    assert_eq!(fixture.audit.entries(), vec!["fetched 123"]);
    assert!(!fixture.audit.is_open());
}

#[tokio::test]
async fn test_unknown_user_is_404() {
    let fixture = Fixture::new();
    let reply = fixture.request("404").await;
    assert_eq!(
        reply,
        Reply::Respond {
            status: 404,
            body: json!({"error": "not_found", "message": "user 404 not found"}),
        }
    );
}

#[tokio::test]
async fn test_empty_id_is_400_without_lookup() {
    let fixture = Fixture::new();
    let reply = fixture.request("").await;
    assert_eq!(reply.status(), Some(400));
    assert_eq!(reply.body().unwrap()["error"], json!("validation"));
    assert_eq!(fixture.directory.lookups(), 0);
    assert!(fixture.harness.spans.spans().is_empty());
}

#[tokio::test]
async fn test_storage_fault_is_a_generic_500() {
    let harness = TestRuntime::new();
    let layer = service_layer(
        Arc::new(FaultyDirectory::new("connection refused")),
        Arc::new(AuditLog::new()),
    );
    let reply = handle(&harness.runtime, "123", layer, None).await;
    assert_eq!(
        reply,
        Reply::Respond {
            status: 500,
            body: json!({"error": "internal", "message": "internal error"}),
        }
    );
}

// ============================================================================
// Outcomes and spans
// ============================================================================

#[tokio::test]
async fn test_outcomes_per_scenario() {
    let fixture = Fixture::new();
    assert_matches!(
        fixture.outcome("123").await,
        Outcome::Success(user) if user.name == "Ada Lovelace"
    );
    assert_eq!(
        fixture.outcome("404").await,
        Outcome::Failure(UserError::NotFound { id: "404".into() })
    );
    assert_eq!(
        fixture.outcome("").await,
        Outcome::Failure(UserError::Validation { field: "userId" })
    );

    let faulty = service_layer(
        Arc::new(FaultyDirectory::new("disk on fire")),
        fixture.audit.clone(),
    );
    let defect = fixture
        .harness
        .runtime
        .run(fetch_user("123").provide(faulty))
        .await
        .defect()
        .unwrap();
    assert_eq!(
        defect.kind(),
        &DefectKind::Downgraded {
            kind: "StoreError".into()
        }
    );
    assert!(defect.message().contains("disk on fire"));
}

#[tokio::test]
async fn test_fetch_span_is_annotated() {
    let fixture = Fixture::new();
    let layer = service_layer(fixture.directory.clone(), fixture.audit.clone());
    let report = fixture
        .harness
        .runtime
        .run_with(fetch_user("123").provide(layer), RunOptions::new())
        .await;

    let span = report.trace.find("user.fetch").unwrap();
    assert_eq!(span.status, SpanStatus::Ok);
    assert_eq!(
        span.attribute("user.id").and_then(AttributeValue::as_str),
        Some("123")
    );
    assert_eq!(
        span.attribute("user.email_domain").and_then(AttributeValue::as_str),
        Some("example.com")
    );
}

#[tokio::test]
async fn test_not_found_span_closes_with_error() {
    let fixture = Fixture::new();
    let layer = service_layer(fixture.directory.clone(), fixture.audit.clone());
    let report = fixture
        .harness
        .runtime
        .run_with(fetch_user("404").provide(layer), RunOptions::new())
        .await;
    assert_eq!(
        report.trace.find("user.fetch").unwrap().status,
        SpanStatus::Error {
            message: "user 404 not found".into()
        }
    );
}

#[tokio::test]
async fn test_storage_fault_span_closes_with_error() {
    let fixture = Fixture::new();
    let faulty = service_layer(
        Arc::new(FaultyDirectory::new("connection refused")),
        fixture.audit.clone(),
    );
    let report = fixture
        .harness
        .runtime
        .run_with(fetch_user("123").provide(faulty), RunOptions::new())
        .await;

    assert!(report.outcome.is_defect());
    let span = report.trace.find("user.fetch").unwrap();
    assert!(span.status.is_error());
    assert_matches!(
        &span.status,
        SpanStatus::Error { message } if message.contains("connection refused")
    );
    assert!(fixture.audit.entries().is_empty());
}

#[tokio::test]
async fn test_incoming_trace_context_is_continued() {
    let fixture = Fixture::new();
    let root =
        TraceRoot::from_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
            .unwrap();
    let layer = service_layer(fixture.directory.clone(), fixture.audit.clone());
    let reply = handle(&fixture.harness.runtime, "123", layer, Some(root.clone())).await;
    assert_eq!(reply.status(), Some(200));

    let exported = fixture.harness.spans.find("user.fetch").unwrap();
    assert_eq!(exported.trace_id, root.trace_id);
    assert_eq!(exported.parent_id, None);
    assert_eq!(exported.remote_parent, Some(0x00f0_67aa_0ba9_02b7));
}
