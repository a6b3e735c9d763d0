//! Run-scoped span tree.
//!
//! Spans are stored in an arena owned by the run. Parents own their
//! children through id lists; a child refers back to its parent by id only.
//! The current-span pointer is not stored here: it lives in each fiber's
//! execution state, so concurrent fibers keep independent ambient spans.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;
use weft_types::{AttributeValue, Attributes, Outcome};

use crate::exporter::SpanProcessor;
use crate::runtime::sync::lock;

/// Attribute set on spans whose body was interrupted.
pub const INTERRUPTED_ATTRIBUTE: &str = "weft.interrupted";

/// Index of a span within its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(usize);

impl SpanId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "span-{}", self.0)
    }
}

/// 128-bit trace identifier, displayed as 32 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TraceId(u128);

impl TraceId {
    #[must_use]
    pub fn new(raw: u128) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<TraceId> for String {
    fn from(id: TraceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for TraceId {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        u128::from_str_radix(&value, 16).map(TraceId)
    }
}

/// Where a run's spans hang: a trace id and, for requests that arrive with
/// a propagated context, the caller's span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRoot {
    pub trace_id: TraceId,
    pub remote_parent: Option<u64>,
}

impl TraceRoot {
    #[must_use]
    pub fn new(trace_id: TraceId) -> Self {
        Self {
            trace_id,
            remote_parent: None,
        }
    }

    #[must_use]
    pub fn with_remote_parent(mut self, span_id: u64) -> Self {
        self.remote_parent = Some(span_id);
        self
    }

    /// Parse a W3C `traceparent` header (`00-<trace>-<span>-<flags>`).
    ///
    /// Returns `None` for unknown versions, malformed fields and all-zero ids.
    #[must_use]
    pub fn from_traceparent(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let version = parts.next()?;
        let trace = parts.next()?;
        let span = parts.next()?;
        let flags = parts.next()?;
        if version != "00" || parts.next().is_some() {
            return None;
        }
        if trace.len() != 32 || span.len() != 16 || flags.len() != 2 {
            return None;
        }
        let trace_id = u128::from_str_radix(trace, 16).ok()?;
        let span_id = u64::from_str_radix(span, 16).ok()?;
        u8::from_str_radix(flags, 16).ok()?;
        if trace_id == 0 || span_id == 0 {
            return None;
        }
        Some(Self::new(TraceId(trace_id)).with_remote_parent(span_id))
    }
}

/// Final status of a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error { message: String },
}

impl SpanStatus {
    /// Status for a body that ended in `outcome`.
    ///
    /// Failures are described with `describe`; defects with their display.
    pub(crate) fn for_outcome<A, E>(outcome: &Outcome<A, E>, describe: impl Fn(&E) -> String) -> Self {
        match outcome {
            Outcome::Success(_) => SpanStatus::Ok,
            Outcome::Failure(error) => SpanStatus::Error {
                message: describe(error),
            },
            Outcome::Defect(defect) => SpanStatus::Error {
                message: defect.to_string(),
            },
            Outcome::Interrupted => SpanStatus::Ok,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error { .. })
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            SpanStatus::Unset => "unset",
            SpanStatus::Ok => "ok",
            SpanStatus::Error { .. } => "error",
        }
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanStatus::Error { message } => write!(f, "error: {message}"),
            other => f.write_str(other.label()),
        }
    }
}

/// One span of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    pub id: SpanId,
    pub parent: Option<SpanId>,
    pub children: Vec<SpanId>,
    pub name: String,
    /// Monotonic offset from the runtime clock.
    pub start: Duration,
    pub end: Option<Duration>,
    pub attributes: Attributes,
    pub status: SpanStatus,
}

impl SpanRecord {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// A closed span as handed to exporters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedSpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_id: Option<SpanId>,
    pub remote_parent: Option<u64>,
    pub service_name: String,
    pub name: String,
    pub start: Duration,
    pub duration: Duration,
    pub attributes: Attributes,
    pub status: SpanStatus,
}

/// Immutable copy of a run's span tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSnapshot {
    pub trace_id: TraceId,
    pub spans: Vec<SpanRecord>,
}

impl TraceSnapshot {
    #[must_use]
    pub fn get(&self, id: SpanId) -> Option<&SpanRecord> {
        self.spans.get(id.0)
    }

    /// First span with this name, in opening order.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&SpanRecord> {
        self.spans.iter().find(|span| span.name == name)
    }

    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SpanRecord> + 'a {
        self.spans.iter().filter(move |span| span.name == name)
    }

    #[must_use]
    pub fn children_of(&self, id: SpanId) -> Vec<&SpanRecord> {
        self.get(id)
            .map(|span| span.children.iter().filter_map(|c| self.get(*c)).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn roots(&self) -> Vec<&SpanRecord> {
        self.spans.iter().filter(|span| span.parent.is_none()).collect()
    }

    #[must_use]
    pub fn parent_of(&self, id: SpanId) -> Option<&SpanRecord> {
        self.get(id).and_then(|span| span.parent).and_then(|p| self.get(p))
    }

    /// Whether every opened span was closed.
    #[must_use]
    pub fn all_closed(&self) -> bool {
        self.spans.iter().all(SpanRecord::is_closed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// The arena behind a run.
pub(crate) struct SpanTree {
    root: TraceRoot,
    service_name: Arc<str>,
    records: Mutex<Vec<SpanRecord>>,
    processor: Arc<dyn SpanProcessor>,
}

impl SpanTree {
    pub(crate) fn new(
        root: TraceRoot,
        service_name: Arc<str>,
        processor: Arc<dyn SpanProcessor>,
    ) -> Self {
        Self {
            root,
            service_name,
            records: Mutex::new(Vec::new()),
            processor,
        }
    }

    pub(crate) fn trace_id(&self) -> TraceId {
        self.root.trace_id
    }

    pub(crate) fn open(
        &self,
        name: &str,
        parent: Option<SpanId>,
        attributes: Attributes,
        now: Duration,
    ) -> SpanId {
        let mut records = lock(&self.records);
        let id = SpanId(records.len());
        if let Some(parent) = parent.and_then(|p| records.get_mut(p.0)) {
            parent.children.push(id);
        }
        records.push(SpanRecord {
            id,
            parent,
            children: Vec::new(),
            name: name.to_string(),
            start: now,
            end: None,
            attributes,
            status: SpanStatus::Unset,
        });
        trace!(span = %id, name, ?parent, "span opened");
        id
    }

    /// Merge `attributes` into an open span. Closed spans are left untouched.
    pub(crate) fn annotate(&self, id: SpanId, attributes: &Attributes) {
        let mut records = lock(&self.records);
        if let Some(record) = records.get_mut(id.0).filter(|r| !r.is_closed()) {
            record
                .attributes
                .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    /// Close `id` once; later calls are ignored.
    pub(crate) fn close(&self, id: SpanId, status: SpanStatus, now: Duration) {
        let finished = {
            let mut records = lock(&self.records);
            let Some(record) = records.get_mut(id.0).filter(|r| !r.is_closed()) else {
                return;
            };
            record.end = Some(now);
            record.status = status;
            FinishedSpan {
                trace_id: self.root.trace_id,
                span_id: record.id,
                parent_id: record.parent,
                remote_parent: if record.parent.is_none() {
                    self.root.remote_parent
                } else {
                    None
                },
                service_name: self.service_name.to_string(),
                name: record.name.clone(),
                start: record.start,
                duration: now.saturating_sub(record.start),
                attributes: record.attributes.clone(),
                status: record.status.clone(),
            }
        };
        trace!(span = %id, status = %finished.status, "span closed");
        self.processor.on_end(finished);
    }

    pub(crate) fn snapshot(&self) -> TraceSnapshot {
        TraceSnapshot {
            trace_id: self.root.trace_id,
            spans: lock(&self.records).clone(),
        }
    }
}

pub(crate) fn interrupted_attributes() -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(INTERRUPTED_ATTRIBUTE.to_string(), AttributeValue::Bool(true));
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{InMemoryExporter, SimpleProcessor};
    use weft_types::attributes;

    fn tree() -> (SpanTree, InMemoryExporter) {
        let exporter = InMemoryExporter::new();
        let tree = SpanTree::new(
            TraceRoot::new(TraceId::new(7)),
            Arc::from("test"),
            Arc::new(SimpleProcessor::new(exporter.clone())),
        );
        (tree, exporter)
    }

    #[test]
    fn test_open_links_parent_and_child() {
        let (tree, _) = tree();
        let root = tree.open("root", None, Attributes::new(), Duration::ZERO);
        let child = tree.open("child", Some(root), Attributes::new(), Duration::ZERO);
        let snapshot = tree.snapshot();
        assert_eq!(snapshot.children_of(root)[0].id, child);
        assert_eq!(snapshot.parent_of(child).unwrap().name, "root");
        assert_eq!(snapshot.roots().len(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (tree, exporter) = tree();
        let id = tree.open("once", None, Attributes::new(), Duration::ZERO);
        tree.close(id, SpanStatus::Ok, Duration::from_millis(5));
        tree.close(
            id,
            SpanStatus::Error {
                message: "late".into(),
            },
            Duration::from_millis(9),
        );
        let spans = exporter.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].duration, Duration::from_millis(5));
    }

    #[test]
    fn test_annotate_after_close_is_ignored() {
        let (tree, _) = tree();
        let id = tree.open("s", None, Attributes::new(), Duration::ZERO);
        tree.annotate(id, &attributes([("a", 1.into())]));
        tree.close(id, SpanStatus::Ok, Duration::ZERO);
        tree.annotate(id, &attributes([("b", 2.into())]));
        let record = tree.snapshot().get(id).cloned().unwrap();
        assert!(record.attribute("a").is_some());
        assert!(record.attribute("b").is_none());
    }

    #[test]
    fn test_traceparent_parsing() {
        let root =
            TraceRoot::from_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
                .unwrap();
        assert_eq!(root.trace_id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(root.remote_parent, Some(0x00f0_67aa_0ba9_02b7));

        assert!(TraceRoot::from_traceparent("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").is_none());
        assert!(TraceRoot::from_traceparent("00-00000000000000000000000000000000-00f067aa0ba902b7-01").is_none());
        assert!(TraceRoot::from_traceparent("garbage").is_none());
    }

    #[test]
    fn test_trace_id_serializes_as_hex() {
        let json = serde_json::to_string(&TraceId::new(255)).unwrap();
        assert_eq!(json, format!("\"{:032x}\"", 255));
    }
}
