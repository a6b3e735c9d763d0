// Span processors and exporters
//
// A processor receives every span as it closes and decides when to hand
// batches to an exporter. Exporters are decorators in the same style as
// handler middleware: `MetricsExporter` wraps any other exporter.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, trace};

use crate::runtime::sync::lock;
use crate::tracer::{FinishedSpan, SpanStatus};

/// Destination for closed spans.
pub trait SpanExporter: Send + Sync {
    fn export(&self, batch: Vec<FinishedSpan>);

    /// Called once when the owning runtime is shut down.
    fn shutdown(&self) {}
}

impl<X: SpanExporter + ?Sized> SpanExporter for Arc<X> {
    fn export(&self, batch: Vec<FinishedSpan>) {
        (**self).export(batch);
    }

    fn shutdown(&self) {
        (**self).shutdown();
    }
}

/// Receives spans as they close.
pub trait SpanProcessor: Send + Sync {
    fn on_end(&self, span: FinishedSpan);

    /// Export anything still buffered. Called at the end of every run.
    fn flush(&self);

    fn shutdown(&self) {
        self.flush();
    }
}

/// Drops every span.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProcessor;

impl SpanProcessor for NoopProcessor {
    fn on_end(&self, _span: FinishedSpan) {}

    fn flush(&self) {}
}

/// Exports each span as soon as it closes.
#[derive(Debug, Clone)]
pub struct SimpleProcessor<X> {
    exporter: X,
}

impl<X: SpanExporter> SimpleProcessor<X> {
    pub fn new(exporter: X) -> Self {
        Self { exporter }
    }
}

impl<X: SpanExporter> SpanProcessor for SimpleProcessor<X> {
    fn on_end(&self, span: FinishedSpan) {
        self.exporter.export(vec![span]);
    }

    fn flush(&self) {}

    fn shutdown(&self) {
        self.exporter.shutdown();
    }
}

/// Buffers spans and exports them in batches of `batch_size`, plus whatever
/// is left when the run flushes.
#[derive(Debug)]
pub struct BatchProcessor<X> {
    exporter: X,
    batch_size: usize,
    buffer: Mutex<Vec<FinishedSpan>>,
}

impl<X: SpanExporter> BatchProcessor<X> {
    /// A `batch_size` of zero is treated as one.
    pub fn new(exporter: X, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            exporter,
            batch_size,
            buffer: Mutex::new(Vec::with_capacity(batch_size)),
        }
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn drain(&self) -> Vec<FinishedSpan> {
        std::mem::take(&mut *lock(&self.buffer))
    }
}

impl<X: SpanExporter> SpanProcessor for BatchProcessor<X> {
    fn on_end(&self, span: FinishedSpan) {
        let full = {
            let mut buffer = lock(&self.buffer);
            buffer.push(span);
            buffer.len() >= self.batch_size
        };
        if full {
            let batch = self.drain();
            trace!(spans = batch.len(), "exporting full batch");
            self.exporter.export(batch);
        }
    }

    fn flush(&self) {
        let batch = self.drain();
        if !batch.is_empty() {
            trace!(spans = batch.len(), "flushing batch");
            self.exporter.export(batch);
        }
    }

    fn shutdown(&self) {
        self.flush();
        self.exporter.shutdown();
    }
}

/// Keeps exported spans in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<FinishedSpan>>>,
    batches: Arc<AtomicUsize>,
}

impl InMemoryExporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every span exported so far, in export order.
    #[must_use]
    pub fn spans(&self) -> Vec<FinishedSpan> {
        lock(&self.spans).clone()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        lock(&self.spans).iter().map(|s| s.name.clone()).collect()
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<FinishedSpan> {
        lock(&self.spans).iter().find(|s| s.name == name).cloned()
    }

    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        lock(&self.spans).clear();
        self.batches.store(0, Ordering::SeqCst);
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&self, batch: Vec<FinishedSpan>) {
        self.batches.fetch_add(1, Ordering::SeqCst);
        lock(&self.spans).extend(batch);
    }
}

/// Emits one `tracing` event per span on the `weft::span` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExporter;

impl SpanExporter for LogExporter {
    fn export(&self, batch: Vec<FinishedSpan>) {
        for span in batch {
            let attributes = serde_json::to_string(&span.attributes).unwrap_or_default();
            info!(
                target: "weft::span",
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                parent_id = ?span.parent_id.map(|p| p.index()),
                service = %span.service_name,
                name = %span.name,
                duration_us = span.duration.as_micros() as u64,
                status = %span.status,
                attributes = %attributes,
                "span closed"
            );
        }
    }
}

/// Counts closed spans by status before delegating to `inner`.
#[derive(Debug, Clone)]
pub struct MetricsExporter<X> {
    inner: X,
    ok: Arc<AtomicU64>,
    error: Arc<AtomicU64>,
    unset: Arc<AtomicU64>,
}

impl<X> MetricsExporter<X> {
    pub fn new(inner: X) -> Self {
        Self {
            inner,
            ok: Arc::new(AtomicU64::new(0)),
            error: Arc::new(AtomicU64::new(0)),
            unset: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ok_count(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error.load(Ordering::Relaxed)
    }

    pub fn unset_count(&self) -> u64 {
        self.unset.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &X {
        &self.inner
    }
}

impl<X: SpanExporter> SpanExporter for MetricsExporter<X> {
    fn export(&self, batch: Vec<FinishedSpan>) {
        for span in &batch {
            let counter = match span.status {
                SpanStatus::Ok => &self.ok,
                SpanStatus::Error { .. } => &self.error,
                SpanStatus::Unset => &self.unset,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.export(batch);
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}
