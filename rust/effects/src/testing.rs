//! Test helpers: a deterministic runtime and an ordered event recorder.

use std::sync::{Arc, Mutex};

use crate::effect::Effect;
use crate::exporter::InMemoryExporter;
use crate::registry::Registry;
use crate::runtime::sync::lock;
use crate::runtime::{MockClock, Runtime, RuntimeBuilder};

/// Runtime on a [`MockClock`] that exports every span to memory as soon as
/// it closes.
pub struct TestRuntime {
    pub runtime: Runtime,
    pub clock: Arc<MockClock>,
    pub spans: InMemoryExporter,
}

impl TestRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    #[must_use]
    pub fn with_registry(registry: Registry) -> Self {
        Self::from_builder(Runtime::builder().registry(registry))
    }

    /// Finish `builder` with a mock clock, an in-memory exporter and a
    /// fixed seed.
    #[must_use]
    pub fn from_builder(builder: RuntimeBuilder) -> Self {
        let clock = Arc::new(MockClock::new());
        let spans = InMemoryExporter::new();
        let runtime = builder
            .clock(clock.clone())
            .exporter(spans.clone())
            .service_name("weft-test")
            .seed(0x5eed)
            .build();
        Self {
            runtime,
            clock,
            spans,
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered record of events, shared by clones.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        lock(&self.events).push(event.into());
    }

    /// An effect that records `event` each time it runs.
    pub fn effect<E: Send + 'static>(&self, event: impl Into<String>) -> Effect<(), E> {
        let log = self.clone();
        let event = event.into();
        Effect::sync(move || log.record(event.clone()))
    }

    #[must_use]
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        lock(&self.events).iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}
