//! Runtime for effect descriptions.
//!
//! A [`Runtime`] owns everything that outlives a single run: the clock, the
//! span processor, the base capability registry and the seed for trace ids.
//! Each call to [`Runtime::run_with`] builds a fresh run context:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Runtime  (clock, processor, registry, service name)      │
//! └──────────────────────────────────────────────────────────┘
//!                            │ run_with
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ RunContext  (span tree, supervisor, rng)                 │
//! │   root fiber ── fork ──▶ child fibers                    │
//! └──────────────────────────────────────────────────────────┘
//!                            │ on exit
//!                            ▼
//!   interrupt unjoined children, flush spans, RunReport
//! ```
//!
//! ```
//! use weft_effects::{Effect, Outcome, Runtime};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let runtime = Runtime::builder().build();
//! let effect: Effect<u32, String> = Effect::succeed(20).map(|n| n + 1);
//! assert_eq!(runtime.run(effect).await, Outcome::Success(21));
//! # }
//! ```

pub mod clock;
pub(crate) mod fiber;
pub(crate) mod interpreter;
pub(crate) mod interrupt;
pub(crate) mod sync;

pub use clock::{MockClock, RuntimeClock, SystemClock};
pub use fiber::{FiberHandle, FiberId};
pub use interrupt::Interruptor;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use weft_types::{EntropyRng, Outcome, Rng, SeededRng};

use crate::config::{ExportMode, RuntimeConfig};
use crate::effect::Effect;
use crate::exporter::{
    BatchProcessor, LogExporter, NoopProcessor, SimpleProcessor, SpanExporter, SpanProcessor,
};
use crate::node::unerase_outcome;
use crate::registry::{Capability, Registry};
use crate::tracer::{SpanTree, TraceId, TraceRoot, TraceSnapshot};
use interpreter::{FiberState, RunContext};

/// Sequence number of a run within its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(u64);

impl RunId {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Per-run settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    trace_root: Option<TraceRoot>,
    interruptor: Option<Interruptor>,
    deadline: Option<Duration>,
}

impl RunOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue an existing trace instead of starting a new one.
    #[must_use]
    pub fn with_trace_root(mut self, root: TraceRoot) -> Self {
        self.trace_root = Some(root);
        self
    }

    /// Cancel the run from outside by interrupting `interruptor`.
    #[must_use]
    pub fn with_interruptor(mut self, interruptor: Interruptor) -> Self {
        self.interruptor = Some(interruptor);
        self
    }

    /// Interrupt the run if it has not finished after `deadline` of host
    /// time. Overrides the runtime's default timeout.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport<A, E> {
    pub run_id: RunId,
    pub outcome: Outcome<A, E>,
    pub trace: TraceSnapshot,
}

/// Executes effect descriptions.
#[derive(Clone)]
pub struct Runtime {
    clock: Arc<dyn RuntimeClock>,
    processor: Arc<dyn SpanProcessor>,
    registry: Registry,
    service_name: Arc<str>,
    seed: Option<u64>,
    default_timeout: Option<Duration>,
    next_run: Arc<AtomicU64>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("service_name", &self.service_name)
            .field("registry", &self.registry.keys())
            .field("seed", &self.seed)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// A runtime configured from `config`, logging spans through
    /// [`LogExporter`] unless export is off.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        RuntimeBuilder::from_config(config).build()
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run `effect` to completion and return its outcome.
    pub async fn run<A, E>(&self, effect: Effect<A, E>) -> Outcome<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        self.run_with(effect, RunOptions::default()).await.outcome
    }

    /// Run `effect` and return its value or typed failure.
    ///
    /// # Panics
    ///
    /// Panics if the run ends in a defect or is interrupted. This is the
    /// one place a defect is allowed to become a host-level fault.
    pub async fn run_or_raise<A, E>(&self, effect: Effect<A, E>) -> Result<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        self.run(effect).await.into_result()
    }

    /// Run `effect` with per-run options and return the outcome together
    /// with the run's span tree.
    pub async fn run_with<A, E>(&self, effect: Effect<A, E>, options: RunOptions) -> RunReport<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let run_id = RunId(self.next_run.fetch_add(1, Ordering::Relaxed));
        let mut rng: Box<dyn Rng> = match self.seed {
            Some(seed) => Box::new(SeededRng::new(seed.wrapping_add(run_id.0))),
            None => Box::new(EntropyRng::new()),
        };
        let root = options
            .trace_root
            .unwrap_or_else(|| TraceRoot::new(TraceId::new(rng.next_u128())));
        let spans = SpanTree::new(root, self.service_name.clone(), self.processor.clone());
        let run = Arc::new(RunContext::new(self.clock.clone(), spans, rng));
        let interruptor = options.interruptor.unwrap_or_default();
        debug!(run = %run_id, trace_id = %run.spans.trace_id(), "run started");

        let watchdog = options.deadline.or(self.default_timeout).map(|limit| {
            let token = interruptor.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(run = %run_id, ?limit, "run deadline expired, interrupting");
                token.interrupt();
            })
        });

        let mut root_fiber = FiberState::root(run.clone(), self.registry.clone(), interruptor);
        let outcome = root_fiber.eval(effect.into_node()).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        run.supervisor.shutdown().await;
        self.processor.flush();
        let trace = run.spans.snapshot();
        debug!(
            run = %run_id,
            outcome = outcome.kind_label(),
            spans = trace.len(),
            "run finished"
        );
        RunReport {
            run_id,
            outcome: unerase_outcome(outcome),
            trace,
        }
    }

    /// Flush and shut down the span pipeline.
    pub fn shutdown(&self) {
        self.processor.shutdown();
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    clock: Arc<dyn RuntimeClock>,
    processor: Option<Arc<dyn SpanProcessor>>,
    exporter: Option<Arc<dyn SpanExporter>>,
    export: ExportMode,
    batch_size: usize,
    registry: Registry,
    service_name: String,
    seed: Option<u64>,
    default_timeout: Option<Duration>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// System clock, no span export, empty registry.
    #[must_use]
    pub fn new() -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            clock: Arc::new(SystemClock::new()),
            processor: None,
            exporter: None,
            export: ExportMode::Off,
            batch_size: defaults.batch_size,
            registry: Registry::new(),
            service_name: defaults.service_name,
            seed: None,
            default_timeout: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            export: config.export,
            batch_size: config.batch_size,
            service_name: config.service_name.clone(),
            default_timeout: config.default_timeout,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn RuntimeClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send spans to `exporter`, one at a time unless batching was
    /// configured.
    #[must_use]
    pub fn exporter<X: SpanExporter + 'static>(mut self, exporter: X) -> Self {
        self.exporter = Some(Arc::new(exporter));
        if matches!(self.export, ExportMode::Off | ExportMode::Log) {
            self.export = ExportMode::Simple;
        }
        self
    }

    /// Use `processor` as is, ignoring the export mode.
    #[must_use]
    pub fn processor<P: SpanProcessor + 'static>(mut self, processor: P) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    #[must_use]
    pub fn export_mode(mut self, export: ExportMode) -> Self {
        self.export = export;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Capabilities available to every run.
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_service<C: Capability>(mut self, service: Arc<C::Service>) -> Self {
        self.registry = self.registry.with::<C>(service);
        self
    }

    #[must_use]
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Make trace ids and schedule jitter reproducible.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn build(self) -> Runtime {
        let processor = match self.processor {
            Some(processor) => processor,
            None => export_processor(self.export, self.exporter, self.batch_size),
        };
        debug!(
            service = %self.service_name,
            export = %self.export,
            capabilities = self.registry.len(),
            "runtime built"
        );
        Runtime {
            clock: self.clock,
            processor,
            registry: self.registry,
            service_name: Arc::from(self.service_name),
            seed: self.seed,
            default_timeout: self.default_timeout,
            next_run: Arc::new(AtomicU64::new(1)),
        }
    }
}

fn export_processor(
    export: ExportMode,
    exporter: Option<Arc<dyn SpanExporter>>,
    batch_size: usize,
) -> Arc<dyn SpanProcessor> {
    let exporter = exporter.unwrap_or_else(|| Arc::new(LogExporter));
    match export {
        ExportMode::Simple => Arc::new(SimpleProcessor::new(exporter)),
        ExportMode::Batch => Arc::new(BatchProcessor::new(exporter, batch_size)),
        ExportMode::Log => Arc::new(SimpleProcessor::new(LogExporter)),
        ExportMode::Off => Arc::new(NoopProcessor),
    }
}
