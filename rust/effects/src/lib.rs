//! Typed effect descriptions with capability layers and span propagation.
//!
//! An [`Effect<A, E>`] is an inert description of a computation: it succeeds
//! with an `A`, fails with a declared `E`, or dies with a
//! [`Defect`](weft_types::Defect). Descriptions are composed with
//! combinators, given capabilities through [`Layer`]s, wrapped in spans with
//! [`Effect::with_span`], and executed by a [`Runtime`].
//!
//! ```
//! use std::sync::Arc;
//! use weft_effects::{attributes, Capability, Effect, Layer, Outcome, Runtime};
//!
//! struct Greeting;
//! impl Capability for Greeting {
//!     const NAME: &'static str = "Greeting";
//!     type Service = String;
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let hello: Effect<String, String> = Effect::with_service::<Greeting, _>(|greeting| {
//!     Effect::succeed(format!("{greeting}, world"))
//! })
//! .with_span("greet", attributes([("lang", "en".into())]));
//!
//! let program = hello.provide(Layer::instance::<Greeting>(Arc::new("hello".to_string())));
//! let outcome = Runtime::builder().build().run(program).await;
//! assert_eq!(outcome, Outcome::Success("hello, world".to_string()));
//! # }
//! ```

pub mod catch;
pub mod config;
pub mod effect;
pub mod errors;
pub mod exporter;
mod node;
pub mod registry;
pub mod runtime;
pub mod schedule;
pub mod testing;
pub mod tracer;
pub mod trigger;

pub use catch::{Handled, KindHandlers, Kinded};
pub use config::{ConfigError, ExportMode, RuntimeConfig};
pub use effect::Effect;
pub use errors::{Classify, CompositionError, ErrorClass};
pub use exporter::{
    BatchProcessor, InMemoryExporter, LogExporter, MetricsExporter, NoopProcessor,
    SimpleProcessor, SpanExporter, SpanProcessor,
};
pub use node::NodeTag;
pub use registry::{Capability, CapabilityKey, Layer, Registry};
pub use runtime::{
    FiberHandle, FiberId, Interruptor, RunId, RunOptions, RunReport, Runtime, RuntimeBuilder,
    MockClock, RuntimeClock, SystemClock,
};
pub use schedule::Schedule;
pub use tracer::{
    FinishedSpan, SpanId, SpanRecord, SpanStatus, TraceId, TraceRoot, TraceSnapshot,
    INTERRUPTED_ATTRIBUTE,
};
pub use trigger::Reply;

pub use weft_types::{
    attributes, AttributeValue, Attributes, Cause, Defect, DefectKind, EntropyRng, Exit, Outcome,
    Rng, SeededRng,
};
