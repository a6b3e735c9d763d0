// Erased node graph behind `Effect<A, E>`
//
// Descriptions are stored as a tree of immutable, reference-counted nodes
// whose values and errors are boxed `Any`. The typed facade in `effect.rs`
// is the only place that boxes or unboxes them, so a downcast failure here
// always means an internal invariant was broken.

use std::any::{type_name, Any};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use weft_types::{Attributes, Defect, Outcome};

use crate::registry::{CapabilityKey, Instance, LayerEntry};
use crate::runtime::fiber::RawFiber;
use crate::schedule::Schedule;

/// Type-erased success value or failure.
pub(crate) type Value = Box<dyn Any + Send>;

/// Outcome whose value and failure are both erased.
pub(crate) type ErasedOutcome = Outcome<Value, Value>;

pub(crate) type NodeRef = Arc<Node>;

pub(crate) type Thunk = Arc<dyn Fn() -> Value + Send + Sync>;
pub(crate) type SyncFn = Arc<dyn Fn() -> ErasedOutcome + Send + Sync>;
pub(crate) type AsyncFn = Arc<dyn Fn() -> BoxFuture<'static, ErasedOutcome> + Send + Sync>;
pub(crate) type SuspendFn = Arc<dyn Fn() -> NodeRef + Send + Sync>;
pub(crate) type MapFn = Arc<dyn Fn(Value) -> Result<Value, Defect> + Send + Sync>;
pub(crate) type ContFn = Arc<dyn Fn(Value) -> Result<NodeRef, Defect> + Send + Sync>;
pub(crate) type CatchFn = Arc<dyn Fn(Value) -> Result<Recovery, Defect> + Send + Sync>;
pub(crate) type DowngradeFn = Arc<dyn Fn(Value) -> Defect + Send + Sync>;
pub(crate) type ExtractFn = Arc<dyn Fn(&Instance) -> Option<Value> + Send + Sync>;
pub(crate) type RetryIfFn = Arc<dyn Fn(&Value) -> Result<bool, Defect> + Send + Sync>;
pub(crate) type DescribeFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;
pub(crate) type FiberWrapFn = Arc<dyn Fn(RawFiber) -> Value + Send + Sync>;

/// What a failure handler decided to do with a failure.
pub(crate) enum Recovery {
    /// Continue with this description in place of the failure.
    Resume(NodeRef),
    /// Re-raise, possibly as a different (narrowed) error value.
    Reraise(Value),
}

/// One node of an effect description.
pub(crate) enum Node {
    Succeed(Thunk),
    Fail(Thunk),
    Die(Defect),
    Sync(SyncFn),
    Async(AsyncFn),
    Suspend(SuspendFn),
    Map {
        inner: NodeRef,
        f: MapFn,
    },
    FlatMap {
        inner: NodeRef,
        k: ContFn,
    },
    Catch {
        body: NodeRef,
        handler: CatchFn,
    },
    OrDie {
        body: NodeRef,
        downgrade: DowngradeFn,
    },
    Sleep(Duration),
    Span {
        name: String,
        attributes: Attributes,
        describe: DescribeFn,
        body: NodeRef,
    },
    Annotate(Attributes),
    Service {
        key: CapabilityKey,
        extract: ExtractFn,
    },
    Provide {
        entries: Arc<Vec<LayerEntry>>,
        body: NodeRef,
    },
    Fork {
        body: NodeRef,
        wrap: FiberWrapFn,
    },
    Race {
        left: NodeRef,
        right: NodeRef,
    },
    Repeat {
        body: NodeRef,
        schedule: Schedule,
        retry_if: Option<RetryIfFn>,
    },
    Ensuring {
        body: NodeRef,
        finalizer: NodeRef,
    },
    Interrupt,
}

/// Primitive kind of a description's root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeTag {
    Succeed,
    Fail,
    Die,
    Sync,
    Async,
    Suspend,
    Map,
    FlatMap,
    Catch,
    OrDie,
    Sleep,
    Span,
    Annotate,
    Service,
    Provide,
    Fork,
    Race,
    Repeat,
    Ensuring,
    Interrupt,
}

impl NodeTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NodeTag::Succeed => "succeed",
            NodeTag::Fail => "fail",
            NodeTag::Die => "die",
            NodeTag::Sync => "sync",
            NodeTag::Async => "async",
            NodeTag::Suspend => "suspend",
            NodeTag::Map => "map",
            NodeTag::FlatMap => "flat_map",
            NodeTag::Catch => "catch",
            NodeTag::OrDie => "or_die",
            NodeTag::Sleep => "sleep",
            NodeTag::Span => "span",
            NodeTag::Annotate => "annotate",
            NodeTag::Service => "service",
            NodeTag::Provide => "provide",
            NodeTag::Fork => "fork",
            NodeTag::Race => "race",
            NodeTag::Repeat => "repeat",
            NodeTag::Ensuring => "ensuring",
            NodeTag::Interrupt => "interrupt",
        }
    }
}

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Node {
    pub(crate) fn tag(&self) -> NodeTag {
        match self {
            Node::Succeed(_) => NodeTag::Succeed,
            Node::Fail(_) => NodeTag::Fail,
            Node::Die(_) => NodeTag::Die,
            Node::Sync(_) => NodeTag::Sync,
            Node::Async(_) => NodeTag::Async,
            Node::Suspend(_) => NodeTag::Suspend,
            Node::Map { .. } => NodeTag::Map,
            Node::FlatMap { .. } => NodeTag::FlatMap,
            Node::Catch { .. } => NodeTag::Catch,
            Node::OrDie { .. } => NodeTag::OrDie,
            Node::Sleep(_) => NodeTag::Sleep,
            Node::Span { .. } => NodeTag::Span,
            Node::Annotate(_) => NodeTag::Annotate,
            Node::Service { .. } => NodeTag::Service,
            Node::Provide { .. } => NodeTag::Provide,
            Node::Fork { .. } => NodeTag::Fork,
            Node::Race { .. } => NodeTag::Race,
            Node::Repeat { .. } => NodeTag::Repeat,
            Node::Ensuring { .. } => NodeTag::Ensuring,
            Node::Interrupt => NodeTag::Interrupt,
        }
    }

    /// Capability keys requested by statically visible `Service` nodes and
    /// not discharged by an enclosing `Provide`.
    ///
    /// Continuations are opaque until run, so keys requested only inside a
    /// `flat_map` callback or a failure handler are not reported.
    pub(crate) fn requirements(&self) -> BTreeSet<CapabilityKey> {
        let mut out = BTreeSet::new();
        self.collect_requirements(&BTreeSet::new(), &mut out);
        out
    }

    fn collect_requirements(
        &self,
        provided: &BTreeSet<CapabilityKey>,
        out: &mut BTreeSet<CapabilityKey>,
    ) {
        match self {
            Node::Service { key, .. } => {
                if !provided.contains(key) {
                    out.insert(*key);
                }
            }
            Node::Provide { entries, body } => {
                let mut scope = provided.clone();
                for entry in entries.iter() {
                    if let LayerEntry::Scoped { acquire, .. } = entry {
                        acquire.collect_requirements(&scope, out);
                    }
                    scope.insert(entry.key());
                }
                body.collect_requirements(&scope, out);
            }
            Node::Map { inner, .. } | Node::FlatMap { inner, .. } => {
                inner.collect_requirements(provided, out);
            }
            Node::Catch { body, .. }
            | Node::OrDie { body, .. }
            | Node::Span { body, .. }
            | Node::Repeat { body, .. }
            | Node::Fork { body, .. } => body.collect_requirements(provided, out),
            Node::Race { left, right } => {
                left.collect_requirements(provided, out);
                right.collect_requirements(provided, out);
            }
            Node::Ensuring { body, finalizer } => {
                body.collect_requirements(provided, out);
                finalizer.collect_requirements(provided, out);
            }
            Node::Succeed(_)
            | Node::Fail(_)
            | Node::Die(_)
            | Node::Sync(_)
            | Node::Async(_)
            | Node::Suspend(_)
            | Node::Sleep(_)
            | Node::Annotate(_)
            | Node::Interrupt => {}
        }
    }

    /// Names of statically visible spans, outermost first.
    pub(crate) fn span_names(&self, out: &mut Vec<String>) {
        match self {
            Node::Span { name, body, .. } => {
                out.push(name.clone());
                body.span_names(out);
            }
            Node::Map { inner, .. } | Node::FlatMap { inner, .. } => inner.span_names(out),
            Node::Catch { body, .. }
            | Node::OrDie { body, .. }
            | Node::Provide { body, .. }
            | Node::Repeat { body, .. }
            | Node::Fork { body, .. } => body.span_names(out),
            Node::Race { left, right } => {
                left.span_names(out);
                right.span_names(out);
            }
            Node::Ensuring { body, finalizer } => {
                body.span_names(out);
                finalizer.span_names(out);
            }
            _ => {}
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Span { name, body, .. } => f
                .debug_struct("Span")
                .field("name", name)
                .field("body", body)
                .finish(),
            Node::Map { inner, .. } => f.debug_tuple("Map").field(inner).finish(),
            Node::FlatMap { inner, .. } => f.debug_tuple("FlatMap").field(inner).finish(),
            Node::Die(defect) => f.debug_tuple("Die").field(defect).finish(),
            Node::Sleep(d) => f.debug_tuple("Sleep").field(d).finish(),
            Node::Service { key, .. } => f.debug_tuple("Service").field(key).finish(),
            other => f.write_str(other.tag().as_str()),
        }
    }
}

pub(crate) fn erase<T: Send + 'static>(value: T) -> Value {
    Box::new(value)
}

/// Unbox a value produced by the typed facade.
pub(crate) fn unerase<T: 'static>(value: Value) -> Result<T, Defect> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| Defect::invariant(format!("expected a value of type `{}`", type_name::<T>())))
}

pub(crate) fn unerase_ref<T: 'static>(value: &Value) -> Result<&T, Defect> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| Defect::invariant(format!("expected a value of type `{}`", type_name::<T>())))
}

/// Turn a typed outcome into the erased representation.
pub(crate) fn erase_outcome<A, E>(outcome: Outcome<A, E>) -> ErasedOutcome
where
    A: Send + 'static,
    E: Send + 'static,
{
    match outcome {
        Outcome::Success(value) => Outcome::Success(erase(value)),
        Outcome::Failure(error) => Outcome::Failure(erase(error)),
        Outcome::Defect(defect) => Outcome::Defect(defect),
        Outcome::Interrupted => Outcome::Interrupted,
    }
}

/// Recover the typed outcome at the end of a run or join.
pub(crate) fn unerase_outcome<A, E>(outcome: ErasedOutcome) -> Outcome<A, E>
where
    A: 'static,
    E: 'static,
{
    match outcome {
        Outcome::Success(value) => match unerase::<A>(value) {
            Ok(value) => Outcome::Success(value),
            Err(defect) => Outcome::Defect(defect),
        },
        Outcome::Failure(error) => match unerase::<E>(error) {
            Ok(error) => Outcome::Failure(error),
            Err(defect) => Outcome::Defect(defect),
        },
        Outcome::Defect(defect) => Outcome::Defect(defect),
        Outcome::Interrupted => Outcome::Interrupted,
    }
}
