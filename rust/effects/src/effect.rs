//! Typed effect descriptions.
//!
//! An [`Effect<A, E>`] describes a computation that succeeds with an `A`,
//! fails with an expected `E`, or dies with a [`Defect`]. Building one runs
//! nothing: hand it to a [`Runtime`](crate::Runtime) to execute it, as many
//! times as you like.
//!
//! Combinators run strictly left to right. A failure handler only sees
//! failures produced by stages written before it, and once it recovers, later
//! stages treat the recovered value as ordinary success data:
//!
//! ```
//! use weft_effects::{Effect, Handled};
//!
//! let lookup: Effect<u32, String> = Effect::fail("missing".to_string());
//!
//! // map, then recover: the map never runs on the failing path
//! let a = lookup.clone().map(|n| n * 10).catch_kind(|_| Handled::<u32, String>::Recover(Effect::succeed(1)));
//!
//! // recover, then map: the map transforms the recovery value
//! let b = lookup.catch_kind(|_| Handled::<u32, String>::Recover(Effect::succeed(1))).map(|n| n * 10);
//! # let _ = (a, b);
//! ```

use std::any::type_name;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use weft_types::{Attributes, Defect, Outcome};

use crate::catch::{Handled, KindHandlers, Kinded};
use crate::node::{
    erase, unerase, unerase_ref, CatchFn, DescribeFn, Node, NodeRef, NodeTag, Recovery, Value,
};
use crate::registry::{service_of, Capability, CapabilityKey, Layer};
use crate::runtime::fiber::FiberHandle;
use crate::runtime::sync::lock;
use crate::schedule::Schedule;

/// An immutable, shareable description of a computation.
///
/// Cloning is cheap: clones share the same node tree.
pub struct Effect<A, E> {
    node: NodeRef,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _types: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.node).finish()
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
            _types: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> NodeRef {
        self.node
    }

    /// Primitive kind of the outermost node.
    #[must_use]
    pub fn tag(&self) -> NodeTag {
        self.node.tag()
    }

    /// Capabilities requested by this description and not provided inside
    /// it, as far as can be seen without running it.
    ///
    /// Keys requested only inside `flat_map` continuations or failure
    /// handlers are discovered at run time.
    #[must_use]
    pub fn requirements(&self) -> Vec<CapabilityKey> {
        self.node.requirements().into_iter().collect()
    }

    #[must_use]
    pub fn requires<C: Capability>(&self) -> bool {
        self.node.requirements().contains(&CapabilityKey::of::<C>())
    }

    /// Statically visible span names, outermost first.
    #[must_use]
    pub fn span_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.node.span_names(&mut names);
        names
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_node(Node::Succeed(Arc::new(move || erase(value.clone()))))
    }

    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::fail_with(move || error.clone())
    }

    /// Fail with an error built when the node runs.
    pub fn fail_with<F>(make: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        Self::from_node(Node::Fail(Arc::new(move || erase(make()))))
    }

    pub fn die(defect: Defect) -> Self {
        Self::from_node(Node::Die(defect))
    }

    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::die(message))
    }

    /// Lazily computed success. A panic in `f` becomes a defect.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_node(Node::Sync(Arc::new(move || Outcome::Success(erase(f())))))
    }

    /// Lazily computed result; `Err` becomes a typed failure.
    pub fn try_sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::Sync(Arc::new(move || match f() {
            Ok(value) => Outcome::Success(erase(value)),
            Err(error) => Outcome::Failure(erase(error)),
        })))
    }

    /// Build the description when it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::Suspend(Arc::new(move || f().node)))
    }

    /// Lift an async operation. `make` is called once per evaluation.
    pub fn from_future<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, E>> + Send + 'static,
    {
        Self::from_node(Node::Async(Arc::new(move || {
            let fut = make();
            async move {
                match fut.await {
                    Ok(value) => Outcome::Success(erase(value)),
                    Err(error) => Outcome::Failure(erase(error)),
                }
            }
            .boxed()
        })))
    }

    /// Interrupt the fiber evaluating this node.
    #[must_use]
    pub fn interrupt() -> Self {
        Self::from_node(Node::Interrupt)
    }

    /// Run every description in order and collect the results.
    ///
    /// Stops at the first non-success.
    pub fn all<I>(effects: I) -> Effect<Vec<A>, E>
    where
        I: IntoIterator<Item = Effect<A, E>>,
    {
        let effects: Arc<[Effect<A, E>]> = effects.into_iter().collect();
        Effect::suspend(move || {
            let collected = Arc::new(Mutex::new(Vec::with_capacity(effects.len())));
            let mut chain = Effect::<(), E>::unit();
            for effect in effects.iter() {
                let sink = collected.clone();
                chain = chain.then(effect.clone().map(move |value| lock(&sink).push(value)));
            }
            chain.map(move |()| std::mem::take(&mut *lock(&collected)))
        })
    }

    /// Resolve capability `C` and continue with it.
    pub fn with_service<C, F>(f: F) -> Self
    where
        C: Capability,
        F: Fn(Arc<C::Service>) -> Effect<A, E> + Send + Sync + 'static,
    {
        Effect::<(), E>::service::<C>().flat_map(f)
    }
}

impl<E> Effect<(), E>
where
    E: Send + 'static,
{
    #[must_use]
    pub fn unit() -> Self {
        Self::from_node(Node::Succeed(Arc::new(|| erase(()))))
    }

    /// Suspend for at least `duration` without blocking the executor.
    #[must_use]
    pub fn sleep(duration: Duration) -> Self {
        Self::from_node(Node::Sleep(duration))
    }

    /// Merge attributes into the ambient span; a no-op outside any span.
    #[must_use]
    pub fn annotate_current_span(attributes: Attributes) -> Self {
        Self::from_node(Node::Annotate(attributes))
    }

    /// Resolve capability `C` from the registry in scope.
    ///
    /// An unprovided capability ends the run with a `MissingCapability`
    /// defect, never a typed failure.
    #[must_use]
    pub fn service<C: Capability>() -> Effect<Arc<C::Service>, E> {
        Effect::from_node(Node::Service {
            key: CapabilityKey::of::<C>(),
            extract: Arc::new(|instance| service_of::<C>(instance).map(erase)),
        })
    }
}

// ============================================================================
// Sequencing
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Transform the success value. Failures and defects pass through.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        self.map_checked(move |value| Ok(f(value)))
    }

    fn map_checked<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Result<B, Defect> + Send + Sync + 'static,
    {
        Effect::from_node(Node::Map {
            inner: self.node,
            f: Arc::new(move |value: Value| f(unerase::<A>(value)?).map(erase)),
        })
    }

    /// Continue with the description `f` builds from the success value.
    /// `f` is never called on failure, defect or interruption.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::from_node(Node::FlatMap {
            inner: self.node,
            k: Arc::new(move |value: Value| Ok(f(unerase::<A>(value)?).node)),
        })
    }

    pub fn zip<B>(self, other: Effect<B, E>) -> Effect<(A, B), E>
    where
        B: Send + 'static,
    {
        self.flat_map(move |left| {
            let slot = Mutex::new(Some(left));
            other.clone().map_checked(move |right| {
                lock(&slot)
                    .take()
                    .map(|left| (left, right))
                    .ok_or_else(|| Defect::invariant("zip continuation evaluated twice"))
            })
        })
    }

    /// Discard the success value and continue with `next`.
    pub fn then<B>(self, next: Effect<B, E>) -> Effect<B, E>
    where
        B: Send + 'static,
    {
        self.flat_map(move |_| next.clone())
    }

    pub fn tap<F>(self, f: F) -> Self
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.map(move |value| {
            f(&value);
            value
        })
    }

    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }
}

// ============================================================================
// Failure handling
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn catch_with<E2, F>(self, handler: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> Recovery + Send + Sync + 'static,
    {
        let handler: CatchFn = Arc::new(move |value| Ok(handler(unerase::<E>(value)?)));
        Effect::from_node(Node::Catch {
            body: self.node,
            handler,
        })
    }

    /// Handle failures by kind with an exhaustive `match`.
    ///
    /// `Handled::Recover` runs the returned description in place of the
    /// failure; `Handled::Reraise` fails again with an `E2`, which is usually
    /// a narrower enum without the handled kinds.
    pub fn catch_kind<E2, F>(self, handler: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> Handled<A, E2> + Send + Sync + 'static,
    {
        self.catch_with(move |error| match handler(error) {
            Handled::Recover(effect) => Recovery::Resume(effect.node),
            Handled::Reraise(error) => Recovery::Reraise(erase(error)),
        })
    }

    /// Dispatch failures through a [`KindHandlers`] table. Kinds without a
    /// handler re-raise unchanged.
    pub fn catch_tags(self, handlers: KindHandlers<A, E>) -> Self
    where
        E: Kinded,
    {
        self.catch_with(move |error| match handlers.get(error.kind()) {
            Some(handler) => Recovery::Resume(handler(error).node),
            None => Recovery::Reraise(erase(error)),
        })
    }

    /// Handle only the failures matching `predicate`.
    pub fn catch_if<P, F>(self, predicate: P, handler: F) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(E) -> Effect<A, E> + Send + Sync + 'static,
    {
        self.catch_with(move |error| {
            if predicate(&error) {
                Recovery::Resume(handler(error).node)
            } else {
                Recovery::Reraise(erase(error))
            }
        })
    }

    pub fn catch_all<E2, F>(self, handler: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    {
        self.catch_with(move |error| Recovery::Resume(handler(error).node))
    }

    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        self.catch_with(move |error| Recovery::Reraise(erase(f(error))))
    }

    /// Turn any remaining failure into a defect that keeps the failure as its
    /// source. There is no way back: defects are never caught or retried.
    pub fn or_die<E2>(self) -> Effect<A, E2>
    where
        E: StdError + Sync,
        E2: Send + 'static,
    {
        let kind = short_type_name::<E>();
        Effect::from_node(Node::OrDie {
            body: self.node,
            downgrade: Arc::new(move |value| match unerase::<E>(value) {
                Ok(error) => Defect::downgrade(kind, error),
                Err(defect) => defect,
            }),
        })
    }
}

// ============================================================================
// Tracing, scoping and concurrency
// ============================================================================

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Run inside a new child span of the ambient span.
    ///
    /// The span is current for the whole execution, across suspensions,
    /// and closes exactly once: `Error` on failure or defect, `Ok`
    /// otherwise. An interrupted body also gets `weft.interrupted = true`.
    pub fn with_span(self, name: impl Into<String>, attributes: Attributes) -> Self
    where
        E: fmt::Display,
    {
        let describe: DescribeFn = Arc::new(|value| {
            unerase_ref::<E>(value).map_or_else(|defect| defect.to_string(), ToString::to_string)
        });
        Self::from_node(Node::Span {
            name: name.into(),
            attributes,
            describe,
            body: self.node,
        })
    }

    /// Discharge capabilities for this description only.
    pub fn provide(self, layer: Layer<E>) -> Self {
        Self::from_node(Node::Provide {
            entries: Arc::new(layer.into_entries()),
            body: self.node,
        })
    }

    /// Run `finalizer` after this description, whatever way it ends. The
    /// finalizer cannot be interrupted.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Self {
        Self::from_node(Node::Ensuring {
            body: self.node,
            finalizer: finalizer.node,
        })
    }

    /// Start this description on a child fiber and return its handle
    /// immediately.
    ///
    /// The child inherits the registry and the ambient span. Children that
    /// are never joined are interrupted when the run ends.
    pub fn fork(self) -> Effect<FiberHandle<A, E>, E> {
        Effect::from_node(Node::Fork {
            body: self.node,
            wrap: Arc::new(|raw| erase(FiberHandle::<A, E>::new(raw))),
        })
    }

    /// Run both descriptions concurrently and keep the first outcome. The
    /// loser is interrupted and awaited.
    pub fn race(self, other: Self) -> Self {
        Self::from_node(Node::Race {
            left: self.node,
            right: other.node,
        })
    }

    /// Fail with `on_timeout()` if no outcome arrives within `after`.
    pub fn timeout<F>(self, after: Duration, on_timeout: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        let expired = Effect::<(), E>::sleep(after).then(Effect::fail_with(on_timeout));
        self.race(expired)
    }

    /// Re-run on failure as `schedule` allows. Defects and interruption are
    /// never retried.
    pub fn repeat(self, schedule: Schedule) -> Self {
        Self::from_node(Node::Repeat {
            body: self.node,
            schedule,
            retry_if: None,
        })
    }

    /// Like [`Effect::repeat`], but only failures matching `predicate` are
    /// retried; others are returned at once.
    pub fn repeat_if<P>(self, schedule: Schedule, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::from_node(Node::Repeat {
            body: self.node,
            schedule,
            retry_if: Some(Arc::new(move |value| unerase_ref::<E>(value).map(&predicate))),
        })
    }
}

/// Last path segment of a type name, without generic arguments.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Store;
    impl Capability for Store {
        const NAME: &'static str = "Store";
        type Service = String;
    }

    struct Audit;
    impl Capability for Audit {
        const NAME: &'static str = "Audit";
        type Service = String;
    }

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_building_runs_nothing() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let effect: Effect<(), ()> = Effect::sync(move || *lock(&flag) = true);
        let _ = effect.map(|()| 1).flat_map(|n: i32| Effect::succeed(n + 1));
        assert!(!*lock(&called));
    }

    #[test]
    fn test_tags() {
        let base: Effect<u8, ()> = Effect::succeed(1);
        assert_eq!(base.tag(), NodeTag::Succeed);
        assert_eq!(base.clone().map(|n| n + 1).tag(), NodeTag::Map);
        assert_eq!(base.clone().flat_map(Effect::succeed).tag(), NodeTag::FlatMap);
        assert_eq!(Effect::<(), ()>::sleep(Duration::ZERO).tag(), NodeTag::Sleep);
        assert_eq!(base.repeat(Schedule::immediate()).tag(), NodeTag::Repeat);
    }

    #[test]
    fn test_requirements_are_discharged_by_provide() {
        let needs_both: Effect<(), ()> = Effect::<(), ()>::service::<Store>()
            .zip(Effect::service::<Audit>())
            .as_unit();
        let mut names: Vec<_> = needs_both.requirements().iter().map(CapabilityKey::name).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["Audit", "Store"]);

        let provided = needs_both.provide(Layer::instance::<Store>(Arc::new("s".into())));
        assert!(!provided.requires::<Store>());
        assert!(provided.requires::<Audit>());
    }

    #[test]
    fn test_span_names_outermost_first() {
        let effect: Effect<u8, String> = Effect::succeed(1)
            .with_span("inner", Attributes::new())
            .map(|n| n)
            .with_span("outer", Attributes::new());
        assert_eq!(effect.span_names(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<DiskError>(), "DiskError");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }
}
