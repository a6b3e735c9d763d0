// Interpreter for effect descriptions
//
// `map` and `flat_map` push frames on an explicit continuation stack, so a
// long sequential chain runs in constant native stack. Scoped nodes (span,
// provide, catch, or_die, race, repeat, ensuring) act on the outcome of
// their body and recurse into `eval` instead.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_recursion::async_recursion;
use futures::future::{self, Either};
use futures::FutureExt;
use tracing::{debug, trace, warn};
use weft_types::{Defect, Outcome, Rng};

use crate::node::{erase, ContFn, ErasedOutcome, MapFn, Node, NodeRef, Recovery, RetryIfFn, Value};
use crate::registry::{CapabilityKey, Instance, LayerEntry, Registry};
use crate::runtime::clock::RuntimeClock;
use crate::runtime::fiber::{FiberId, RawFiber, Supervisor};
use crate::runtime::interrupt::Interruptor;
use crate::runtime::sync::lock;
use crate::schedule::Schedule;
use crate::tracer::{interrupted_attributes, SpanId, SpanStatus, SpanTree};

/// State shared by every fiber of one run.
pub(crate) struct RunContext {
    pub(crate) clock: Arc<dyn RuntimeClock>,
    pub(crate) spans: SpanTree,
    pub(crate) supervisor: Supervisor,
    rng: Mutex<Box<dyn Rng>>,
    next_fiber: AtomicU64,
}

impl RunContext {
    pub(crate) fn new(clock: Arc<dyn RuntimeClock>, spans: SpanTree, rng: Box<dyn Rng>) -> Self {
        Self {
            clock,
            spans,
            supervisor: Supervisor::default(),
            rng: Mutex::new(rng),
            next_fiber: AtomicU64::new(1),
        }
    }

    fn next_fiber_id(&self) -> FiberId {
        FiberId(self.next_fiber.fetch_add(1, Ordering::Relaxed))
    }
}

enum Frame {
    Map(MapFn),
    FlatMap(ContFn),
}

enum Step {
    /// Evaluate this node next, keeping the current frames.
    Descend(NodeRef),
    /// The node produced an outcome; unwind the frames.
    Done(ErasedOutcome),
}

/// A scoped capability waiting for its release.
struct Acquired {
    key: CapabilityKey,
    release: NodeRef,
    registry: Registry,
}

/// Call user code, turning a panic into a defect.
fn guard<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Defect::panicked(&*payload))
}

fn value_or_defect(result: Result<Value, Defect>) -> ErasedOutcome {
    match result {
        Ok(value) => Outcome::Success(value),
        Err(defect) => Outcome::Defect(defect),
    }
}

/// Combine a body's outcome with the outcome of its cleanup step.
///
/// A cleanup defect replaces a success; otherwise the body's outcome wins
/// and the defect is only logged.
fn merge_cleanup(outcome: ErasedOutcome, cleanup: ErasedOutcome, what: &str) -> ErasedOutcome {
    match cleanup {
        Outcome::Defect(defect) if outcome.is_success() => Outcome::Defect(defect),
        Outcome::Defect(defect) => {
            warn!(cleanup = what, %defect, outcome = outcome.kind_label(), "cleanup died");
            outcome
        }
        _ => outcome,
    }
}

/// An open span; closed on every exit, including the future being dropped.
struct OpenSpan {
    run: Arc<RunContext>,
    id: SpanId,
    closed: bool,
}

impl OpenSpan {
    fn close(&mut self, outcome: &ErasedOutcome, describe: impl Fn(&Value) -> String) {
        if outcome.is_interrupted() {
            self.run.spans.annotate(self.id, &interrupted_attributes());
        }
        let status = SpanStatus::for_outcome(outcome, describe);
        self.run.spans.close(self.id, status, self.run.clock.now());
        self.closed = true;
    }
}

impl Drop for OpenSpan {
    fn drop(&mut self) {
        if !self.closed {
            self.run.spans.annotate(self.id, &interrupted_attributes());
            self.run
                .spans
                .close(self.id, SpanStatus::Ok, self.run.clock.now());
        }
    }
}

/// Execution state of one fiber: its registry, its ambient span and its
/// cancellation token.
pub(crate) struct FiberState {
    run: Arc<RunContext>,
    registry: Registry,
    current_span: Option<SpanId>,
    interruptor: Interruptor,
    id: FiberId,
}

impl FiberState {
    pub(crate) fn root(run: Arc<RunContext>, registry: Registry, interruptor: Interruptor) -> Self {
        Self {
            run,
            registry,
            current_span: None,
            interruptor,
            id: FiberId(0),
        }
    }

    /// A new fiber sharing this one's registry and ambient span.
    fn spawn_child(&self, interruptor: Interruptor) -> Self {
        Self {
            run: self.run.clone(),
            registry: self.registry.clone(),
            current_span: self.current_span,
            interruptor,
            id: self.run.next_fiber_id(),
        }
    }

    /// This fiber's context on a token nobody can interrupt.
    fn uninterruptible(&self, registry: Registry) -> Self {
        Self {
            run: self.run.clone(),
            registry,
            current_span: self.current_span,
            interruptor: Interruptor::new(),
            id: self.id,
        }
    }

    #[async_recursion]
    pub(crate) async fn eval(&mut self, root: NodeRef) -> ErasedOutcome {
        let mut stack: Vec<Frame> = Vec::new();
        let mut current = root;

        'trampoline: loop {
            let step = if self.interruptor.is_interrupted() {
                trace!(fiber = %self.id, "interrupted");
                Step::Done(Outcome::Interrupted)
            } else {
                let descend = match &*current {
                    Node::Map { inner, f } => {
                        stack.push(Frame::Map(f.clone()));
                        Some(inner.clone())
                    }
                    Node::FlatMap { inner, k } => {
                        stack.push(Frame::FlatMap(k.clone()));
                        Some(inner.clone())
                    }
                    _ => None,
                };
                match descend {
                    Some(inner) => Step::Descend(inner),
                    None => {
                        trace!(fiber = %self.id, node = %current.tag(), "eval");
                        self.step(&current).await
                    }
                }
            };

            let mut outcome = match step {
                Step::Descend(next) => {
                    current = next;
                    continue 'trampoline;
                }
                Step::Done(outcome) => outcome,
            };

            while let Some(frame) = stack.pop() {
                let value = match outcome {
                    Outcome::Success(value) => value,
                    other => {
                        outcome = other;
                        continue;
                    }
                };
                match frame {
                    Frame::Map(f) => {
                        outcome = value_or_defect(guard(|| f(value)).and_then(|mapped| mapped));
                    }
                    Frame::FlatMap(k) => match guard(|| k(value)).and_then(|next| next) {
                        Ok(next) => {
                            current = next;
                            continue 'trampoline;
                        }
                        Err(defect) => outcome = Outcome::Defect(defect),
                    },
                }
            }
            return outcome;
        }
    }

    async fn step(&mut self, node: &NodeRef) -> Step {
        match &**node {
            Node::Succeed(thunk) => Step::Done(value_or_defect(guard(|| thunk()))),
            Node::Fail(thunk) => Step::Done(match guard(|| thunk()) {
                Ok(error) => Outcome::Failure(error),
                Err(defect) => Outcome::Defect(defect),
            }),
            Node::Die(defect) => Step::Done(Outcome::Defect(defect.clone())),
            Node::Sync(f) => Step::Done(guard(|| f()).unwrap_or_else(Outcome::Defect)),
            Node::Async(f) => match guard(|| f()) {
                Ok(fut) => {
                    let fut = AssertUnwindSafe(fut).catch_unwind().map(|result| {
                        result.unwrap_or_else(|payload| Outcome::Defect(Defect::panicked(&*payload)))
                    });
                    Step::Done(self.interruptible(fut).await)
                }
                Err(defect) => Step::Done(Outcome::Defect(defect)),
            },
            Node::Suspend(f) => match guard(|| f()) {
                Ok(next) => Step::Descend(next),
                Err(defect) => Step::Done(Outcome::Defect(defect)),
            },
            Node::Map { inner, .. } | Node::FlatMap { inner, .. } => {
                // pushed by `eval`; reaching here would drop the frame
                Step::Done(Outcome::Defect(Defect::invariant(format!(
                    "sequencing node over {} reached step",
                    inner.tag()
                ))))
            }
            Node::Catch { body, handler } => match self.eval(body.clone()).await {
                Outcome::Failure(error) => match guard(|| handler(error)).and_then(|r| r) {
                    Ok(Recovery::Resume(next)) => Step::Descend(next),
                    Ok(Recovery::Reraise(error)) => Step::Done(Outcome::Failure(error)),
                    Err(defect) => Step::Done(Outcome::Defect(defect)),
                },
                other => Step::Done(other),
            },
            Node::OrDie { body, downgrade } => match self.eval(body.clone()).await {
                Outcome::Failure(error) => {
                    let defect = guard(|| downgrade(error)).unwrap_or_else(|defect| defect);
                    debug!(fiber = %self.id, %defect, "failure downgraded");
                    Step::Done(Outcome::Defect(defect))
                }
                other => Step::Done(other),
            },
            Node::Sleep(duration) => Step::Done(if self.sleep(*duration).await {
                Outcome::Success(erase(()))
            } else {
                Outcome::Interrupted
            }),
            Node::Span {
                name,
                attributes,
                describe,
                body,
            } => {
                let id = self.run.spans.open(
                    name,
                    self.current_span,
                    attributes.clone(),
                    self.run.clock.now(),
                );
                let mut span = OpenSpan {
                    run: self.run.clone(),
                    id,
                    closed: false,
                };
                let parent = self.current_span.replace(id);
                let outcome = self.eval(body.clone()).await;
                self.current_span = parent;
                span.close(&outcome, |error| guard(|| describe(error)).unwrap_or_default());
                Step::Done(outcome)
            }
            Node::Annotate(attributes) => {
                if let Some(span) = self.current_span {
                    self.run.spans.annotate(span, attributes);
                }
                Step::Done(Outcome::Success(erase(())))
            }
            Node::Service { key, extract } => Step::Done(self.resolve(key, |i| extract(i))),
            Node::Provide { entries, body } => {
                Step::Done(self.provide(entries.as_slice(), body.clone()).await)
            }
            Node::Fork { body, wrap } => {
                let fiber = self.fork(body.clone());
                Step::Done(value_or_defect(guard(|| wrap(fiber))))
            }
            Node::Race { left, right } => Step::Done(self.race(left.clone(), right.clone()).await),
            Node::Repeat {
                body,
                schedule,
                retry_if,
            } => Step::Done(self.repeat(body, schedule, retry_if.as_ref()).await),
            Node::Ensuring { body, finalizer } => {
                let outcome = self.eval(body.clone()).await;
                let finalized = self
                    .uninterruptible(self.registry.clone())
                    .eval(finalizer.clone())
                    .await;
                Step::Done(merge_cleanup(outcome, finalized, "finalizer"))
            }
            Node::Interrupt => {
                debug!(fiber = %self.id, "fiber interrupted itself");
                self.interruptor.interrupt();
                Step::Done(Outcome::Interrupted)
            }
        }
    }

    /// Sleep on the run's clock. Returns `false` if interrupted first.
    ///
    /// A zero duration still yields to the executor once.
    async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return tokio::select! {
                biased;
                () = self.interruptor.interrupted() => false,
                () = tokio::task::yield_now() => !self.interruptor.is_interrupted(),
            };
        }
        let clock = self.run.clock.clone();
        tokio::select! {
            biased;
            () = self.interruptor.interrupted() => false,
            () = clock.sleep(duration) => true,
        }
    }

    async fn interruptible<F>(&self, fut: F) -> ErasedOutcome
    where
        F: Future<Output = ErasedOutcome>,
    {
        tokio::select! {
            biased;
            () = self.interruptor.interrupted() => Outcome::Interrupted,
            outcome = fut => outcome,
        }
    }

    fn resolve(
        &self,
        key: &CapabilityKey,
        extract: impl FnOnce(&Instance) -> Option<Value>,
    ) -> ErasedOutcome {
        let Some(instance) = self.registry.lookup(key) else {
            debug!(fiber = %self.id, capability = key.name(), "capability missing");
            return Outcome::Defect(Defect::missing_capability(key.name()));
        };
        match guard(|| extract(instance)) {
            Ok(Some(service)) => Outcome::Success(service),
            Ok(None) => Outcome::Defect(Defect::invariant(format!(
                "capability `{}` holds an instance of the wrong type",
                key.name()
            ))),
            Err(defect) => Outcome::Defect(defect),
        }
    }

    /// Install `entries` in order, run `body`, then release scoped entries
    /// in reverse order.
    async fn provide(&mut self, entries: &[LayerEntry], body: NodeRef) -> ErasedOutcome {
        let outer = self.registry.clone();
        let mut scope = outer.clone();
        let mut acquired: Vec<Acquired> = Vec::new();
        let mut aborted = None;

        for entry in entries {
            match entry {
                LayerEntry::Instance { key, instance } => {
                    scope = scope.extended(*key, instance.clone());
                }
                LayerEntry::Scoped { key, acquire, seal } => {
                    self.registry = scope.clone();
                    let sealed = match self.eval(acquire.clone()).await {
                        Outcome::Success(value) => guard(|| seal(value)).and_then(|r| r),
                        other => {
                            debug!(
                                fiber = %self.id,
                                capability = key.name(),
                                outcome = other.kind_label(),
                                "acquire did not succeed"
                            );
                            aborted = Some(other);
                            break;
                        }
                    };
                    match sealed {
                        Ok((instance, release)) => {
                            scope = scope.extended(*key, instance);
                            debug!(fiber = %self.id, capability = key.name(), "capability acquired");
                            acquired.push(Acquired {
                                key: *key,
                                release,
                                registry: scope.clone(),
                            });
                        }
                        Err(defect) => {
                            aborted = Some(Outcome::Defect(defect));
                            break;
                        }
                    }
                }
            }
        }

        let outcome = match aborted {
            Some(outcome) => outcome,
            None => {
                self.registry = scope;
                self.eval(body).await
            }
        };
        self.registry = outer;
        self.release_all(acquired, outcome).await
    }

    async fn release_all(&self, acquired: Vec<Acquired>, outcome: ErasedOutcome) -> ErasedOutcome {
        let mut outcome = outcome;
        for Acquired {
            key,
            release,
            registry,
        } in acquired.into_iter().rev()
        {
            let released = self.uninterruptible(registry).eval(release).await;
            debug!(fiber = %self.id, capability = key.name(), "capability released");
            outcome = merge_cleanup(outcome, released, key.name());
        }
        outcome
    }

    fn fork(&self, body: NodeRef) -> RawFiber {
        let interruptor = self.interruptor.child();
        let mut child = self.spawn_child(interruptor.clone());
        let fiber = RawFiber::new(child.id, interruptor);
        self.run.supervisor.adopt(fiber.clone());
        debug!(parent = %self.id, fiber = %child.id, "fiber forked");
        fiber.start(async move { child.eval(body).await });
        fiber
    }

    async fn race(&self, left: NodeRef, right: NodeRef) -> ErasedOutcome {
        let mut left_fiber = self.spawn_child(self.interruptor.child());
        let mut right_fiber = self.spawn_child(self.interruptor.child());
        let left_token = left_fiber.interruptor.clone();
        let right_token = right_fiber.interruptor.clone();

        let left_run = left_fiber.eval(left);
        let right_run = right_fiber.eval(right);
        let decided = future::select(left_run, right_run).await;
        match decided {
            Either::Left((outcome, loser)) => {
                trace!(fiber = %self.id, winner = "left", "race decided");
                right_token.interrupt();
                let _ = loser.await;
                outcome
            }
            Either::Right((outcome, loser)) => {
                trace!(fiber = %self.id, winner = "right", "race decided");
                left_token.interrupt();
                let _ = loser.await;
                outcome
            }
        }
    }

    async fn repeat(
        &mut self,
        body: &NodeRef,
        schedule: &Schedule,
        retry_if: Option<&RetryIfFn>,
    ) -> ErasedOutcome {
        let mut attempt: u32 = 0;
        loop {
            let error = match self.eval(body.clone()).await {
                Outcome::Failure(error) => error,
                other => return other,
            };
            if let Some(predicate) = retry_if {
                match guard(|| predicate(&error)).and_then(|r| r) {
                    Ok(true) => {}
                    Ok(false) => return Outcome::Failure(error),
                    Err(defect) => return Outcome::Defect(defect),
                }
            }
            attempt = attempt.saturating_add(1);
            if !schedule.allows(attempt) {
                debug!(fiber = %self.id, attempts = attempt, "repeat schedule exhausted");
                return Outcome::Failure(error);
            }
            let delay = schedule.delay_for(attempt, &mut **lock(&self.run.rng));
            debug!(fiber = %self.id, attempt, ?delay, "failure, retrying");
            if !self.sleep(delay).await {
                return Outcome::Interrupted;
            }
        }
    }
}
