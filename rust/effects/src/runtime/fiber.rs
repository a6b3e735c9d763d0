//! Forked fibers and their handles.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::watch;
use tracing::debug;
use weft_types::{Defect, Outcome};

use crate::effect::Effect;
use crate::node::{erase, ErasedOutcome, Node};
use crate::runtime::interrupt::Interruptor;
use crate::runtime::sync::lock;

/// Identifier of a fiber within a run. The root fiber is `#0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct FiberSlot {
    id: FiberId,
    outcome: Mutex<Option<ErasedOutcome>>,
    joined: AtomicBool,
    done: watch::Sender<bool>,
    interruptor: Interruptor,
}

/// Untyped handle shared by the spawning task, the supervisor and joiners.
#[derive(Clone)]
pub(crate) struct RawFiber {
    slot: Arc<FiberSlot>,
}

impl RawFiber {
    pub(crate) fn new(id: FiberId, interruptor: Interruptor) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            slot: Arc::new(FiberSlot {
                id,
                outcome: Mutex::new(None),
                joined: AtomicBool::new(false),
                done,
                interruptor,
            }),
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.slot.id
    }

    pub(crate) fn complete(&self, outcome: ErasedOutcome) {
        *lock(&self.slot.outcome) = Some(outcome);
        self.slot.done.send_replace(true);
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.slot.done.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.slot.done.subscribe();
        if rx.wait_for(|done| *done).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub(crate) fn interrupt(&self) {
        self.slot.interruptor.interrupt();
    }

    /// Hand the outcome to the single joiner.
    pub(crate) fn take(&self) -> ErasedOutcome {
        if self.slot.joined.swap(true, Ordering::SeqCst) {
            return Outcome::Defect(Defect::invariant(format!(
                "fiber {} already joined",
                self.slot.id
            )));
        }
        lock(&self.slot.outcome).take().unwrap_or_else(|| {
            Outcome::Defect(Defect::invariant(format!(
                "fiber {} finished without an outcome",
                self.slot.id
            )))
        })
    }

    /// Run `future` on the executor and record its outcome in this slot.
    pub(crate) fn start<F>(&self, future: F)
    where
        F: Future<Output = ErasedOutcome> + Send + 'static,
    {
        let fiber = self.clone();
        tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Outcome::Defect(Defect::panicked(&*payload)));
            debug!(fiber = %fiber.id(), outcome = outcome.kind_label(), "fiber finished");
            fiber.complete(outcome);
        });
    }
}

/// Handle to a forked fiber.
pub struct FiberHandle<A, E> {
    raw: RawFiber,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for FiberHandle<A, E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _types: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for FiberHandle<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.raw.id())
            .field("done", &self.raw.is_done())
            .finish()
    }
}

impl<A, E> FiberHandle<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new(raw: RawFiber) -> Self {
        Self {
            raw,
            _types: PhantomData,
        }
    }

    #[must_use]
    pub fn id(&self) -> FiberId {
        self.raw.id()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.raw.is_done()
    }

    /// Wait for the fiber and take over its outcome.
    ///
    /// Joining the same fiber twice dies with an invariant defect.
    #[must_use]
    pub fn join(&self) -> Effect<A, E> {
        let raw = self.raw.clone();
        Effect::from_node(Node::Async(Arc::new(move || {
            let raw = raw.clone();
            async move {
                raw.wait().await;
                raw.take()
            }
            .boxed()
        })))
    }

    /// Interrupt the fiber and wait until it has unwound.
    #[must_use]
    pub fn interrupt<E2: Send + 'static>(&self) -> Effect<(), E2> {
        let raw = self.raw.clone();
        Effect::from_node(Node::Async(Arc::new(move || {
            let raw = raw.clone();
            async move {
                raw.interrupt();
                raw.wait().await;
                Outcome::Success(erase(()))
            }
            .boxed()
        })))
    }
}

/// Fibers forked during a run.
#[derive(Default)]
pub(crate) struct Supervisor {
    children: Mutex<Vec<RawFiber>>,
}

impl Supervisor {
    pub(crate) fn adopt(&self, fiber: RawFiber) {
        let mut children = lock(&self.children);
        children.retain(|child| !child.is_done());
        children.push(fiber);
    }

    /// Interrupt every child still running and wait for all of them,
    /// including children forked while shutting down.
    pub(crate) async fn shutdown(&self) {
        loop {
            let pending: Vec<RawFiber> = lock(&self.children).drain(..).collect();
            if pending.is_empty() {
                return;
            }
            for fiber in pending.iter().filter(|f| !f.is_done()) {
                debug!(fiber = %fiber.id(), "interrupting unjoined fiber");
                fiber.interrupt();
            }
            for fiber in &pending {
                fiber.wait().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use weft_types::DefectKind;

    fn explode() -> ErasedOutcome {
        panic!("fiber blew up")
    }

    #[tokio::test]
    async fn test_second_take_is_invariant_defect() {
        let fiber = RawFiber::new(FiberId(1), Interruptor::new());
        fiber.start(async { Outcome::Success(erase(5_u8)) });
        fiber.wait().await;
        assert_matches!(fiber.take(), Outcome::Success(_));
        assert_matches!(
            fiber.take(),
            Outcome::Defect(defect) if defect.kind() == &DefectKind::Invariant
        );
    }

    #[tokio::test]
    async fn test_panicking_fiber_completes_with_defect() {
        let fiber = RawFiber::new(FiberId(2), Interruptor::new());
        fiber.start(async { explode() });
        fiber.wait().await;
        assert_matches!(
            fiber.take(),
            Outcome::Defect(defect) if defect.kind() == &DefectKind::Panicked
        );
    }

    #[tokio::test]
    async fn test_supervisor_interrupts_running_children() {
        let supervisor = Supervisor::default();
        let token = Interruptor::new();
        let fiber = RawFiber::new(FiberId(3), token.clone());
        let waiter = token.clone();
        fiber.start(async move {
            waiter.interrupted().await;
            Outcome::Interrupted
        });
        supervisor.adopt(fiber.clone());
        supervisor.shutdown().await;
        assert!(token.is_interrupted());
        assert_matches!(fiber.take(), Outcome::Interrupted);
    }
}
