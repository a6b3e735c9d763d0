//! Hierarchical cancellation tokens.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::watch;

/// Cooperative cancellation handle for a run or a fiber.
///
/// Interrupting a token interrupts every child derived from it. The
/// interpreter checks the token between steps and races it against sleeps
/// and async leaves, so an interrupted run unwinds its span and provide
/// scopes and ends in `Outcome::Interrupted`.
///
/// ```
/// use weft_effects::Interruptor;
///
/// let parent = Interruptor::new();
/// let child = parent.child();
/// parent.interrupt();
/// assert!(child.is_interrupted());
/// ```
#[derive(Clone)]
pub struct Interruptor {
    inner: Arc<Inner>,
}

struct Inner {
    flag: watch::Sender<bool>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn interrupt(&self) {
        let changed = self.flag.send_if_modified(|flag| !std::mem::replace(flag, true));
        if !changed {
            return;
        }
        let children: Vec<_> = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.interrupt();
        }
    }
}

impl Interruptor {
    #[must_use]
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                flag,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token interrupted together with `self`, but not the other way round.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // the parent may have been interrupted before the push landed
        if self.is_interrupted() {
            child.interrupt();
        }
        child
    }

    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        *self.inner.flag.borrow()
    }

    /// Resolves once the token is interrupted.
    pub async fn interrupted(&self) {
        let mut rx = self.inner.flag.subscribe();
        if rx.wait_for(|flag| *flag).await.is_err() {
            // sender lives as long as `self`
            std::future::pending::<()>().await;
        }
    }
}

impl Default for Interruptor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Interruptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interruptor")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}
