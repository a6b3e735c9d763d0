//! Clocks the interpreter reads span times from and sleeps on.
//!
//! [`SystemClock`] is backed by tokio's timer, so it also follows tokio's
//! paused test time. [`MockClock`] never waits: sleeping moves it forward by
//! the requested amount and yields once, which makes span timings and retry
//! schedules exact in tests.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;

use crate::runtime::sync::lock;

/// Time source of a runtime.
pub trait RuntimeClock: Send + Sync {
    /// Monotonic offset from the clock's origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Host time through tokio.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeClock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Virtual time that only moves when something sleeps on it.
///
/// Concurrent sleepers each add their own duration, so the reading is the
/// total time slept across the run.
///
/// ```
/// use std::time::Duration;
/// use weft_effects::{MockClock, RuntimeClock};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let clock = MockClock::new();
/// clock.sleep(Duration::from_millis(250)).await;
/// assert_eq!(clock.now(), Duration::from_millis(250));
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MockClock {
    slept: Mutex<Duration>,
}

impl MockClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuntimeClock for MockClock {
    fn now(&self) -> Duration {
        *lock(&self.slept)
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        {
            let mut slept = lock(&self.slept);
            *slept = slept.saturating_add(duration);
        }
        tokio::task::yield_now().boxed()
    }
}
