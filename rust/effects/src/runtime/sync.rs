//! Locking helpers shared by the runtime.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
///
/// Every critical section in the runtime leaves its data consistent before
/// any user code can run, so a poisoned lock is still safe to read.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
