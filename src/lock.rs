//! Thin mutual-exclusion wrappers used by the queues and the shutdown protocol.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A mutex that never reports poisoning.
///
/// Task bodies run under `catch_unwind`, so a panic can never leave a queue
/// half-updated while one of these is held. Recovering the guard is always
/// sound for the data guarded here.
#[derive(Debug, Default)]
pub struct Lock<T> {
    inner: Mutex<T>,
}

impl<T> Lock<T> {
    pub const fn new(value: T) -> Self {
        Lock {
            inner: Mutex::new(value),
        }
    }

    /// Acquires the lock, blocking the current thread until it is available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A one-shot gate: threads block in [`Gate::wait`] until [`Gate::open`].
///
/// Dying workers park here after publishing their statistics so the runtime
/// can collect them before the threads are joined.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        *open = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = self
                .cond
                .wait(open)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
