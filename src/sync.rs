//! RAII lock wrappers and a counting semaphore.
//!
//! These mirror the small taxonomy of synchronization primitives the
//! original runtime exposed (`Mutex`, `RWMutex`, `Spinlock`, `Semaphore`):
//! thin enough to be obviously correct, but named consistently so the rest
//! of the crate reads the same whichever one is in play. Poisoning from a
//! panicking holder is treated as a fatal invariant violation rather than
//! something callers are expected to recover from, matching the "no lock
//! survives a panicked critical section" stance taken everywhere else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex as StdMutex, MutexGuard, RwLock as StdRwLock};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

/// A plain mutual-exclusion lock. Thin wrapper over [`std::sync::Mutex`]
/// that turns poisoning into a fatal abort instead of propagating it.
pub struct Mutex<T: ?Sized> {
    inner: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            inner: StdMutex::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(|e| crate::log::fatal_unreachable("mutex poisoned", &e))
    }
}

/// A reader/writer lock. Many readers or a single writer, never both.
pub struct RwLock<T: ?Sized> {
    inner: StdRwLock<T>,
}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        RwLock {
            inner: StdRwLock::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner
            .read()
            .unwrap_or_else(|e| crate::log::fatal_unreachable("rwlock poisoned", &e))
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner
            .write()
            .unwrap_or_else(|e| crate::log::fatal_unreachable("rwlock poisoned", &e))
    }
}

/// A test-and-set spinlock. Only worth using for critical sections so
/// short that parking a thread would cost more than busy-waiting; every
/// other lock in the crate should prefer [`Mutex`].
pub struct Spinlock {
    locked: AtomicBool,
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Spinlock {
    pub const fn new() -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinlockGuard { lock: self }
    }
}

pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A counting semaphore built from a [`Mutex`] + [`Condvar`] pair, the
/// same way the original runtime layered one on top of `pthread`'s
/// `sem_t`.
pub struct Semaphore {
    count: StdMutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Semaphore {
            count: StdMutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling OS thread until a permit is available.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Releases a permit, waking at most one waiter.
    pub fn notify(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}
