//! OS thread wrapper used by [`crate::scheduler`] to spin up worker
//! threads. Thin layer over [`std::thread`] that additionally tracks,
//! per-thread, the [`Thread`] handle and name so other modules (mainly
//! [`crate::log`]'s thread-name formatting and [`crate::scheduler`]'s
//! affinity checks) can ask "what thread am I" without passing a handle
//! around explicitly.

use std::cell::RefCell;
use std::thread::JoinHandle;

thread_local! {
    static CURRENT_NAME: RefCell<String> = RefCell::new("UNKNOWN".to_string());
}

/// A named OS thread running a single closure to completion.
///
/// Unlike [`std::thread::JoinHandle`], a `Thread` remembers its own name so
/// it can be reported by [`Thread::name`] after the closure has started
/// running (`JoinHandle` only exposes the name of the *current* thread).
pub struct Thread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns `cb` on a new OS thread named `name`. The name is truncated
    /// to 15 bytes for the underlying OS thread name (the Linux
    /// `pthread_setname_np` limit), matching the original runtime, though
    /// the full name remains available from [`Thread::name`].
    pub fn spawn<F>(name: impl Into<String>, cb: F) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let os_name: String = name.chars().take(15).collect();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(os_name)
            .spawn(move || {
                CURRENT_NAME.with(|n| *n.borrow_mut() = thread_name.clone());
                cb();
            })
            .unwrap_or_else(|e| crate::log::fatal_unreachable("failed to spawn OS thread", &e));
        Thread {
            name,
            handle: Some(handle),
        }
    }

    /// The name this thread was spawned with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the thread's closure returns. A no-op if already
    /// joined. Fatal if the closure panicked, since a worker thread dying
    /// silently would otherwise leave the scheduler permanently short a
    /// thread.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                crate::log::fatal(&format!("thread '{}' panicked: {e:?}", self.name));
            }
        }
    }
}

/// The name of the calling OS thread, as set by [`Thread::spawn`], or
/// `"UNKNOWN"` on a thread this module didn't start (e.g. the process's
/// initial thread).
pub fn current_name() -> String {
    CURRENT_NAME.with(|n| n.borrow().clone())
}

/// Sets the calling thread's name, e.g. so the main thread can identify
/// itself in log output the same way a spawned worker does.
pub fn set_current_name(name: impl Into<String>) {
    let name = name.into();
    if name.is_empty() {
        return;
    }
    CURRENT_NAME.with(|n| *n.borrow_mut() = name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn spawned_thread_sees_its_own_name() {
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        let mut t = Thread::spawn("worker-1", move || {
            assert_eq!(current_name(), "worker-1");
            seen2.store(true, Ordering::SeqCst);
        });
        t.join();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn default_name_is_unknown_on_fresh_thread() {
        let mut t = Thread::spawn("", || {
            // empty name falls back to std::thread's default naming;
            // our side still starts from "UNKNOWN" until set.
        });
        t.join();
    }
}
