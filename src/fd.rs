//! Per-fd epoll registration bookkeeping for [`crate::iomanager`].
//!
//! Each registered fd gets one [`FdContext`] tracking which of
//! [`Event::READ`]/[`Event::WRITE`] it's currently interested in and, for
//! each, what to do when the event fires: resume a waiting fiber or run a
//! plain callback. This is deliberately a thin data structure - all the
//! epoll_ctl bookkeeping and dispatch live in [`crate::iomanager`], which
//! is the only thing that constructs and mutates these.

use std::os::raw::c_int;
use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::sync::Mutex;

bitflags! {
    /// The epoll readiness conditions an fd can be registered for.
    /// Bit values match `EPOLLIN`/`EPOLLOUT` directly so they can be
    /// passed straight through to `epoll_ctl`.
    pub struct Event: u32 {
        const NONE = 0x0;
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

/// What happens when an [`Event`] fires on an fd: either a fiber is
/// resumed, or a plain closure runs - never both.
pub(crate) enum Waiter {
    Fiber(Fiber),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

pub(crate) struct EventContext {
    pub(crate) scheduler: Option<Scheduler>,
    pub(crate) waiter: Option<Waiter>,
}

impl EventContext {
    fn empty() -> EventContext {
        EventContext { scheduler: None, waiter: None }
    }

    fn take(&mut self) -> Option<(Scheduler, Waiter)> {
        let scheduler = self.scheduler.take()?;
        let waiter = self.waiter.take()?;
        Some((scheduler, waiter))
    }
}

struct Inner {
    events: Event,
    read: EventContext,
    write: EventContext,
}

/// Tracks one fd's epoll registration. Lives in the table owned by
/// [`crate::iomanager::IOManager`], indexed by fd number.
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    inner: Mutex<Inner>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(Inner {
                events: Event::NONE,
                read: EventContext::empty(),
                write: EventContext::empty(),
            }),
        }
    }

    pub(crate) fn events(&self) -> Event {
        self.inner.lock().events
    }

    /// Registers interest in `event`, asserting it isn't already
    /// registered (mirrors the original's invariant - callers are
    /// expected to check [`FdContext::events`] first if double
    /// registration is possible). Returns the fd's previous interest
    /// mask, so the caller knows whether this is an `EPOLL_CTL_ADD` or
    /// `EPOLL_CTL_MOD`.
    pub(crate) fn add_event(&self, event: Event, scheduler: Scheduler, waiter: Waiter) -> Result<Event, c_int> {
        let mut inner = self.inner.lock();
        if inner.events.contains(event) {
            return Err(self.fd);
        }
        let previous = inner.events;
        inner.events.insert(event);
        let ctx = if event == Event::READ { &mut inner.read } else { &mut inner.write };
        ctx.scheduler = Some(scheduler);
        ctx.waiter = Some(waiter);
        Ok(previous)
    }

    /// Clears interest in `event` without dispatching whatever was
    /// waiting on it (used when the waiter cancels itself cleanly, e.g.
    /// after a successful read that also happened to be the last one
    /// wanted).
    pub(crate) fn del_event(&self, event: Event) -> Event {
        let mut inner = self.inner.lock();
        inner.events.remove(event);
        let ctx = if event == Event::READ { &mut inner.read } else { &mut inner.write };
        *ctx = EventContext::empty();
        inner.events
    }

    /// Clears interest in `event` and returns whatever was waiting on it,
    /// so the caller can dispatch it immediately (cancellation - the
    /// waiter still needs to wake up, just with an error instead of
    /// readiness).
    pub(crate) fn trigger_event(&self, event: Event) -> Option<(Scheduler, Waiter)> {
        let mut inner = self.inner.lock();
        inner.events.remove(event);
        let ctx = if event == Event::READ { &mut inner.read } else { &mut inner.write };
        ctx.take()
    }
}
