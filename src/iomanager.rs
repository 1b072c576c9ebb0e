//! Epoll-backed I/O scheduling.
//!
//! An [`IOManager`] is a [`Scheduler`] plus a [`crate::timer::TimerManager`]
//! plus one `epoll` instance, composed rather than built by subclassing -
//! it supplies its own [`SchedulerHooks`] so the scheduler's idle threads
//! block in `epoll_wait` instead of just spinning on [`crate::fiber::yield_to_hold`].
//! A self-pipe registered with `EPOLLIN|EPOLLET` lets any thread wake an
//! idle worker out of `epoll_wait` - the same trick the original used,
//! since `epoll_wait` itself has no cross-thread "interrupt me" call.

use std::any::Any;
use std::collections::HashMap;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;

pub use crate::fd::Event;
use crate::fd::{FdContext, Waiter};
use crate::scheduler::{Scheduler, SchedulerHooks};
use crate::sync::{Mutex, RwLock};
use crate::timer::TimerManager;

/// Maps a running [`Scheduler`]'s identity to a weak handle on the
/// [`IOManager`] that owns it, so hook functions (see [`crate::hook`])
/// running on a worker thread can recover "the IOManager driving me" from
/// "the scheduler driving me" - the same role the original's thread-local
/// `IOManager::GetThis()` played, without needing its own separate
/// thread-local (this crate's worker threads already set
/// [`Scheduler::current`]). Entries are weak so an `IOManager` going out
/// of scope still drops its epoll fd and pipe normally; a dead entry just
/// fails to upgrade and is harmless clutter rather than a leak of the
/// `IOManager` itself.
static REGISTRY: Lazy<Mutex<HashMap<usize, Weak<EpollState>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

const TICKLE_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 256;
const MAX_IDLE_TIMEOUT_MS: u64 = 5000;
const INITIAL_FD_TABLE_SIZE: usize = 32;

struct EpollState {
    epfd: RawFd,
    tickle_r: RawFd,
    tickle_w: RawFd,
    fds: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
    timers: TimerManager,
}

impl EpollState {
    fn raw_tickle(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.tickle_w, byte.as_ptr() as *const _, 1);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe { libc::read(self.tickle_r, buf.as_mut_ptr() as *mut _, buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }

    fn rearm(&self, fd: RawFd, remaining: Event) {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.u64 = fd as u64;
        let (op, ok) = if remaining.is_empty() {
            (libc::EPOLL_CTL_DEL, unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) })
        } else {
            ev.events = remaining.bits() | libc::EPOLLET as u32;
            (libc::EPOLL_CTL_MOD, unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) })
        };
        if ok != 0 {
            log::warn!(
                "epoll_ctl({op}) failed while re-arming fd {fd}: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    /// The idle-fiber body every worker thread runs when it has no
    /// runnable task: wait in `epoll_wait` for either the next timer
    /// deadline or an fd to become ready, dispatch whatever fired, yield,
    /// repeat.
    fn idle_loop(&self, scheduler: &Scheduler) {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        loop {
            if scheduler.is_stopping() {
                log::debug!("io manager idle loop exiting, scheduler stopping");
                return;
            }

            let next_timer = self.timers.get_next_timer();
            let timeout_ms = next_timer.min(MAX_IDLE_TIMEOUT_MS) as c_int;

            let n = loop {
                let rc = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as c_int, timeout_ms) };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    crate::log::fatal(&format!("epoll_wait failed: {err}"));
                }
                break rc as usize;
            };

            let expired = self.timers.list_expired_cbs();
            if !expired.is_empty() {
                scheduler.schedule_callbacks(expired);
            }

            for raw in &events[..n] {
                if raw.u64 == TICKLE_TOKEN {
                    self.drain_tickle_pipe();
                    continue;
                }

                let fd = raw.u64 as RawFd;
                let ctx = match self.fds.read().get(fd as usize) {
                    Some(ctx) => ctx.clone(),
                    None => continue,
                };
                let registered = ctx.events();
                if registered.is_empty() {
                    continue;
                }

                let mut incoming = Event::from_bits_truncate(raw.events);
                if raw.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    incoming.insert(Event::READ | Event::WRITE);
                }
                let triggered = incoming & registered;
                if triggered.is_empty() {
                    continue;
                }

                self.rearm(fd, registered & !triggered);

                for bit in [Event::READ, Event::WRITE] {
                    if triggered.contains(bit) {
                        if let Some((sched, waiter)) = ctx.trigger_event(bit) {
                            self.pending.fetch_sub(1, Ordering::SeqCst);
                            dispatch(sched, waiter);
                        }
                    }
                }
            }

            crate::fiber::yield_to_hold();
        }
    }
}

impl Drop for EpollState {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_r);
            libc::close(self.tickle_w);
        }
    }
}

struct IoHooks(Arc<EpollState>);

impl SchedulerHooks for IoHooks {
    fn tickle(&self, scheduler: &Scheduler) {
        if scheduler.has_idle_threads() {
            self.0.raw_tickle();
        }
    }

    fn stopping(&self, _scheduler: &Scheduler) -> bool {
        self.0.timers.get_next_timer() == u64::MAX && self.0.pending.load(Ordering::SeqCst) == 0
    }

    fn idle(&self, scheduler: &Scheduler) {
        self.0.idle_loop(scheduler);
    }
}

fn dispatch(scheduler: Scheduler, waiter: Waiter) {
    match waiter {
        Waiter::Fiber(fiber) => scheduler.schedule_fiber(fiber),
        Waiter::Callback(cb) => scheduler.schedule_on(cb, None),
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

/// A scheduler that also multiplexes fd readiness and timers. This is the
/// top-level entry point most callers construct: an `IOManager` is a
/// complete cooperative runtime on its own. Cheap to clone; clones share
/// the same scheduler, epoll instance and timers.
#[derive(Clone)]
pub struct IOManager {
    scheduler: Scheduler,
    state: Arc<EpollState>,
}

impl IOManager {
    /// Builds and starts an `IOManager` with `threads` worker threads. If
    /// `use_caller` is set, the constructing thread is one of them - call
    /// [`IOManager::stop`] from that same thread to let it participate in
    /// dispatch and then block until shutdown.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> IOManager {
        let name = name.into();

        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            crate::log::fatal(&format!("epoll_create1 failed: {}", std::io::Error::last_os_error()));
        }

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            crate::log::fatal(&format!("pipe() failed: {}", std::io::Error::last_os_error()));
        }
        let (tickle_r, tickle_w) = (pipe_fds[0], pipe_fds[1]);
        set_nonblocking(tickle_r);

        let state = Arc::new_cyclic(|weak: &Weak<EpollState>| {
            let weak_for_timer = weak.clone();
            EpollState {
                epfd,
                tickle_r,
                tickle_w,
                fds: RwLock::new(Vec::new()),
                pending: AtomicUsize::new(0),
                timers: TimerManager::new(move || {
                    if let Some(state) = weak_for_timer.upgrade() {
                        state.raw_tickle();
                    }
                }),
            }
        });

        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = (libc::EPOLLIN | libc::EPOLLET) as u32;
        ev.u64 = TICKLE_TOKEN;
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_r, &mut ev) } != 0 {
            crate::log::fatal(&format!(
                "failed to register self-pipe with epoll: {}",
                std::io::Error::last_os_error()
            ));
        }

        let hooks: Arc<dyn SchedulerHooks> = Arc::new(IoHooks(state.clone()));
        let scheduler = Scheduler::new(threads, use_caller, name, hooks);

        let manager = IOManager { scheduler, state };
        manager.ensure_capacity(INITIAL_FD_TABLE_SIZE);
        REGISTRY
            .lock()
            .insert(manager.scheduler.ptr_key(), Arc::downgrade(&manager.state));
        manager.scheduler.start();
        manager
    }

    /// The `IOManager` whose scheduler is running on the calling thread,
    /// if any. This is how hooked libc calls (see [`crate::hook`]) find
    /// their way back to the runtime driving the current fiber.
    pub fn current() -> Option<IOManager> {
        let scheduler = Scheduler::current()?;
        let weak = REGISTRY.lock().get(&scheduler.ptr_key())?.clone();
        let state = weak.upgrade()?;
        Some(IOManager { scheduler, state })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn timers(&self) -> &TimerManager {
        &self.state.timers
    }

    fn ensure_capacity(&self, min_len: usize) {
        {
            let fds = self.state.fds.read();
            if fds.len() >= min_len {
                return;
            }
        }
        let mut fds = self.state.fds.write();
        if fds.len() >= min_len {
            return;
        }
        let new_len = min_len.max(fds.len() + fds.len() / 2 + 1);
        for i in fds.len()..new_len {
            fds.push(Arc::new(FdContext::new(i as RawFd)));
        }
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        self.ensure_capacity(fd as usize + 1);
        self.state.fds.read()[fd as usize].clone()
    }

    fn add_event_with(&self, fd: RawFd, event: Event, waiter: Waiter) -> crate::error::Result<()> {
        let ctx = self.fd_context(fd);
        let previous = ctx
            .add_event(event, self.scheduler.clone(), waiter)
            .map_err(|_| crate::error::Error::EventAlreadyRegistered(event, fd))?;

        let op = if previous.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = (previous | event).bits() | libc::EPOLLET as u32;
        ev.u64 = fd as u64;
        if unsafe { libc::epoll_ctl(self.state.epfd, op, fd, &mut ev) } != 0 {
            return Err(crate::error::Error::EpollCtl(std::io::Error::last_os_error()));
        }
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Registers interest in `event` on `fd`, resuming the calling fiber
    /// once it fires. The caller is expected to immediately
    /// [`crate::fiber::yield_to_hold`] after this returns successfully.
    pub fn add_event(&self, fd: RawFd, event: Event) -> crate::error::Result<()> {
        let fiber = crate::fiber::current().unwrap_or_else(|| crate::log::fatal("add_event called with no running fiber"));
        self.add_event_with(fd, event, Waiter::Fiber(fiber))
    }

    /// Like [`IOManager::add_event`], but runs `cb` as a plain scheduled
    /// closure instead of resuming a fiber.
    pub fn add_event_callback<F>(&self, fd: RawFd, event: Event, cb: F) -> crate::error::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_with(fd, event, Waiter::Callback(Box::new(cb)))
    }

    /// Clears interest in `event` without dispatching whatever was
    /// waiting on it. Returns `false` if `event` wasn't registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.state.fds.read().get(fd as usize).cloned() else {
            return false;
        };
        if !ctx.events().contains(event) {
            return false;
        }
        let remaining = ctx.del_event(event);
        self.state.rearm(fd, remaining);
        self.state.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Clears interest in `event` and dispatches whatever was waiting on
    /// it immediately, as if it had fired. Returns `false` if `event`
    /// wasn't registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.state.fds.read().get(fd as usize).cloned() else {
            return false;
        };
        let Some((sched, waiter)) = ctx.trigger_event(event) else {
            return false;
        };
        self.state.rearm(fd, ctx.events());
        self.state.pending.fetch_sub(1, Ordering::SeqCst);
        dispatch(sched, waiter);
        true
    }

    /// Cancels every registered event on `fd`.
    pub fn cancel_all(&self, fd: RawFd) {
        for event in [Event::READ, Event::WRITE] {
            self.cancel_event(fd, event);
        }
    }

    /// Requests shutdown and blocks until every worker thread has exited.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Registers interest in `event` on `fd` for the calling fiber, for the
    /// safe `Result`-returning counterpart to [`crate::hook::do_io`]'s raw
    /// errno retry loop - useful for callers building directly on
    /// `IOManager` rather than going through the `hook` feature. Splitting
    /// registration from the actual suspend (see [`IOManager::wait`]) hands
    /// the caller a [`WaitHandle`] it can pass to another fiber before
    /// blocking, so that fiber can explicitly cancel the wait.
    pub fn register_wait(&self, fd: RawFd, event: Event) -> crate::error::Result<WaitHandle> {
        self.add_event(fd, event)?;
        Ok(WaitHandle {
            iom: self.clone(),
            fd,
            event,
            reason: Arc::new(Mutex::new(None)),
        })
    }

    /// Suspends the calling fiber until `handle`'s event fires, `timeout_ms`
    /// elapses, or another fiber calls [`WaitHandle::cancel`]. A timeout and
    /// an explicit cancel both interrupt the wait the same way (dropping
    /// the event registration) but are reported as distinct errors, per the
    /// "cancellation looks like a timeout unless the caller supplies an
    /// explicit path" rule.
    pub fn wait(&self, handle: &WaitHandle, timeout_ms: Option<u64>) -> crate::error::Result<()> {
        if self.scheduler.is_stopping() {
            return Err(crate::error::Error::SchedulerStopped);
        }

        let timer = timeout_ms.map(|ms| {
            let reason = handle.reason.clone();
            let iom = self.clone();
            let (fd, event) = (handle.fd, handle.event);
            let alive = Arc::new(());
            let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&alive) as Weak<dyn Any + Send + Sync>;
            let t = self.timers().add_condition_timer(
                ms,
                Arc::new(move || {
                    *reason.lock() = Some(WaitReason::Timeout);
                    iom.cancel_event(fd, event);
                }),
                weak,
                false,
            );
            (t, alive)
        });

        crate::fiber::yield_to_hold();

        if let Some((t, _alive)) = &timer {
            t.cancel();
        }

        match handle.reason.lock().take() {
            Some(WaitReason::Timeout) => Err(crate::error::Error::Timeout),
            Some(WaitReason::Cancelled) => Err(crate::error::Error::Cancelled),
            None => Ok(()),
        }
    }

    /// Marks `fd` non-blocking via `fcntl`, the safe counterpart to this
    /// module's internal `set_nonblocking` helper, for callers preparing an
    /// fd before handing it to [`IOManager::register_wait`].
    pub fn mark_nonblocking(&self, fd: RawFd) -> crate::error::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags == -1 {
            return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
            return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// A handle to a pending [`IOManager::wait`] call, returned by
/// [`IOManager::register_wait`]. Cloning shares the same underlying wait -
/// hand a clone to another fiber so it can [`cancel`](WaitHandle::cancel)
/// the wait explicitly.
#[derive(Clone)]
pub struct WaitHandle {
    iom: IOManager,
    fd: RawFd,
    event: Event,
    reason: Arc<Mutex<Option<WaitReason>>>,
}

#[derive(Clone, Copy)]
enum WaitReason {
    Timeout,
    Cancelled,
}

impl WaitHandle {
    /// Explicitly cancels the pending wait, waking it with
    /// [`crate::error::Error::Cancelled`] instead of `Ok`. A no-op if the
    /// wait already completed (by readiness or its own timeout).
    pub fn cancel(&self) {
        *self.reason.lock() = Some(WaitReason::Cancelled);
        self.iom.cancel_event(self.fd, self.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn readable_pipe_wakes_waiting_callback() {
        let manager = IOManager::new(2, false, "io-test");
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblocking(r);

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        manager
            .add_event_callback(r, Event::READ, move || {
                fired2.store(true, Ordering::SeqCst);
            })
            .expect("add_event_callback should succeed");

        unsafe {
            libc::write(w, b"x".as_ptr() as *const _, 1);
        }

        std::thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));

        manager.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn wait_times_out_when_never_readable() {
        let manager = IOManager::new(2, false, "io-wait-timeout-test");
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblocking(r);

        let outcome: Arc<Mutex<Option<crate::error::Result<()>>>> = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let manager2 = manager.clone();
        manager.scheduler().schedule(move || {
            let handle = manager2.register_wait(r, Event::READ).expect("register_wait should succeed");
            *outcome2.lock() = Some(manager2.wait(&handle, Some(30)));
        });

        std::thread::sleep(Duration::from_millis(200));
        manager.stop();

        match outcome.lock().take() {
            Some(Err(crate::error::Error::Timeout)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn wait_succeeds_once_fd_becomes_readable() {
        let manager = IOManager::new(2, false, "io-wait-ready-test");
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblocking(r);

        let outcome: Arc<Mutex<Option<crate::error::Result<()>>>> = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let manager2 = manager.clone();
        manager.scheduler().schedule(move || {
            let handle = manager2.register_wait(r, Event::READ).expect("register_wait should succeed");
            *outcome2.lock() = Some(manager2.wait(&handle, Some(5000)));
        });

        std::thread::sleep(Duration::from_millis(50));
        unsafe {
            libc::write(w, b"x".as_ptr() as *const _, 1);
        }
        std::thread::sleep(Duration::from_millis(100));
        manager.stop();

        assert!(matches!(outcome.lock().take(), Some(Ok(()))));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn wait_handle_cancel_reports_cancelled() {
        let manager = IOManager::new(2, false, "io-wait-cancel-test");
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblocking(r);

        let outcome: Arc<Mutex<Option<crate::error::Result<()>>>> = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let manager2 = manager.clone();
        let handle_slot: Arc<Mutex<Option<WaitHandle>>> = Arc::new(Mutex::new(None));
        let handle_slot2 = handle_slot.clone();
        manager.scheduler().schedule(move || {
            let handle = manager2.register_wait(r, Event::READ).expect("register_wait should succeed");
            *handle_slot2.lock() = Some(handle.clone());
            *outcome2.lock() = Some(manager2.wait(&handle, None));
        });

        std::thread::sleep(Duration::from_millis(50));
        handle_slot.lock().as_ref().expect("waiter should have registered by now").cancel();
        std::thread::sleep(Duration::from_millis(100));
        manager.stop();

        match outcome.lock().take() {
            Some(Err(crate::error::Error::Cancelled)) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn mark_nonblocking_rejects_bad_fd() {
        let manager = IOManager::new(1, false, "io-mark-nonblocking-test");
        assert!(matches!(manager.mark_nonblocking(-1), Err(crate::error::Error::Io(_))));
        manager.stop();
    }

    #[test]
    fn timer_fires_while_idling() {
        let manager = IOManager::new(1, false, "io-timer-test");
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        manager.timers().add_timer(
            20,
            Arc::new(move || {
                fired2.store(true, Ordering::SeqCst);
            }),
            false,
        );
        std::thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));
        manager.stop();
    }
}
