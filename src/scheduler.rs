//! M:N task scheduler: `N` OS threads (plus, optionally, the thread that
//! constructed the scheduler) pulling work off one FIFO queue of fibers
//! and plain closures.
//!
//! [`SchedulerHooks`] stands in for the original's `tickle`/`stopping`/
//! `idle` virtual methods - there is no subclassing here, so
//! [`crate::iomanager::IOManager`] supplies its own epoll-aware hooks at
//! construction time instead of inheriting and overriding. A plain
//! [`Scheduler`] gets [`DefaultHooks`], whose `idle` just parks the idle
//! fiber in a yield loop until the scheduler is asked to stop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::fiber::{self, Fiber, State as FiberState};
use crate::sync::Mutex;
use crate::thread::Thread;

/// Hooks a [`Scheduler`] calls out to at the points the original let a
/// subclass override. All have sensible defaults; only `idle` is worth
/// overriding in practice (to block on something other than "yield and
/// check again").
pub trait SchedulerHooks: Send + Sync {
    /// Wakes up a thread blocked in [`SchedulerHooks::idle`] because new
    /// work is available. Called with the scheduler's queue already
    /// unlocked, so it's safe to call back into `scheduler`.
    fn tickle(&self, scheduler: &Scheduler) {
        let _ = scheduler;
        log::trace!("tickle");
    }

    /// An additional condition [`Scheduler::is_stopping`] ANDs onto its
    /// own base checks (queue empty, no active tasks, stop requested).
    fn stopping(&self, scheduler: &Scheduler) -> bool {
        let _ = scheduler;
        true
    }

    /// Runs as a fiber whenever a worker thread finds no runnable task.
    /// Must eventually return once `scheduler.is_stopping()` holds, or
    /// the scheduler can never shut down.
    fn idle(&self, scheduler: &Scheduler) {
        while !scheduler.is_stopping() {
            fiber::yield_to_hold();
        }
    }
}

/// The hooks used by a [`Scheduler`] built without custom behavior.
pub struct DefaultHooks;
impl SchedulerHooks for DefaultHooks {}

enum Work {
    Fiber(Fiber),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct Task {
    work: Work,
    /// `Some(tid)` pins this task to one OS thread (by the id
    /// [`crate::util::thread_id`] reports); `None` means any worker may
    /// take it.
    thread: Option<i32>,
}

struct Inner {
    name: String,
    hooks: Arc<dyn SchedulerHooks>,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    thread_count: usize,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    /// OS thread id of the thread that constructed the scheduler with
    /// `use_caller = true`, or `-1` if it was built without one.
    root_thread: i32,
    root_fiber: Mutex<Option<Fiber>>,
}

/// A task scheduler. Cheap to clone; clones share the same queue and
/// worker pool.
#[derive(Clone)]
pub struct Scheduler(Arc<Inner>);

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("name", &self.0.name).finish()
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Scheduler {}

thread_local! {
    static CURRENT: RefCell<Option<Scheduler>> = RefCell::new(None);
}

impl Scheduler {
    /// Builds a scheduler with `threads` total workers. If `use_caller` is
    /// set, the constructing thread counts as one of them (it must later
    /// call [`Scheduler::stop`] itself to drive its share of the work).
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>, hooks: Arc<dyn SchedulerHooks>) -> Scheduler {
        crate::rt_assert!(threads > 0, "scheduler must have at least one thread");
        let name = name.into();
        let mut worker_threads = threads;
        let mut root_thread = -1;

        if use_caller {
            worker_threads -= 1;
            crate::rt_assert!(Scheduler::current().is_none(), "a scheduler is already active on this thread");
            root_thread = crate::util::thread_id();
        }

        let inner = Arc::new(Inner {
            name: name.clone(),
            hooks,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count: worker_threads,
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_thread,
            root_fiber: Mutex::new(None),
        });
        let scheduler = Scheduler(inner);

        if use_caller {
            let s = scheduler.clone();
            let root_fiber = Fiber::new(move || s.run_body(), 0);
            *scheduler.0.root_fiber.lock() = Some(root_fiber);
            CURRENT.with(|c| *c.borrow_mut() = Some(scheduler.clone()));
            crate::thread::set_current_name(name);
        }
        scheduler
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The scheduler active on the calling thread, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// A stable identity for this scheduler, usable as a map key. Used by
    /// [`crate::iomanager::IOManager`] to recover "the IOManager running
    /// on this thread" from "the scheduler running on this thread".
    pub(crate) fn ptr_key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn has_idle_threads(&self) -> bool {
        self.0.idle_count.load(Ordering::SeqCst) > 0
    }

    pub fn pending_tasks(&self) -> usize {
        self.0.queue.lock().len()
    }

    fn base_stopping(&self) -> bool {
        self.0.auto_stop.load(Ordering::SeqCst)
            && self.0.stopping.load(Ordering::SeqCst)
            && self.0.queue.lock().is_empty()
            && self.0.active_count.load(Ordering::SeqCst) == 0
    }

    /// Whether the scheduler is ready to shut down: the base queue/active
    /// conditions hold, and the hooks agree (e.g. an `IOManager` also
    /// requires no pending timers or I/O events).
    pub fn is_stopping(&self) -> bool {
        self.base_stopping() && self.0.hooks.stopping(self)
    }

    fn tickle(&self) {
        self.0.hooks.tickle(self);
    }

    pub fn schedule<F: FnOnce() + Send + 'static>(&self, cb: F) {
        self.schedule_on(cb, None);
    }

    pub fn schedule_on<F: FnOnce() + Send + 'static>(&self, cb: F, thread: Option<i32>) {
        self.push_task(Task { work: Work::Callback(Box::new(cb)), thread });
    }

    pub fn schedule_fiber(&self, fiber: Fiber) {
        self.schedule_fiber_on(fiber, None);
    }

    pub fn schedule_fiber_on(&self, fiber: Fiber, thread: Option<i32>) {
        self.push_task(Task { work: Work::Fiber(fiber), thread });
    }

    /// Batch-schedules a run of timer callbacks, tickling at most once for
    /// the whole batch (matching the single-tickle behavior of scheduling
    /// an iterator range in the original).
    pub fn schedule_callbacks<I>(&self, cbs: I)
    where
        I: IntoIterator<Item = crate::timer::Callback>,
    {
        let mut pushed_any = false;
        let need_tickle = {
            let mut q = self.0.queue.lock();
            let was_empty = q.is_empty();
            for cb in cbs {
                q.push_back(Task {
                    work: Work::Callback(Box::new(move || cb())),
                    thread: None,
                });
                pushed_any = true;
            }
            was_empty && pushed_any
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn push_task(&self, task: Task) {
        let need_tickle = {
            let mut q = self.0.queue.lock();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Spawns the configured worker threads. A no-op if already started.
    pub fn start(&self) {
        if !self.0.stopping.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.0.threads.lock();
        crate::rt_assert!(threads.is_empty(), "scheduler already started");
        for i in 0..self.0.thread_count {
            let s = self.clone();
            let t = Thread::spawn(format!("{}_{}", self.0.name, i), move || s.run_body());
            threads.push(t);
        }
    }

    /// Requests shutdown and blocks until every worker thread (and, if
    /// this scheduler uses the caller thread, its root fiber) has
    /// finished running.
    pub fn stop(&self) {
        self.0.auto_stop.store(true, Ordering::SeqCst);

        let root_already_idle = {
            let root = self.0.root_fiber.lock();
            self.0.thread_count == 0
                && matches!(root.as_ref().map(Fiber::state), Some(FiberState::Init) | Some(FiberState::Term))
        };
        if root_already_idle {
            self.0.stopping.store(true, Ordering::SeqCst);
            if self.is_stopping() {
                return;
            }
        }

        if self.0.root_thread != -1 {
            crate::rt_assert!(Scheduler::current().as_ref() == Some(self), "stop() called off the scheduler's own caller thread");
        } else {
            crate::rt_assert!(Scheduler::current().as_ref() != Some(self), "stop() must not run on one of the scheduler's own worker threads");
        }

        self.0.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.0.thread_count {
            self.tickle();
        }

        let root_fiber = self.0.root_fiber.lock().clone();
        if let Some(root_fiber) = root_fiber {
            self.tickle();
            if !self.is_stopping() {
                root_fiber.resume();
            }
        }

        let threads = std::mem::take(&mut *self.0.threads.lock());
        for mut t in threads {
            t.join();
        }
    }

    /// Picks the next task this thread may run: skips tasks pinned to a
    /// different OS thread and fibers already `Exec` elsewhere. Returns
    /// whether other workers should be tickled because something was
    /// skipped or claimed.
    fn pop_runnable_task(&self) -> (Option<Task>, bool) {
        let my_tid = crate::util::thread_id();
        let mut q = self.0.queue.lock();
        let mut tickle_me = false;
        let mut chosen = None;
        for (i, t) in q.iter().enumerate() {
            if let Some(thread) = t.thread {
                if thread != my_tid {
                    tickle_me = true;
                    continue;
                }
            }
            if let Work::Fiber(f) = &t.work {
                if f.state() == FiberState::Exec {
                    continue;
                }
            }
            chosen = Some(i);
            break;
        }
        let task = chosen.map(|i| q.remove(i).expect("index was just located"));
        if task.is_some() {
            tickle_me = true;
            self.0.active_count.fetch_add(1, Ordering::SeqCst);
        }
        (task, tickle_me)
    }

    /// The dispatch loop run by every worker thread (and the root fiber,
    /// if any). Exits once the idle fiber itself terminates, which only
    /// happens once [`Scheduler::is_stopping`] holds.
    fn run_body(&self) {
        log::debug!("scheduler '{}' dispatch loop starting", self.0.name);
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));

        let idle_fiber = {
            let s = self.clone();
            Fiber::new(move || s.0.hooks.idle(&s), 0)
        };
        let mut cb_fiber: Option<Fiber> = None;

        loop {
            let (task, tickle_me) = self.pop_runnable_task();
            if tickle_me {
                self.tickle();
            }

            let Some(task) = task else {
                if idle_fiber.state() == FiberState::Term {
                    log::info!("scheduler '{}' idle fiber terminated, stopping dispatch", self.0.name);
                    break;
                }
                self.0.idle_count.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                self.0.idle_count.fetch_sub(1, Ordering::SeqCst);
                continue;
            };

            match task.work {
                Work::Fiber(fiber) => {
                    if !matches!(fiber.state(), FiberState::Except | FiberState::Term) {
                        fiber.resume();
                        if fiber.state() == FiberState::Ready {
                            self.schedule_fiber(fiber);
                        }
                    } else {
                        log::warn!("scheduler '{}' dropped a task fiber already in {:?}", self.0.name, fiber.state());
                    }
                    self.0.active_count.fetch_sub(1, Ordering::SeqCst);
                }
                Work::Callback(cb) => {
                    let fiber = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb, 0),
                    };
                    fiber.resume();
                    self.0.active_count.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.schedule_fiber(fiber),
                        FiberState::Term | FiberState::Except => cb_fiber = Some(fiber),
                        _ => {}
                    }
                }
            }
        }
    }
}
