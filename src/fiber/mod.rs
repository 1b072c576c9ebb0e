//! Stackful fibers: cooperatively-scheduled, explicitly-yielding units of
//! execution, one of which (per OS thread) is always "the thread itself"
//! rather than a spawned stack.
//!
//! A [`Fiber`] moves through {[`State::Init`], [`State::Ready`],
//! [`State::Exec`], [`State::Hold`], [`State::Term`], [`State::Except`]}.
//! [`Fiber::resume`] is called by whichever thread is about to run it
//! (normally [`crate::scheduler::Scheduler`]'s dispatch loop); the fiber
//! itself yields back out with [`yield_to_hold`] or [`yield_to_ready`].
//!
//! Unlike the `ucontext`-based original, this builds on the [`context`]
//! crate's single-shot [`context::Context::resume`], which is already a
//! synchronous call/return pair. That collapses the original's four
//! switch primitives (`swapIn`/`swapOut` for ordinary worker fibers,
//! `call`/`back` for the scheduler's own "use_caller" fiber) into one:
//! whichever flow calls [`Fiber::resume`] blocks until the fiber yields or
//! terminates, full stop, whether that caller is a dedicated worker thread
//! or the thread that also runs scheduler dispatch.

pub mod stack;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use context::{Context, Transfer};

use stack::FiberStack;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// A fiber's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Built, never yet resumed.
    Init,
    /// Yielded voluntarily; eligible to run again once rescheduled.
    Hold,
    /// Currently executing (or about to be, between [`Fiber::resume`] and
    /// the trampoline taking over).
    Exec,
    /// Ran its closure to completion.
    Term,
    /// Queued to run again; equivalent to `Hold` except for what put it
    /// there (an explicit `yield_to_ready` versus a blocking wait).
    Ready,
    /// The closure panicked.
    Except,
}

type Body = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    id: u64,
    state: Cell<State>,
    stack: FiberStack,
    /// How to resume this fiber: `None` while it is `Exec` (someone else
    /// is holding the other end) or permanently after `Term`/`Except`.
    context: Cell<Option<Context>>,
    /// How to resume whoever called [`Fiber::resume`], from inside the
    /// fiber's own flow. Populated at trampoline entry and on every
    /// subsequent yield/resume round trip.
    return_context: Cell<Option<Context>>,
    body: RefCell<Option<Body>>,
}

// SAFETY: every `Cell`/`RefCell` above is touched only by whichever single
// OS thread currently owns this fiber (it is either not running, in which
// case only the scheduler thread that will next resume it touches it, or
// it is `Exec` on exactly one thread at a time - never both).
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// A stackful fiber. Cheap to clone (reference-counted); clones refer to
/// the same underlying execution state.
#[derive(Clone)]
pub struct Fiber(Arc<Shared>);

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.0.id)
            .field("state", &self.0.state.get())
            .finish()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Fiber {}

thread_local! {
    /// The fiber currently `Exec` on this OS thread, or `None` when running
    /// on the thread's own native stack (scheduler dispatch, or before any
    /// fiber has run). `Fiber::current_id` reports `0` in the `None` case,
    /// matching the original's "fiber id 0 means the root/main fiber".
    static CURRENT: RefCell<Option<Fiber>> = RefCell::new(None);
}

impl Fiber {
    /// Builds a new fiber with a freshly allocated stack. `stack_size` of
    /// `0` defers to [`crate::config::fiber_stack_size`].
    pub fn new<F>(body: F, stack_size: u32) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            crate::config::fiber_stack_size().get() as usize
        } else {
            stack_size as usize
        };
        let stack = FiberStack::new(size);
        let context = unsafe { Context::new(stack.as_context_stack(), trampoline) };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Fiber(Arc::new(Shared {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: Cell::new(State::Init),
            stack,
            context: Cell::new(Some(context)),
            return_context: Cell::new(None),
            body: RefCell::new(Some(Box::new(body))),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn state(&self) -> State {
        self.0.state.get()
    }

    /// Re-arms a `Term`/`Except` fiber with a new body, reusing its stack.
    /// This is how the scheduler avoids allocating a fresh stack for every
    /// plain-closure task it runs.
    pub fn reset<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.0.state.get();
        crate::rt_assert!(
            matches!(state, State::Term | State::Except | State::Init),
            "cannot reset fiber {} in state {:?}",
            self.0.id,
            state
        );
        let context = unsafe { Context::new(self.0.stack.as_context_stack(), trampoline) };
        self.0.context.set(Some(context));
        *self.0.body.borrow_mut() = Some(Box::new(body));
        self.0.state.set(State::Init);
    }

    /// Switches onto this fiber and blocks until it yields or terminates.
    /// Must be called with the fiber not already `Exec`.
    pub fn resume(&self) {
        let state = self.0.state.get();
        crate::rt_assert!(state != State::Exec, "fiber {} is already executing", self.0.id);
        let target = self
            .0
            .context
            .take()
            .unwrap_or_else(|| crate::log::fatal(&format!("fiber {} has no context to resume", self.0.id)));
        self.0.state.set(State::Exec);
        let previous = CURRENT.with(|c| c.borrow_mut().replace(self.clone()));
        let Transfer { context, .. } = unsafe { target.resume(0) };
        self.0.context.set(Some(context));
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let state = self.state.get();
        crate::rt_assert!(
            matches!(state, State::Term | State::Init | State::Except),
            "fiber {} dropped while in state {:?}",
            self.id,
            state
        );
    }
}

extern "C" fn trampoline(t: Transfer) -> ! {
    let fiber = CURRENT
        .with(|c| c.borrow().clone())
        .unwrap_or_else(|| crate::log::fatal("fiber trampoline entered with no current fiber set"));
    fiber.0.return_context.set(Some(t.context));

    let body = fiber
        .0
        .body
        .borrow_mut()
        .take()
        .unwrap_or_else(|| crate::log::fatal(&format!("fiber {} entered with no body", fiber.0.id)));

    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => fiber.0.state.set(State::Term),
        Err(payload) => {
            fiber.0.state.set(State::Except);
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic payload>".to_string());
            log::error!(
                "fiber {} panicked: {message}\n{bt}",
                fiber.0.id,
                bt = crate::util::backtrace_to_string()
            );
        }
    }

    swap_out(&fiber);
    crate::log::fatal(&format!("fiber {} resumed after termination", fiber.0.id));
}

/// Yields back to whoever called [`Fiber::resume`], suspending the current
/// fiber's execution at this point.
fn swap_out(fiber: &Fiber) {
    let ret = fiber
        .0
        .return_context
        .take()
        .unwrap_or_else(|| crate::log::fatal(&format!("fiber {} has no return context", fiber.0.id)));
    let Transfer { context, .. } = unsafe { ret.resume(0) };
    fiber.0.return_context.set(Some(context));
}

/// The fiber executing on the calling thread, if any.
pub fn current() -> Option<Fiber> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The id of the fiber executing on the calling thread, or `0` if running
/// on the thread's own native stack.
pub fn current_id() -> u64 {
    current().map(|f| f.id()).unwrap_or(0)
}

/// Total number of live fibers across the process.
pub fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Yields the current fiber, marking it `Hold`. Fatal if called outside a
/// running fiber, or on a fiber not currently `Exec` - both are caller
/// bugs.
pub fn yield_to_hold() {
    yield_with_state(State::Hold);
}

/// Yields the current fiber, marking it `Ready` (immediately re-runnable,
/// as opposed to waiting on some external event).
pub fn yield_to_ready() {
    yield_with_state(State::Ready);
}

fn yield_with_state(next: State) {
    let fiber = current().unwrap_or_else(|| crate::log::fatal("yield called with no running fiber"));
    crate::rt_assert!(fiber.0.state.get() == State::Exec, "yield called on a non-executing fiber");
    fiber.0.state.set(next);
    swap_out(&fiber);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_to_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let fiber = Fiber::new(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
        );
        assert_eq!(fiber.state(), State::Init);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yields_and_resumes() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let fiber = Fiber::new(
            move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                yield_to_hold();
                steps2.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
        );
        fiber.resume();
        assert_eq!(fiber.state(), State::Hold);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panic_is_isolated_as_except_state() {
        let fiber = Fiber::new(
            || {
                panic!("boom");
            },
            64 * 1024,
        );
        fiber.resume();
        assert_eq!(fiber.state(), State::Except);
    }

    #[test]
    fn reset_reuses_stack_after_termination() {
        let ran = Arc::new(AtomicUsize::new(0));
        let fiber = Fiber::new(|| {}, 64 * 1024);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        let ran2 = ran.clone();
        fiber.reset(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), State::Init);
        fiber.resume();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn current_id_is_zero_outside_any_fiber() {
        assert_eq!(current_id(), 0);
    }
}
