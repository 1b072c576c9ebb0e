//! Deadline-ordered timers.
//!
//! A [`TimerManager`] keeps every live [`Timer`] in a set ordered by
//! `(deadline, id)`, the id breaking ties between timers scheduled for the
//! exact same millisecond (the original used the `Timer`'s pointer address
//! for this; an incrementing id gives the same total order without
//! leaning on address stability). [`TimerManager::list_expired_cbs`] is
//! the scheduler-facing drain: pull every timer whose deadline has
//! passed, re-arm the recurring ones, and hand back their callbacks to
//! run.
//!
//! Unlike `std::function`, a Rust closure captured by value can't be
//! copied, so a recurring timer's callback is stored as `Arc<dyn Fn()>`
//! rather than `FnOnce` - it needs to run again next period, not just
//! once.
//!
//! [`crate::iomanager::IOManager`] owns one `TimerManager` and supplies
//! `on_insert_at_front` as a closure that tickles its epoll loop, playing
//! the role the original's pure-virtual `onTimerInsertAtFront` played for
//! a subclass.

use std::any::Any;
use std::collections::BTreeSet;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use crate::sync::{Mutex, RwLock};

/// A timer callback. `Arc`-shared (not `Box<dyn FnOnce()>`) because a
/// recurring timer runs the same callback every period.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    next: AtomicU64,
    ms: AtomicU64,
    recurring: bool,
    cb: Mutex<Option<Callback>>,
    manager: Weak<State>,
}

impl PartialEq for Inner {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Inner {}

impl PartialOrd for Inner {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Inner {
    fn cmp(&self, other: &Self) -> Ordering {
        self.next
            .load(AtomicOrdering::Relaxed)
            .cmp(&other.next.load(AtomicOrdering::Relaxed))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A handle to a scheduled timer. Cloning shares the same underlying
/// timer; cancelling/resetting through any clone affects all of them.
#[derive(Clone)]
pub struct Timer(Arc<Inner>);

impl Timer {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Cancels the timer. Returns `false` if it already fired or was
    /// already cancelled, or if its manager no longer exists.
    pub fn cancel(&self) -> bool {
        let Some(state) = self.0.manager.upgrade() else {
            return false;
        };
        let mut cb = self.0.cb.lock();
        if cb.take().is_none() {
            return false;
        }
        drop(cb);
        state.timers.write().remove(&self.0);
        true
    }

    /// Re-arms the timer for `ms` milliseconds from now, keeping its
    /// original period. Returns `false` if the timer already fired.
    pub fn refresh(&self) -> bool {
        let Some(state) = self.0.manager.upgrade() else {
            return false;
        };
        if self.0.cb.lock().is_none() {
            return false;
        }
        if !state.timers.write().remove(&self.0) {
            return false;
        }
        let now = crate::util::now_ms();
        self.0.next.store(now + self.0.ms.load(AtomicOrdering::Relaxed), AtomicOrdering::Relaxed);
        state.insert(self.0.clone());
        true
    }

    /// Changes the timer's period to `ms`. If `from_now` is set the new
    /// deadline is `now + ms`; otherwise it's computed relative to the
    /// timer's original start so a timer that's already partway through
    /// its current period doesn't get a full extra `ms` tacked on.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let old_ms = self.0.ms.load(AtomicOrdering::Relaxed);
        if ms == old_ms && !from_now {
            return true;
        }
        let Some(state) = self.0.manager.upgrade() else {
            return false;
        };
        if self.0.cb.lock().is_none() {
            return false;
        }
        if !state.timers.write().remove(&self.0) {
            return false;
        }
        let start = if from_now {
            crate::util::now_ms()
        } else {
            self.0.next.load(AtomicOrdering::Relaxed) - old_ms
        };
        self.0.ms.store(ms, AtomicOrdering::Relaxed);
        self.0.next.store(start + ms, AtomicOrdering::Relaxed);
        state.insert(self.0.clone());
        true
    }
}

struct State {
    timers: RwLock<BTreeSet<Arc<Inner>>>,
    tickled: AtomicBool,
    on_insert_at_front: Box<dyn Fn() + Send + Sync>,
}

impl State {
    /// Inserts `item` and, if it landed at the front of the set and we
    /// haven't already told the caller about a front-insertion since the
    /// last [`TimerManager::get_next_timer`] call, invokes
    /// `on_insert_at_front` - outside the lock, matching the original's
    /// unlock-then-notify ordering so the hook is free to call back into
    /// the manager (e.g. `has_timer`) without deadlocking.
    fn insert(&self, item: Arc<Inner>) {
        let mut fire = false;
        {
            let mut set = self.timers.write();
            set.insert(item.clone());
            let is_front = set.iter().next().map(|f| Arc::ptr_eq(f, &item)).unwrap_or(false);
            if is_front && !self.tickled.swap(true, AtomicOrdering::SeqCst) {
                fire = true;
            }
        }
        if fire {
            (self.on_insert_at_front)();
        }
    }
}

/// An ordered collection of timers, shared cheaply via an internal `Arc`.
#[derive(Clone)]
pub struct TimerManager {
    state: Arc<State>,
}

impl TimerManager {
    /// `on_insert_at_front` is called whenever a newly added timer becomes
    /// the soonest-due one, so the owner can wake up whatever is currently
    /// blocked waiting for the previous soonest deadline.
    pub fn new<F>(on_insert_at_front: F) -> TimerManager
    where
        F: Fn() + Send + Sync + 'static,
    {
        TimerManager {
            state: Arc::new(State {
                timers: RwLock::new(BTreeSet::new()),
                tickled: AtomicBool::new(false),
                on_insert_at_front: Box::new(on_insert_at_front),
            }),
        }
    }

    /// Schedules `cb` to run `ms` milliseconds from now, once or on a
    /// repeating `ms`-period depending on `recurring`.
    pub fn add_timer(&self, ms: u64, cb: Callback, recurring: bool) -> Timer {
        let now = crate::util::now_ms();
        let inner = Arc::new(Inner {
            id: NEXT_TIMER_ID.fetch_add(1, AtomicOrdering::Relaxed),
            next: AtomicU64::new(now + ms),
            ms: AtomicU64::new(ms),
            recurring,
            cb: Mutex::new(Some(cb)),
            manager: Arc::downgrade(&self.state),
        });
        self.state.insert(inner.clone());
        Timer(inner)
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` only runs if
    /// `weak_cond` can still be upgraded at the time the timer fires -
    /// the timer equivalent of a weak-referenced liveness check, so a
    /// timer outliving the object it was scheduled on behalf of becomes a
    /// silent no-op instead of a use-after-free.
    pub fn add_condition_timer(
        &self,
        ms: u64,
        cb: Callback,
        weak_cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer {
        let wrapped: Callback = Arc::new(move || {
            if weak_cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, wrapped, recurring)
    }

    /// Milliseconds until the next timer fires: `0` if one is already
    /// due, `u64::MAX` if there are none at all. Clears the front-insert
    /// notification flag, so a timer inserted after this call (and before
    /// the caller goes back to sleep) is guaranteed to trigger another
    /// `on_insert_at_front` call if it lands at the front.
    pub fn get_next_timer(&self) -> u64 {
        let set = self.state.timers.read();
        self.state.tickled.store(false, AtomicOrdering::SeqCst);
        match set.iter().next() {
            None => u64::MAX,
            Some(t) => {
                let now = crate::util::now_ms();
                let next = t.next.load(AtomicOrdering::Relaxed);
                if next <= now {
                    0
                } else {
                    next - now
                }
            }
        }
    }

    /// Drains every timer due by now, returning their callbacks in
    /// deadline order. Recurring timers are re-armed for another period
    /// before this returns; one-shot timers are dropped from the set and
    /// have their callback cleared.
    pub fn list_expired_cbs(&self) -> Vec<Callback> {
        let now = crate::util::now_ms();
        {
            let set = self.state.timers.read();
            match set.iter().next() {
                None => return Vec::new(),
                Some(t) if t.next.load(AtomicOrdering::Relaxed) > now => return Vec::new(),
                _ => {}
            }
        }

        let mut expired = Vec::new();
        {
            let mut set = self.state.timers.write();
            loop {
                let due = matches!(set.iter().next(), Some(t) if t.next.load(AtomicOrdering::Relaxed) <= now);
                if !due {
                    break;
                }
                expired.push(set.pop_first().expect("just observed a due timer"));
            }
        }

        let mut cbs = Vec::with_capacity(expired.len());
        let mut to_reinsert = Vec::new();
        for item in expired {
            if let Some(cb) = item.cb.lock().clone() {
                cbs.push(cb);
            }
            if item.recurring {
                item.next.store(now + item.ms.load(AtomicOrdering::Relaxed), AtomicOrdering::Relaxed);
                to_reinsert.push(item);
            } else {
                *item.cb.lock() = None;
            }
        }
        if !to_reinsert.is_empty() {
            let mut set = self.state.timers.write();
            for item in to_reinsert {
                set.insert(item);
            }
        }
        cbs
    }

    pub fn has_timer(&self) -> bool {
        !self.state.timers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> TimerManager {
        TimerManager::new(|| {})
    }

    #[test]
    fn expired_timers_are_ordered_by_deadline() {
        let mgr = manager();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, ms) in [(1u32, 30u64), (2, 10), (3, 20)] {
            let order = order.clone();
            mgr.add_timer(ms, Arc::new(move || order.lock().push(i)), false);
        }
        std::thread::sleep(std::time::Duration::from_millis(40));
        let cbs = mgr.list_expired_cbs();
        assert_eq!(cbs.len(), 3);
        for cb in cbs {
            cb();
        }
        assert_eq!(*order.lock(), vec![2, 3, 1]);
    }

    #[test]
    fn recurring_timer_is_rearmed() {
        let mgr = manager();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires2 = fires.clone();
        mgr.add_timer(5, Arc::new(move || { fires2.fetch_add(1, AtomicOrdering::SeqCst); }), true);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(mgr.list_expired_cbs().len(), 1);
        assert!(mgr.has_timer());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(mgr.list_expired_cbs().len(), 1);
    }

    #[test]
    fn cancel_removes_timer() {
        let mgr = manager();
        let t = mgr.add_timer(5, Arc::new(|| {}), false);
        assert!(t.cancel());
        assert!(!t.cancel());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(mgr.list_expired_cbs().is_empty());
    }

    #[test]
    fn condition_timer_skips_callback_if_condition_dropped() {
        let mgr = manager();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let cond: Arc<()> = Arc::new(());
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&cond);
        mgr.add_condition_timer(5, Arc::new(move || { ran2.fetch_add(1, AtomicOrdering::SeqCst); }), weak, false);
        drop(cond);
        std::thread::sleep(std::time::Duration::from_millis(10));
        for cb in mgr.list_expired_cbs() {
            cb();
        }
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn next_timer_reports_zero_when_due() {
        let mgr = manager();
        assert_eq!(mgr.get_next_timer(), u64::MAX);
        mgr.add_timer(0, Arc::new(|| {}), false);
        assert_eq!(mgr.get_next_timer(), 0);
    }
}
