//! A user-space M:N cooperative runtime: stackful fibers scheduled across
//! a small pool of OS threads, with epoll-driven non-blocking I/O and
//! deadline-ordered timers underneath.
//!
//! - [Fibers](fiber): explicit yield/resume, one stack each, isolated
//!   panics.
//! - [Scheduling](scheduler): a FIFO task queue of fibers and plain
//!   closures, dispatched across worker threads.
//! - [I/O](iomanager): `epoll`-backed readiness notification composed
//!   with the scheduler and a timer wheel.
//! - [Timers](timer): one-shot and recurring, with weak-referenced
//!   condition timers for safe cancellation-on-drop.
//! - [Configuration](config): runtime-tunable variables backed by YAML.
//! - [Logging](log): a minimal [`log::Log`] implementation plus fatal
//!   diagnostics with backtraces.
//!
//! ### Features
//!
//! - `hook` - enables [`hook`], which interposes on a handful of libc I/O
//!   calls (`read`, `write`, `connect`, `sleep`, ...) so ordinary
//!   blocking-looking code becomes non-blocking under the scheduler when
//!   `LD_PRELOAD`ed or linked in. Off by default: most users drive
//!   [`iomanager::IOManager`] directly instead.

pub mod config;
pub mod error;
mod fd;
pub mod fiber;
#[cfg(feature = "hook")]
pub mod hook;
pub mod iomanager;
pub mod log;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod timer;
pub mod util;

pub use error::{Error, Result};
pub use fiber::Fiber;
pub use iomanager::{Event, IOManager};
pub use scheduler::Scheduler;
pub use timer::{Timer, TimerManager};
