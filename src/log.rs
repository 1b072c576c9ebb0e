//! Logging sink and the fatal-assertion path.
//!
//! The runtime logs through the [`log`](https://docs.rs/log) facade like
//! every other module in the crate; any sink a caller installs via
//! `log::set_logger` works. [`install`] provides a minimal default sink
//! (stderr) so the runtime is usable without the caller wiring one up,
//! mirroring the crate's own five levels {DEBUG, INFO, WARN, ERROR, FATAL}
//! onto [`log::Level`] (FATAL has no direct `log::Level` counterpart: it
//! logs at `Error` and then aborts the process).

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Minimal stderr sink: `{level} {thread} {target} - {message}`.
pub struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");
        let mut stderr = std::io::stderr();
        let _ = writeln!(
            stderr,
            "{level:<5} [{thread}] {target} - {msg}",
            level = record.level(),
            thread = thread_name,
            target = record.target(),
            msg = record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: StderrLogger = StderrLogger;

/// Installs the default stderr sink at the given max level. Idempotent:
/// later calls are no-ops, matching the original runtime's one-shot
/// logger initialization.
pub fn install(level: LevelFilter) {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    // A caller may have already installed their own `log::Log`
    // implementation before we get here; respect that instead of panicking.
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Logs `message` at ERROR with a captured backtrace, then aborts the
/// process. Used for invariant violations: fiber destroyed while
/// non-terminal, duplicate event registration, scheduling onto a stopped
/// scheduler, two schedulers claiming the same caller thread, and so on.
/// These represent bugs in the caller, not recoverable runtime errors.
#[track_caller]
pub fn fatal(message: &str) -> ! {
    let location = std::panic::Location::caller();
    log::error!(
        "FATAL at {file}:{line}: {message}\n{bt}",
        file = location.file(),
        line = location.line(),
        message = message,
        bt = crate::util::backtrace_to_string(),
    );
    std::process::abort();
}

/// Same as [`fatal`] but formats a wrapped error/poison value alongside
/// the message; used by [`crate::sync`] when a lock is found poisoned.
#[track_caller]
pub fn fatal_unreachable<T: fmt::Debug>(message: &str, cause: &T) -> ! {
    fatal(&format!("{message}: {cause:?}"))
}

/// Asserts `cond`, logging a FATAL diagnostic and aborting if it doesn't
/// hold. The Rust analogue of the original's `APOLLO_ASSERT` macro.
#[macro_export]
macro_rules! rt_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::log::fatal(concat!("assertion failed: ", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::log::fatal(&format!(
                "assertion failed: {} ({})",
                stringify!($cond),
                format_args!($($arg)+)
            ));
        }
    };
}
