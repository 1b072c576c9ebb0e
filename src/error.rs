//! Error handling for the crate's safe-Rust API surface.
//!
//! The hook layer (see [`crate::hook`]) speaks the C convention of a
//! negative return plus `errno`, because it stands in for libc functions.
//! Everything else - [`crate::fiber`], [`crate::scheduler`],
//! [`crate::timer`], [`crate::iomanager`] - returns [`Result`] so callers
//! get `?`-composable errors instead of having to inspect `errno`.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("event {0:?} is already registered on fd {1}")]
    EventAlreadyRegistered(crate::fd::Event, std::os::raw::c_int),

    #[error("scheduler is stopping, no new work accepted")]
    SchedulerStopped,

    #[error("epoll_ctl failed: {0}")]
    EpollCtl(io::Error),
}
