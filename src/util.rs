//! Small stand-alone helpers shared by the rest of the crate: a monotonic
//! millisecond clock and backtrace formatting for fatal diagnostics.

use std::time::Instant;

use once_cell::sync::Lazy;

/// Process epoch used to turn [`Instant`] into a plain `u64` millisecond
/// counter that can be stored in a timer's deadline field without carrying
/// a lifetime around.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed since the process epoch. Monotonic and unaffected
/// by suspensions, clock adjustments or leap seconds since it is backed by
/// [`Instant`].
pub fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// The kernel thread id of the calling thread (Linux `gettid`, distinct
/// from `std::thread::Thread::id()` which is a process-local handle, not
/// an OS id). Used by [`crate::scheduler`] to pin tasks to a specific
/// worker thread.
pub fn thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Formats a backtrace the way fatal diagnostics want it: one frame per
/// line, indented, with the noisy unwinder/runtime frames trimmed off the
/// top.
pub fn backtrace_to_string() -> String {
    let bt = backtrace::Backtrace::new();
    let mut out = String::new();
    for (i, frame) in bt.frames().iter().enumerate() {
        for symbol in frame.symbols() {
            let name = symbol
                .name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            out.push_str(&format!("    #{i:<3} {name}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn thread_id_differs_across_threads() {
        let main_id = thread_id();
        let spawned_id = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main_id, spawned_id);
    }
}
