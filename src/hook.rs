//! libc symbol interposition: once enabled on a thread, blocking-looking
//! calls like `read`, `connect`, or `sleep` transparently register with
//! the active [`crate::iomanager::IOManager`] and yield the calling fiber
//! instead of blocking the OS thread.
//!
//! Each hooked symbol resolves its real libc implementation once via
//! `dlsym(RTLD_NEXT, ...)` and falls straight through to it whenever hooks
//! are disabled on the calling thread, or the fd in question isn't a
//! socket, or the caller already asked for non-blocking behavior
//! themselves. Only linked in behind the `hook` feature - this is process-
//! wide interposition, not something `cargo test` should be exposed to.
//!
//! `fcntl`/`ioctl` are genuinely variadic in C; stably defining a variadic
//! `extern "C" fn` isn't possible outside nightly Rust. Both are narrowed
//! here to the one argument shape this runtime's own hooks ever pass
//! (`F_SETFL`/`F_GETFL` with a plain `int`, `FIONBIO` with an `int*`),
//! which is also the only shape that needs hook-aware handling - anything
//! else falls through to the real function unexamined.

use std::any::Any;
use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Once, Weak};

use libc::{c_char, msghdr, iovec, size_t, sockaddr, socklen_t, ssize_t, timespec};
use once_cell::sync::{Lazy, OnceCell};

use crate::fd::Event;
use crate::iomanager::IOManager;
use crate::sync::RwLock;

thread_local! {
    static HOOK_ENABLED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

/// Whether hooked calls on the current thread should go through the
/// scheduler instead of the real libc function.
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|f| f.get())
}

pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|f| f.set(enabled));
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(value: c_int) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

macro_rules! real_fn {
    ($fn_name:ident, $sym:literal, $ty:ty) => {
        fn $fn_name() -> $ty {
            static CELL: OnceCell<$ty> = OnceCell::new();
            *CELL.get_or_init(|| unsafe {
                let addr = libc::dlsym(libc::RTLD_NEXT, concat!($sym, "\0").as_ptr() as *const c_char);
                if addr.is_null() {
                    crate::log::fatal(concat!("dlsym(RTLD_NEXT, \"", $sym, "\") returned null"));
                }
                std::mem::transmute::<*mut c_void, $ty>(addr)
            })
        }
    };
}

real_fn!(sleep_f, "sleep", extern "C" fn(libc::c_uint) -> libc::c_uint);
real_fn!(usleep_f, "usleep", extern "C" fn(libc::useconds_t) -> c_int);
real_fn!(nanosleep_f, "nanosleep", extern "C" fn(*const timespec, *mut timespec) -> c_int);
real_fn!(socket_f, "socket", extern "C" fn(c_int, c_int, c_int) -> c_int);
real_fn!(connect_f, "connect", extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int);
real_fn!(accept_f, "accept", extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int);
real_fn!(read_f, "read", extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t);
real_fn!(readv_f, "readv", extern "C" fn(c_int, *const iovec, c_int) -> ssize_t);
real_fn!(recv_f, "recv", extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t);
real_fn!(
    recvfrom_f,
    "recvfrom",
    extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t
);
real_fn!(recvmsg_f, "recvmsg", extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t);
real_fn!(write_f, "write", extern "C" fn(c_int, *const c_void, size_t) -> ssize_t);
real_fn!(writev_f, "writev", extern "C" fn(c_int, *const iovec, c_int) -> ssize_t);
real_fn!(send_f, "send", extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t);
real_fn!(
    sendto_f,
    "sendto",
    extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t
);
real_fn!(sendmsg_f, "sendmsg", extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t);
real_fn!(close_f, "close", extern "C" fn(c_int) -> c_int);
real_fn!(fcntl_f, "fcntl", extern "C" fn(c_int, c_int, c_int) -> c_int);
real_fn!(ioctl_f, "ioctl", extern "C" fn(c_int, libc::c_ulong, *mut c_void) -> c_int);
real_fn!(
    getsockopt_f,
    "getsockopt",
    extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int
);
real_fn!(
    setsockopt_f,
    "setsockopt",
    extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int
);

#[derive(Clone, Copy, PartialEq, Eq)]
enum TimeoutKind {
    Recv,
    Send,
}

struct FdCtx {
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket =
            unsafe { libc::fstat(fd, &mut stat) } == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let ctx = FdCtx {
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
        };

        if is_socket {
            let flags = fcntl_f()(fd, libc::F_GETFL, 0);
            if flags & libc::O_NONBLOCK == 0 {
                fcntl_f()(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            ctx.sys_nonblock.store(true, Ordering::SeqCst);
        }
        ctx
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::SeqCst);
    }

    fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    fn set_timeout(&self, which: TimeoutKind, ms: i64) {
        match which {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::SeqCst),
        }
    }

    fn timeout(&self, which: TimeoutKind) -> u64 {
        let ms = match which {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::SeqCst),
        };
        if ms < 0 {
            u64::MAX
        } else {
            ms as u64
        }
    }
}

static FD_TABLE: Lazy<RwLock<HashMap<RawFd, Arc<FdCtx>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

fn fd_get(fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
    if let Some(ctx) = FD_TABLE.read().get(&fd) {
        return Some(ctx.clone());
    }
    if !auto_create {
        return None;
    }
    let mut table = FD_TABLE.write();
    if let Some(ctx) = table.get(&fd) {
        return Some(ctx.clone());
    }
    let ctx = Arc::new(FdCtx::new(fd));
    table.insert(fd, ctx.clone());
    Some(ctx)
}

fn fd_del(fd: RawFd) {
    FD_TABLE.write().remove(&fd);
}

#[derive(Default)]
struct TimerInfo {
    cancelled: std::sync::atomic::AtomicI32,
}

/// The generic retry-on-`EAGAIN` wrapper every blocking I/O hook goes
/// through: call the real function, and if it would block, register for
/// readiness (with an optional timeout) and yield instead of returning
/// `EWOULDBLOCK` to the caller.
fn do_io<F>(fd: RawFd, hook_name: &str, event: Event, timeout_kind: TimeoutKind, mut op: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() {
        return op();
    }
    let Some(ctx) = fd_get(fd, false) else {
        return op();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket || ctx.user_nonblock() {
        return op();
    }
    let timeout = ctx.timeout(timeout_kind);

    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        let Some(iom) = IOManager::current() else {
            return n;
        };

        let info = Arc::new(TimerInfo::default());
        let weak_info: Weak<TimerInfo> = Arc::downgrade(&info);
        let weak_dyn: Weak<dyn Any + Send + Sync> = weak_info.clone();

        let timer = if timeout != u64::MAX {
            let iom2 = iom.clone();
            Some(iom.timers().add_condition_timer(
                timeout,
                Arc::new(move || {
                    if let Some(info) = weak_info.upgrade() {
                        info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                        iom2.cancel_event(fd, event);
                    }
                }),
                weak_dyn,
                false,
            ))
        } else {
            None
        };

        if iom.add_event(fd, event).is_err() {
            log::error!("{hook_name}: add_event({fd}, {event:?}) failed");
            if let Some(t) = &timer {
                t.cancel();
            }
            return -1;
        }

        crate::fiber::yield_to_hold();
        if let Some(t) = &timer {
            t.cancel();
        }

        let cancelled = info.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
    }
}

fn hooked_sleep_ms(ms: u64) {
    let Some(iom) = IOManager::current() else {
        return;
    };
    let fiber = crate::fiber::current().unwrap_or_else(|| crate::log::fatal("sleep hook invoked with no running fiber"));
    let scheduler = iom.scheduler().clone();
    iom.timers().add_timer(
        ms,
        Arc::new(move || {
            scheduler.schedule_fiber(fiber.clone());
        }),
        false,
    );
    crate::fiber::yield_to_hold();
}

#[no_mangle]
pub extern "C" fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if !is_hook_enabled() {
        return sleep_f()(seconds);
    }
    hooked_sleep_ms(seconds as u64 * 1000);
    0
}

#[no_mangle]
pub extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    if !is_hook_enabled() {
        return usleep_f()(usec);
    }
    hooked_sleep_ms(usec as u64 / 1000);
    0
}

#[no_mangle]
pub extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !is_hook_enabled() {
        return nanosleep_f()(req, rem);
    }
    let req = unsafe { &*req };
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    hooked_sleep_ms(ms);
    0
}

#[no_mangle]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !is_hook_enabled() {
        return socket_f()(domain, ty, protocol);
    }
    let fd = socket_f()(domain, ty, protocol);
    if fd != -1 {
        fd_get(fd, true);
    }
    fd
}

fn connect_with_timeout(fd: RawFd, addr: *const sockaddr, addrlen: socklen_t, timeout_ms: u64) -> c_int {
    if !is_hook_enabled() {
        return connect_f()(fd, addr, addrlen);
    }
    let Some(ctx) = fd_get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket || ctx.user_nonblock() {
        return connect_f()(fd, addr, addrlen);
    }

    let n = connect_f()(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IOManager::current() else {
        return n;
    };

    let info = Arc::new(TimerInfo::default());
    let weak_info: Weak<TimerInfo> = Arc::downgrade(&info);
    let weak_dyn: Weak<dyn Any + Send + Sync> = weak_info.clone();

    let timer = if timeout_ms != u64::MAX {
        let iom2 = iom.clone();
        Some(iom.timers().add_condition_timer(
            timeout_ms,
            Arc::new(move || {
                if let Some(info) = weak_info.upgrade() {
                    info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    iom2.cancel_event(fd, Event::WRITE);
                }
            }),
            weak_dyn,
            false,
        ))
    } else {
        None
    };

    if iom.add_event(fd, Event::WRITE).is_ok() {
        crate::fiber::yield_to_hold();
        if let Some(t) = &timer {
            t.cancel();
        }
        if info.cancelled.load(Ordering::SeqCst) != 0 {
            set_errno(info.cancelled.load(Ordering::SeqCst));
            return -1;
        }
    } else {
        if let Some(t) = &timer {
            t.cancel();
        }
        log::error!("connect: add_event({fd}, WRITE) failed");
    }

    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if unsafe { libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut error as *mut _ as *mut c_void, &mut len) } == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Lock-free mirror of `tcp.connect.timeout`, kept in sync by a listener
/// subscribed the first time a hooked `connect` runs. `connect` is on every
/// fiber's hot path that dials out, so it reads this atomic directly
/// instead of taking `ConfigVar`'s `RwLock` read lock on every call.
static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(5000);
static CONNECT_TIMEOUT_MIRROR_INIT: Once = Once::new();

fn connect_timeout_ms() -> i64 {
    CONNECT_TIMEOUT_MIRROR_INIT.call_once(|| {
        let var = crate::config::tcp_connect_timeout();
        CONNECT_TIMEOUT_MS.store(var.get(), Ordering::SeqCst);
        var.add_listener(|_old, new| {
            CONNECT_TIMEOUT_MS.store(*new, Ordering::SeqCst);
        });
    });
    CONNECT_TIMEOUT_MS.load(Ordering::SeqCst)
}

#[no_mangle]
pub extern "C" fn connect(sockfd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    let timeout = connect_timeout_ms();
    connect_with_timeout(sockfd, addr, addrlen, timeout.max(0) as u64)
}

#[no_mangle]
pub extern "C" fn accept(s: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(s, "accept", Event::READ, TimeoutKind::Recv, || accept_f()(s, addr, addrlen) as ssize_t) as c_int;
    if fd >= 0 {
        fd_get(fd, true);
    }
    fd
}

#[no_mangle]
pub extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || read_f()(fd, buf, count))
}

#[no_mangle]
pub extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || readv_f()(fd, iov, iovcnt))
}

#[no_mangle]
pub extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", Event::READ, TimeoutKind::Recv, || recv_f()(sockfd, buf, len, flags))
}

#[no_mangle]
pub extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        recvfrom_f()(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

#[no_mangle]
pub extern "C" fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", Event::READ, TimeoutKind::Recv, || recvmsg_f()(sockfd, msg, flags))
}

#[no_mangle]
pub extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || write_f()(fd, buf, count))
}

#[no_mangle]
pub extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || writev_f()(fd, iov, iovcnt))
}

#[no_mangle]
pub extern "C" fn send(s: c_int, msg: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(s, "send", Event::WRITE, TimeoutKind::Send, || send_f()(s, msg, len, flags))
}

#[no_mangle]
pub extern "C" fn sendto(
    s: c_int,
    msg: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(s, "sendto", Event::WRITE, TimeoutKind::Send, || sendto_f()(s, msg, len, flags, to, tolen))
}

#[no_mangle]
pub extern "C" fn sendmsg(s: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(s, "sendmsg", Event::WRITE, TimeoutKind::Send, || sendmsg_f()(s, msg, flags))
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return close_f()(fd);
    }
    if fd_get(fd, false).is_some() {
        if let Some(iom) = IOManager::current() {
            iom.cancel_all(fd);
        }
        fd_del(fd);
    }
    close_f()(fd)
}

#[no_mangle]
pub extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = fd_get(fd, false) else {
                return fcntl_f()(fd, cmd, arg);
            };
            if ctx.is_closed() || !ctx.is_socket {
                return fcntl_f()(fd, cmd, arg);
            }
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let effective = if ctx.sys_nonblock() { arg | libc::O_NONBLOCK } else { arg & !libc::O_NONBLOCK };
            fcntl_f()(fd, cmd, effective)
        }
        libc::F_GETFL => {
            let result = fcntl_f()(fd, cmd, 0);
            let Some(ctx) = fd_get(fd, false) else {
                return result;
            };
            if ctx.is_closed() || !ctx.is_socket {
                return result;
            }
            if ctx.user_nonblock() {
                result | libc::O_NONBLOCK
            } else {
                result & !libc::O_NONBLOCK
            }
        }
        _ => fcntl_f()(fd, cmd, arg),
    }
}

#[no_mangle]
pub extern "C" fn ioctl(fd: c_int, request: libc::c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as libc::c_ulong {
        let user_nonblock = unsafe { *(arg as *const c_int) != 0 };
        if let Some(ctx) = fd_get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    ioctl_f()(fd, request, arg)
}

#[no_mangle]
pub extern "C" fn getsockopt(sockfd: c_int, level: c_int, optname: c_int, optval: *mut c_void, optlen: *mut socklen_t) -> c_int {
    getsockopt_f()(sockfd, level, optname, optval, optlen)
}

#[no_mangle]
pub extern "C" fn setsockopt(sockfd: c_int, level: c_int, optname: c_int, optval: *const c_void, optlen: socklen_t) -> c_int {
    if !is_hook_enabled() {
        return setsockopt_f()(sockfd, level, optname, optval, optlen);
    }
    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) {
        if let Some(ctx) = fd_get(sockfd, false) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO { TimeoutKind::Recv } else { TimeoutKind::Send };
            ctx.set_timeout(kind, ms);
        }
    }
    setsockopt_f()(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicI32, AtomicUsize};
    use std::time::Duration;

    fn loopback_sockaddr(port: u16) -> libc::sockaddr_in {
        libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: u32::from(Ipv4Addr::LOCALHOST).to_be() },
            sin_zero: [0; 8],
        }
    }

    /// `do_io`'s core contract: the first call hits `EAGAIN` on an empty
    /// socket, suspends the fiber instead of returning it, and resumes with
    /// the real data once the peer writes.
    #[test]
    fn do_io_retries_on_eagain_then_succeeds_once_readable() {
        let mut sv = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) }, 0);
        let (a, b) = (sv[0], sv[1]);
        fd_get(a, true);

        let iom = IOManager::new(2, false, "hook-do-io-test");
        let got = Arc::new(AtomicUsize::new(0));
        let got2 = got.clone();

        iom.scheduler().schedule(move || {
            set_hook_enabled(true);
            let mut buf = [0u8; 8];
            let n = read(a, buf.as_mut_ptr() as *mut c_void, buf.len());
            if n > 0 {
                got2.store(n as usize, Ordering::SeqCst);
            }
            set_hook_enabled(false);
        });

        std::thread::sleep(Duration::from_millis(50));
        unsafe {
            libc::write(b, b"hi".as_ptr() as *const c_void, 2);
        }
        std::thread::sleep(Duration::from_millis(200));
        iom.stop();

        assert_eq!(got.load(Ordering::SeqCst), 2);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    /// The `connect` EINPROGRESS dance: a non-blocking connect to a
    /// listener that eventually accepts completes with `0` once the fd
    /// becomes writable and `SO_ERROR` reads back clean.
    #[test]
    fn connect_completes_via_einprogress_then_so_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let iom = IOManager::new(2, false, "hook-connect-ok-test");
        let result = Arc::new(AtomicI32::new(-2));
        let result2 = result.clone();

        iom.scheduler().schedule(move || {
            set_hook_enabled(true);
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            fd_get(fd, true);
            let addr = loopback_sockaddr(port);
            let rc = connect(fd, &addr as *const _ as *const sockaddr, std::mem::size_of_val(&addr) as socklen_t);
            result2.store(rc, Ordering::SeqCst);
            unsafe { libc::close(fd) };
            set_hook_enabled(false);
        });

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let _ = listener.accept();
        });

        std::thread::sleep(Duration::from_millis(250));
        iom.stop();
        assert_eq!(result.load(Ordering::SeqCst), 0);
    }

    /// The same dance, but `SO_ERROR` comes back non-zero: nothing is
    /// listening on the target port, so the hook surfaces `ECONNREFUSED`
    /// through `connect`'s return value exactly as a blocking `connect`
    /// would, instead of leaving the fiber stuck.
    #[test]
    fn connect_surfaces_connection_refused() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let iom = IOManager::new(2, false, "hook-connect-refused-test");
        let result = Arc::new(AtomicI32::new(-2));
        let result2 = result.clone();

        iom.scheduler().schedule(move || {
            set_hook_enabled(true);
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            fd_get(fd, true);
            let addr = loopback_sockaddr(port);
            let rc = connect(fd, &addr as *const _ as *const sockaddr, std::mem::size_of_val(&addr) as socklen_t);
            result2.store(rc, Ordering::SeqCst);
            unsafe { libc::close(fd) };
            set_hook_enabled(false);
        });

        std::thread::sleep(Duration::from_millis(200));
        iom.stop();
        assert_eq!(result.load(Ordering::SeqCst), -1);
    }

    #[test]
    fn connect_timeout_ms_tracks_config_changes() {
        assert_eq!(connect_timeout_ms(), crate::config::tcp_connect_timeout().get());
        crate::config::tcp_connect_timeout().set(1234);
        assert_eq!(connect_timeout_ms(), 1234);
        crate::config::tcp_connect_timeout().set(5000);
    }
}
