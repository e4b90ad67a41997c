// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fiber-aware syscall layer.
//!
//! Each function here keeps the kernel's signature and semantics but, when
//! the calling thread runs under an I/O manager with hooking enabled,
//! rewrites "would block" into a cooperative suspension: register a one-shot
//! readiness event (plus a conditional timeout timer when the descriptor
//! carries one), yield the calling fiber, and retry once resumed. Only the
//! fiber blocks; the worker thread keeps scheduling.
//!
//! The hook-enable flag is per thread, defaults to off, and is raised by the
//! scheduler worker loop, so only code running under the scheduler observes
//! fiber-aware behavior. Descriptors that are not sockets, or that the user
//! explicitly marked non-blocking, always take the raw syscall.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::{
        errno,
        set_errno,
    },
    io::{
        fd_table::FdContext,
        manager::{
            Event,
            IoManager,
            SharedIoManager,
        },
    },
    runtime::{
        self,
        fiber::{
            Fiber,
            SharedFiber,
        },
        scheduler::{
            Schedule,
            Task,
        },
        timer::{
            Timer,
            NO_TIMEOUT,
        },
    },
};
use ::libc::{
    c_int,
    c_uint,
    c_ulong,
    c_void,
    size_t,
    socklen_t,
    ssize_t,
};
use ::std::sync::{
    atomic::{
        AtomicI32,
        Ordering,
    },
    Arc,
    Mutex,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Witness shared between a suspended operation and its timeout timer. The
/// timer marks it before cancelling the event, so the resumed fiber can tell
/// a timeout apart from genuine readiness.
struct TimerInfo {
    cancelled: AtomicI32,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reports whether hooked syscalls are fiber-aware on the calling thread.
pub fn is_enabled() -> bool {
    runtime::hook_enabled()
}

/// Raises or lowers fiber-aware behavior on the calling thread.
pub fn set_enabled(enabled: bool) {
    runtime::set_hook_enabled(enabled);
}

/// The ambient I/O manager, when hooking is live on this thread.
fn ambient() -> Option<SharedIoManager> {
    if !runtime::hook_enabled() {
        return None;
    }
    IoManager::current()
}

/// Parks the calling fiber on a one-shot timer and yields.
fn park_current(io: &SharedIoManager, ms: u64) {
    let parked: Arc<Mutex<Option<SharedFiber>>> = Arc::new(Mutex::new(Some(Fiber::current())));
    let waker_io: SharedIoManager = io.clone();
    io.add_timer(
        ms,
        Arc::new(move || {
            let mut parked = parked.lock().expect("parked fiber lock poisoned");
            if parked.is_some() {
                waker_io.schedule(Task::take_fiber(&mut parked));
            }
        }),
        false,
    );
    Fiber::yield_now();
}

/// Common path of the read/write families: consult the descriptor context,
/// convert `EAGAIN` into suspension on `event`, honor the per-direction
/// timeout, and retry after resumption.
fn do_io<F>(fd: c_int, mut raw: F, name: &str, event: Event, timeout_optname: c_int) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    let io: SharedIoManager = match ambient() {
        Some(io) => io,
        None => return raw(),
    };
    let context: Arc<FdContext> = match io.fd_table().get(fd, false) {
        Some(context) => context,
        None => return raw(),
    };

    if context.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !context.is_socket() || context.user_nonblock() {
        return raw();
    }

    let timeout_ms: u64 = context.timeout_ms(timeout_optname);
    let info: Arc<TimerInfo> = Arc::new(TimerInfo {
        cancelled: AtomicI32::new(0),
    });

    loop {
        let mut n: ssize_t = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Out of data (or buffer space): arm the wakeups and suspend.
        let mut timer: Option<Timer> = None;
        if timeout_ms != NO_TIMEOUT {
            let witness: std::sync::Weak<TimerInfo> = Arc::downgrade(&info);
            let timer_info: std::sync::Weak<TimerInfo> = Arc::downgrade(&info);
            let timer_io: SharedIoManager = io.clone();
            timer = Some(io.add_conditional_timer(
                timeout_ms,
                Arc::new(move || {
                    let info: Arc<TimerInfo> = match timer_info.upgrade() {
                        Some(info) => info,
                        None => return,
                    };
                    if info.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    timer_io.cancel_event(fd, event);
                }),
                witness,
                false,
            ));
        }

        if let Err(fail) = io.add_event(fd, event, None) {
            warn!("{}(): add_event failed: {}", name, fail.cause);
            if let Some(timer) = &timer {
                io.cancel_timer(timer);
            }
            set_errno(fail.errno);
            return -1;
        }

        Fiber::yield_now();

        // Resumed by readiness, cancellation, or the timeout timer.
        if let Some(timer) = &timer {
            io.cancel_timer(timer);
        }
        if info.cancelled.load(Ordering::SeqCst) == libc::ETIMEDOUT {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
    }
}

/// Sleeps the calling fiber (not the thread) for `seconds`.
pub fn sleep(seconds: c_uint) -> c_uint {
    match ambient() {
        Some(io) => {
            park_current(&io, seconds as u64 * 1_000);
            0
        },
        None => unsafe { libc::sleep(seconds) },
    }
}

/// Sleeps the calling fiber for `usec` microseconds (millisecond granularity).
pub fn usleep(usec: libc::useconds_t) -> c_int {
    match ambient() {
        Some(io) => {
            park_current(&io, usec as u64 / 1_000);
            0
        },
        None => unsafe { libc::usleep(usec) },
    }
}

/// Sleeps the calling fiber for the requested duration (millisecond
/// granularity). Never reports an interrupted remainder.
///
/// # Safety
///
/// `req` must point to a valid `timespec`; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    match ambient() {
        Some(io) => {
            let ms: u64 = (*req).tv_sec as u64 * 1_000 + (*req).tv_nsec as u64 / 1_000_000;
            park_current(&io, ms);
            0
        },
        None => libc::nanosleep(req, rem),
    }
}

/// Creates a socket and registers it with the descriptor-context table,
/// which forces kernel-side non-blocking mode.
pub fn socket(domain: c_int, type_: c_int, protocol: c_int) -> c_int {
    let fd: c_int = unsafe { libc::socket(domain, type_, protocol) };
    if fd == -1 {
        warn!("socket(): failed (errno={:?})", errno());
        return fd;
    }
    if let Some(io) = ambient() {
        io.fd_table().get(fd, true);
    }
    fd
}

/// Connects with the process-wide default timeout.
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect(sockfd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    let timeout_ms: u64 = match ambient() {
        Some(io) => io.config().connect_timeout_ms,
        None => NO_TIMEOUT,
    };
    connect_with_timeout(sockfd, addr, addrlen, timeout_ms)
}

/// Connects, blocking the calling fiber until the handshake finishes, fails,
/// or `timeout_ms` elapses.
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    let io: SharedIoManager = match ambient() {
        Some(io) => io,
        None => return libc::connect(sockfd, addr, addrlen),
    };
    let context: Arc<FdContext> = match io.fd_table().get(sockfd, false) {
        Some(context) => context,
        None => return libc::connect(sockfd, addr, addrlen),
    };
    if context.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !context.is_socket() || context.user_nonblock() {
        return libc::connect(sockfd, addr, addrlen);
    }

    let n: c_int = libc::connect(sockfd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // Handshake in flight: wait for writability.
    let info: Arc<TimerInfo> = Arc::new(TimerInfo {
        cancelled: AtomicI32::new(0),
    });
    let mut timer: Option<Timer> = None;
    if timeout_ms != NO_TIMEOUT {
        let witness: std::sync::Weak<TimerInfo> = Arc::downgrade(&info);
        let timer_info: std::sync::Weak<TimerInfo> = Arc::downgrade(&info);
        let timer_io: SharedIoManager = io.clone();
        timer = Some(io.add_conditional_timer(
            timeout_ms,
            Arc::new(move || {
                let info: Arc<TimerInfo> = match timer_info.upgrade() {
                    Some(info) => info,
                    None => return,
                };
                if info.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                timer_io.cancel_event(sockfd, Event::Write);
            }),
            witness,
            false,
        ));
    }

    match io.add_event(sockfd, Event::Write, None) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(timer) = &timer {
                io.cancel_timer(timer);
            }
            if info.cancelled.load(Ordering::SeqCst) != 0 {
                set_errno(info.cancelled.load(Ordering::SeqCst));
                return -1;
            }
        },
        Err(fail) => {
            if let Some(timer) = &timer {
                io.cancel_timer(timer);
            }
            warn!("connect(): add_event failed: {}", fail.cause);
        },
    }

    // The handshake outcome is parked in SO_ERROR.
    let mut error: c_int = 0;
    let mut len: socklen_t = ::std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        sockfd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
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

/// Accepts a connection, suspending the calling fiber until one arrives. The
/// returned descriptor is registered with the descriptor-context table.
///
/// # Safety
///
/// `addr` and `addrlen` must be null or valid for the kernel to fill in.
pub unsafe fn accept(sockfd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd: c_int = do_io(
        sockfd,
        || libc::accept(sockfd, addr, addrlen) as ssize_t,
        "accept",
        Event::Read,
        libc::SO_RCVTIMEO,
    ) as c_int;
    if fd >= 0 {
        if let Some(io) = ambient() {
            io.fd_table().get(fd, true);
        }
    }
    fd
}

/// # Safety
///
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, || libc::read(fd, buf, count), "read", Event::Read, libc::SO_RCVTIMEO)
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, || libc::readv(fd, iov, iovcnt), "readv", Event::Read, libc::SO_RCVTIMEO)
}

/// # Safety
///
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || libc::recv(sockfd, buf, len, flags),
        "recv",
        Event::Read,
        libc::SO_RCVTIMEO,
    )
}

/// # Safety
///
/// `buf` must be valid for writes of `len` bytes; `src_addr`/`addrlen` must
/// be null or valid for the kernel to fill in.
pub unsafe fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(
        sockfd,
        || libc::recvfrom(sockfd, buf, len, flags, src_addr, addrlen),
        "recvfrom",
        Event::Read,
        libc::SO_RCVTIMEO,
    )
}

/// # Safety
///
/// `msg` must point to a valid message header.
pub unsafe fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || libc::recvmsg(sockfd, msg, flags),
        "recvmsg",
        Event::Read,
        libc::SO_RCVTIMEO,
    )
}

/// # Safety
///
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, || libc::write(fd, buf, count), "write", Event::Write, libc::SO_SNDTIMEO)
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, || libc::writev(fd, iov, iovcnt), "writev", Event::Write, libc::SO_SNDTIMEO)
}

/// # Safety
///
/// `buf` must be valid for reads of `len` bytes.
pub unsafe fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || libc::send(sockfd, buf, len, flags),
        "send",
        Event::Write,
        libc::SO_SNDTIMEO,
    )
}

/// # Safety
///
/// `buf` must be valid for reads of `len` bytes; `dest_addr` must point to a
/// valid socket address of length `addrlen`.
pub unsafe fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(
        sockfd,
        || libc::sendto(sockfd, buf, len, flags, dest_addr, addrlen),
        "sendto",
        Event::Write,
        libc::SO_SNDTIMEO,
    )
}

/// # Safety
///
/// `msg` must point to a valid message header.
pub unsafe fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || libc::sendmsg(sockfd, msg, flags),
        "sendmsg",
        Event::Write,
        libc::SO_SNDTIMEO,
    )
}

/// Closes a descriptor. Every event still armed on it is cancelled first, so
/// fibers suspended on the descriptor resume and observe `EBADF`.
pub fn close(fd: c_int) -> c_int {
    if let Some(io) = ambient() {
        if let Some(context) = io.fd_table().get(fd, false) {
            context.set_closed();
            io.cancel_all(fd);
            io.fd_table().del(fd);
        }
    }
    unsafe { libc::close(fd) }
}

/// `fcntl` with the non-blocking bookkeeping of the descriptor context:
/// `F_SETFL` records the user's wish but keeps the kernel non-blocking;
/// `F_GETFL` presents the user's wish instead of the kernel state. Other
/// commands pass through with `arg` forwarded verbatim.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let context: Option<Arc<FdContext>> = ambient().and_then(|io| io.fd_table().get(fd, false));
            match context {
                Some(context) if !context.is_closed() && context.is_socket() => {
                    context.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    let mut real_arg: c_int = arg;
                    if context.sys_nonblock() {
                        real_arg |= libc::O_NONBLOCK;
                    } else {
                        real_arg &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, real_arg) }
                },
                _ => unsafe { libc::fcntl(fd, cmd, arg) },
            }
        },
        libc::F_GETFL => {
            let flags: c_int = unsafe { libc::fcntl(fd, cmd) };
            let context: Option<Arc<FdContext>> = ambient().and_then(|io| io.fd_table().get(fd, false));
            match context {
                Some(context) if !context.is_closed() && context.is_socket() => {
                    if context.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                },
                _ => flags,
            }
        },
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl`, intercepting `FIONBIO` the same way `fcntl` intercepts the
/// status flags: the user's wish is recorded, the kernel stays non-blocking.
///
/// # Safety
///
/// `arg` must be valid for the given request.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let context: Option<Arc<FdContext>> = ambient().and_then(|io| io.fd_table().get(fd, false));
        if let Some(context) = context {
            if !context.is_closed() && context.is_socket() {
                let user_nonblock: bool = *(arg as *mut c_int) != 0;
                context.set_user_nonblock(user_nonblock);
                let mut forced: c_int = (user_nonblock || context.sys_nonblock()) as c_int;
                return libc::ioctl(fd, request, &mut forced as *mut c_int);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// Passthrough.
///
/// # Safety
///
/// `optval`/`optlen` must be valid for the kernel to fill in.
pub unsafe fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(sockfd, level, optname, optval, optlen)
}

/// `setsockopt`, additionally recording `SO_RCVTIMEO`/`SO_SNDTIMEO` on the
/// descriptor context so suspended operations can honor them.
///
/// # Safety
///
/// `optval` must be valid for reads of `optlen` bytes.
pub unsafe fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if let Some(io) = ambient() {
        if level == libc::SOL_SOCKET
            && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
            && !optval.is_null()
            && optlen as usize >= ::std::mem::size_of::<libc::timeval>()
        {
            if let Some(context) = io.fd_table().get(sockfd, false) {
                let tv: &libc::timeval = &*(optval as *const libc::timeval);
                let ms: u64 = tv.tv_sec as u64 * 1_000 + tv.tv_usec as u64 / 1_000;
                context.set_timeout_ms(optname, ms);
            }
        }
    }
    libc::setsockopt(sockfd, level, optname, optval, optlen)
}
