// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Descriptor-context table.
//!
//! Tracks, per descriptor, the flags the hooked syscall layer consults:
//! whether the descriptor is a socket, the user-visible and kernel-side
//! non-blocking states (stored separately), the closed flag, and the
//! per-direction timeouts. First use of a socket descriptor unconditionally
//! switches the kernel side to non-blocking so the hook layer can rely on
//! `EAGAIN` semantics; what the user last requested is presented back
//! through `fcntl`/`ioctl` instead of the kernel state.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::timer::NO_TIMEOUT;
use ::libc::c_int;
use ::std::{
    mem,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Initial size of the descriptor-context table.
const INITIAL_TABLE_SIZE: usize = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-descriptor context.
pub struct FdContext {
    /// Descriptor this context describes.
    fd: c_int,
    /// Whether `fstat` succeeded at creation time.
    initialized: bool,
    /// Whether the descriptor is a socket.
    is_socket: bool,
    /// Kernel-side non-blocking state, forced on for sockets.
    sys_nonblock: AtomicBool,
    /// Non-blocking state last requested by the user.
    user_nonblock: AtomicBool,
    /// Set by the hooked `close` before the context is dropped.
    closed: AtomicBool,
    /// Receive timeout in milliseconds; [NO_TIMEOUT] means none.
    recv_timeout_ms: AtomicU64,
    /// Send timeout in milliseconds; [NO_TIMEOUT] means none.
    send_timeout_ms: AtomicU64,
}

/// Table of descriptor contexts indexed by descriptor integer.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Descriptor Contexts
impl FdContext {
    /// Probes `fd` and builds its context. Socket descriptors are switched
    /// to kernel-side non-blocking here.
    fn new(fd: c_int) -> Self {
        let mut statbuf: libc::stat = unsafe { mem::zeroed() };
        let (initialized, is_socket): (bool, bool) = if unsafe { libc::fstat(fd, &mut statbuf) } == -1 {
            (false, false)
        } else {
            (true, statbuf.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let mut sys_nonblock: bool = false;
        if is_socket {
            let flags: c_int = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        Self {
            fd,
            initialized,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    /// Descriptor this context describes.
    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Timeout for the direction selected by `optname` (`SO_RCVTIMEO` or
    /// `SO_SNDTIMEO`), in milliseconds.
    pub fn timeout_ms(&self, optname: c_int) -> u64 {
        if optname == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::SeqCst)
        } else {
            self.send_timeout_ms.load(Ordering::SeqCst)
        }
    }

    pub fn set_timeout_ms(&self, optname: c_int, timeout_ms: u64) {
        if optname == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(timeout_ms, Ordering::SeqCst);
        } else {
            self.send_timeout_ms.store(timeout_ms, Ordering::SeqCst);
        }
    }
}

/// Associate Functions for Descriptor-Context Tables
impl FdTable {
    pub fn new() -> Self {
        let mut slots: Vec<Option<Arc<FdContext>>> = Vec::new();
        slots.resize_with(INITIAL_TABLE_SIZE, || None);
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Looks up the context of `fd`, creating it on first use when
    /// `auto_create` is set.
    pub fn get(&self, fd: c_int, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let index: usize = fd as usize;

        {
            let slots: RwLockReadGuard<'_, Vec<Option<Arc<FdContext>>>> =
                self.slots.read().expect("fd table lock poisoned");
            if index < slots.len() {
                if let Some(context) = &slots[index] {
                    return Some(context.clone());
                }
            }
        }
        if !auto_create {
            return None;
        }

        let mut slots: RwLockWriteGuard<'_, Vec<Option<Arc<FdContext>>>> =
            self.slots.write().expect("fd table lock poisoned");
        if slots.len() <= index {
            // Growing by 1.5x alone can undershoot a large descriptor
            // presented in one step, so the target is clamped to cover it.
            let target: usize = ::std::cmp::max(index + 1, index * 3 / 2);
            slots.resize_with(target, || None);
        }
        Some(
            slots[index]
                .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
                .clone(),
        )
    }

    /// Drops the context of `fd`.
    pub fn del(&self, fd: c_int) {
        if fd < 0 {
            return;
        }
        let mut slots: RwLockWriteGuard<'_, Vec<Option<Arc<FdContext>>>> =
            self.slots.write().expect("fd table lock poisoned");
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Descriptor-Context Tables
impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
