// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Edge-triggered readiness primitive.
//!
//! Thin wrapper over the kernel's epoll interface with ADD/MODIFY/DELETE
//! operations and an opaque `u64` token returned alongside the event bits.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::fail::Fail;
use ::std::os::fd::RawFd;

//======================================================================================================================
// Structures
//======================================================================================================================

/// An owned epoll handle.
pub struct Poller {
    epfd: RawFd,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Pollers
impl Poller {
    /// Creates a readiness handle.
    pub fn new() -> Result<Self, Fail> {
        match unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } {
            epfd if epfd >= 0 => Ok(Self { epfd }),
            _ => {
                let fail: Fail = Fail::last_os_error("failed to create epoll handle");
                error!("new(): {}", fail.cause);
                Err(fail)
            },
        }
    }

    /// Registers interest in `events` on `fd`. `token` is handed back
    /// verbatim with every readiness report for this descriptor.
    pub fn register(&self, fd: RawFd, events: u32, token: u64) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    /// Replaces the registered interest on `fd`.
    pub fn modify(&self, fd: RawFd, events: u32, token: u64) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    /// Removes `fd` from the interest set.
    pub fn unregister(&self, fd: RawFd) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Blocks for up to `timeout_ms` milliseconds (-1 blocks indefinitely)
    /// and returns how many entries of `events` were filled. Interruption by
    /// a signal surfaces as `EINTR`; callers decide whether to retry.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize, Fail> {
        let ready: i32 = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if ready < 0 {
            return Err(Fail::last_os_error("epoll_wait failed"));
        }
        Ok(ready as usize)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, token: u64) -> Result<(), Fail> {
        let mut event: libc::epoll_event = libc::epoll_event { events, u64: token };
        match unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) } {
            0 => Ok(()),
            _ => Err(Fail::last_os_error(&format!(
                "epoll_ctl failed (op={:?}, fd={:?})",
                op, fd
            ))),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop Trait Implementation for Pollers
impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Poller;
    use ::anyhow::Result;
    use ::std::os::fd::RawFd;

    #[test]
    fn registered_pipe_reports_readiness_with_its_token() -> Result<()> {
        let poller: Poller = match Poller::new() {
            Ok(poller) => poller,
            Err(e) => panic!("failed to create poller: {:?}", e.cause),
        };

        let mut fds: [RawFd; 2] = [0; 2];
        crate::ensure_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        if let Err(e) = poller.register(fds[0], (libc::EPOLLIN | libc::EPOLLET) as u32, 77) {
            panic!("failed to register pipe: {:?}", e.cause);
        }

        // Nothing readable yet.
        let mut events: Vec<libc::epoll_event> = vec![unsafe { ::std::mem::zeroed() }; 8];
        crate::ensure_eq!(poller.wait(&mut events, 0).unwrap_or(99), 0);

        crate::ensure_eq!(unsafe { libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1) }, 1);
        let ready: usize = match poller.wait(&mut events, 1_000) {
            Ok(ready) => ready,
            Err(e) => panic!("wait failed: {:?}", e.cause),
        };
        crate::ensure_eq!(ready, 1);
        crate::ensure_eq!(events[0].u64, 77);
        crate::ensure_neq!(events[0].events & libc::EPOLLIN as u32, 0);

        if let Err(e) = poller.unregister(fds[0]) {
            panic!("failed to unregister pipe: {:?}", e.cause);
        }
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        Ok(())
    }
}
