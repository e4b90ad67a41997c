// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! OS thread primitive.
//!
//! Thread birth is synchronized with a counted semaphore: the creator blocks
//! until the newly born thread has published its kernel-assigned identifier,
//! so a caller can never submit work referencing a thread whose identity is
//! not yet known.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::fail::Fail;
use ::std::{
    cell::RefCell,
    ffi::CString,
    sync::{
        atomic::{
            AtomicI32,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Thread Local Storage
//======================================================================================================================

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("unnamed"));
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Counted semaphore.
pub struct Semaphore {
    count: Mutex<usize>,
    nonzero: Condvar,
}

/// An OS thread with a published kernel thread identifier.
pub struct Thread {
    /// Kernel-assigned thread id (`gettid`), published before [Thread::new] returns.
    tid: libc::pid_t,
    /// Display name.
    name: String,
    /// Join handle, consumed by [Thread::join].
    handle: Option<JoinHandle<()>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Counted Semaphores
impl Semaphore {
    /// Creates a semaphore with an initial count.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            nonzero: Condvar::new(),
        }
    }

    /// Decrements the count, blocking while it is zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore lock poisoned");
        while *count == 0 {
            count = self.nonzero.wait(count).expect("semaphore lock poisoned");
        }
        *count -= 1;
    }

    /// Increments the count and wakes one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock().expect("semaphore lock poisoned");
        *count += 1;
        self.nonzero.notify_one();
    }
}

/// Associate Functions for Threads
impl Thread {
    /// Spawns a named thread running `body`. Blocks until the child has
    /// published its kernel thread id.
    pub fn new<F>(name: &str, body: F) -> Result<Self, Fail>
    where
        F: FnOnce() + Send + 'static,
    {
        let birth: Arc<Semaphore> = Arc::new(Semaphore::new(0));
        let tid: Arc<AtomicI32> = Arc::new(AtomicI32::new(-1));

        let child_birth: Arc<Semaphore> = birth.clone();
        let child_tid: Arc<AtomicI32> = tid.clone();
        let child_name: String = name.to_string();
        let handle: JoinHandle<()> = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                Thread::set_name(&child_name);
                child_tid.store(Thread::current_tid(), Ordering::SeqCst);
                child_birth.signal();
                body();
            })
            .map_err(|e| Fail::new(libc::EAGAIN, &format!("failed to spawn thread: {:?}", e)))?;

        birth.wait();
        Ok(Self {
            tid: tid.load(Ordering::SeqCst),
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    /// Kernel thread id of the calling thread.
    pub fn current_tid() -> libc::pid_t {
        unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
    }

    /// Display name of the calling thread.
    pub fn current_name() -> String {
        THREAD_NAME.with(|name| name.borrow().clone())
    }

    /// Sets the display name of the calling thread. The kernel-visible name
    /// is truncated to 15 bytes.
    pub fn set_name(name: &str) {
        THREAD_NAME.with(|slot| *slot.borrow_mut() = name.to_string());
        let truncated: String = name.chars().take(15).collect();
        if let Ok(cname) = CString::new(truncated) {
            unsafe { libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr()) };
        }
    }

    /// Kernel thread id of this thread.
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    /// Display name of this thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("join(): thread {:?} panicked", self.name);
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Semaphore,
        Thread,
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    #[test]
    fn thread_id_is_published_before_new_returns() -> Result<()> {
        let thread: Thread = match Thread::new("birth-test", || {}) {
            Ok(thread) => thread,
            Err(e) => panic!("failed to spawn thread: {:?}", e.cause),
        };
        crate::ensure_neq!(thread.tid(), -1);
        crate::ensure_neq!(thread.tid(), Thread::current_tid());
        thread.join();
        Ok(())
    }

    #[test]
    fn semaphore_orders_producer_and_consumer() -> Result<()> {
        let sem: Arc<Semaphore> = Arc::new(Semaphore::new(0));
        let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let child_sem: Arc<Semaphore> = sem.clone();
        let child_hits: Arc<AtomicUsize> = hits.clone();
        let thread: Thread = match Thread::new("sem-test", move || {
            child_hits.store(1, Ordering::SeqCst);
            child_sem.signal();
        }) {
            Ok(thread) => thread,
            Err(e) => panic!("failed to spawn thread: {:?}", e.cause),
        };

        sem.wait();
        crate::ensure_eq!(hits.load(Ordering::SeqCst), 1);
        thread.join();
        Ok(())
    }
}
