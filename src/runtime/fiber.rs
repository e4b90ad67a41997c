// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Stackful fiber primitive.
//!
//! A fiber is a cooperatively scheduled coroutine with its own stack and a
//! saved CPU context (`ucontext_t`). Fibers switch asymmetrically: a spawned
//! fiber always yields back to its partner (the per-thread scheduler fiber
//! when `run_in_scheduler` is set, the thread's bootstrap fiber otherwise)
//! and is resumed from that same partner. Task fibers never switch directly
//! to each other, which keeps the current partner unambiguous at every
//! suspension point.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config,
    runtime,
};
use ::std::{
    alloc::{
        alloc,
        dealloc,
        handle_alloc_error,
        Layout,
    },
    cell::UnsafeCell,
    mem::MaybeUninit,
    process,
    ptr,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Alignment of fiber stacks.
const STACK_ALIGN: usize = 16;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Global fiber id counter.
static FIBER_ID: AtomicU64 = AtomicU64::new(0);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lifecycle state of a fiber.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FiberState {
    /// Runnable, waiting to be resumed.
    Ready,
    /// Executing on some OS thread.
    Running,
    /// Entry returned; resumable only after [Fiber::reset].
    Term,
}

/// Entry callable of a fiber.
pub type FiberEntry = Box<dyn FnOnce() + Send + 'static>;

/// A reference-counted fiber handle.
pub type SharedFiber = Arc<Fiber>;

/// A stackful fiber.
pub struct Fiber {
    /// Monotonically assigned identifier.
    id: u64,
    /// Yield partner selector: scheduler fiber when set, bootstrap fiber otherwise.
    run_in_scheduler: bool,
    /// Owned stack region. The bootstrap fiber borrows the thread's native stack.
    stack: Option<StackArea>,
    /// Saved CPU context. Only touched by the thread currently switching this fiber.
    ctx: UnsafeCell<libc::ucontext_t>,
    /// Mutable state, serializing external resume attempts with self-mutation.
    inner: Mutex<FiberInner>,
}

struct FiberInner {
    state: FiberState,
    entry: Option<FiberEntry>,
}

struct StackArea {
    base: *mut u8,
    layout: Layout,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Fibers
impl Fiber {
    /// Spawns a fiber with the given entry callable. A `stack_size` of zero
    /// selects the configured default.
    pub fn new(entry: FiberEntry, stack_size: usize, run_in_scheduler: bool) -> SharedFiber {
        let stack_size: usize = if stack_size == 0 {
            config::default_stack_size()
        } else {
            stack_size
        };
        let layout: Layout = Layout::from_size_align(stack_size, STACK_ALIGN).expect("bad stack layout");
        let base: *mut u8 = unsafe { alloc(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }

        let fiber: Fiber = Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler,
            stack: Some(StackArea { base, layout }),
            ctx: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            inner: Mutex::new(FiberInner {
                state: FiberState::Ready,
                entry: Some(entry),
            }),
        };
        unsafe { fiber.rig_context() };
        trace!("new(): id={:?}", fiber.id);
        Arc::new(fiber)
    }

    /// Returns the calling thread's current fiber, materializing the
    /// bootstrap fiber on first use. The bootstrap fiber represents the
    /// thread's native stack, is born RUNNING, and doubles as the default
    /// scheduler fiber until one is installed.
    pub fn current() -> SharedFiber {
        if let Some(fiber) = runtime::current_fiber() {
            return fiber;
        }

        let main: Fiber = Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: false,
            stack: None,
            ctx: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            inner: Mutex::new(FiberInner {
                state: FiberState::Running,
                entry: None,
            }),
        };
        if unsafe { libc::getcontext(main.ctx.get()) } != 0 {
            Self::die("getcontext");
        }
        trace!("current(): bootstrap id={:?}", main.id);

        let main: SharedFiber = Arc::new(main);
        runtime::set_current_fiber(main.clone());
        runtime::set_bootstrap_fiber(main.clone());
        runtime::set_scheduler_fiber(main.clone());
        main
    }

    /// Identifier of the calling thread's current fiber, or `u64::MAX` when
    /// the thread has none.
    pub fn current_id() -> u64 {
        runtime::current_fiber().map_or(u64::MAX, |fiber| fiber.id)
    }

    /// Identifier of this fiber.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lifecycle state of this fiber.
    pub fn state(&self) -> FiberState {
        self.lock().state
    }

    /// Switches the calling thread into `this`. Requires READY; transitions
    /// to RUNNING; saves the caller's execution into the partner fiber's
    /// context so that a later yield returns here.
    pub fn resume(this: &SharedFiber) {
        // Make sure this thread has a bootstrap fiber to switch from.
        Fiber::current();

        {
            let mut inner: MutexGuard<'_, FiberInner> = this.lock();
            assert_eq!(inner.state, FiberState::Ready, "resume() requires a READY fiber");
            inner.state = FiberState::Running;
        }

        let partner: SharedFiber = this.partner();
        runtime::set_current_fiber(this.clone());
        if unsafe { libc::swapcontext(partner.ctx.get(), this.ctx.get()) } != 0 {
            Self::die("swapcontext");
        }
    }

    /// Suspends the calling fiber, returning control to its partner. A
    /// RUNNING fiber becomes READY; a TERM fiber stays TERM.
    pub fn yield_now() {
        let current: SharedFiber = runtime::current_fiber().expect("yield_now() outside a fiber context");
        current.switch_out();
    }

    /// Rearms a terminated fiber with a fresh entry, reusing its stack.
    pub fn reset(&self, entry: FiberEntry) {
        {
            let mut inner: MutexGuard<'_, FiberInner> = self.lock();
            assert!(self.stack.is_some(), "reset() on the bootstrap fiber");
            assert_eq!(inner.state, FiberState::Term, "reset() requires a TERM fiber");
            inner.state = FiberState::Ready;
            inner.entry = Some(entry);
        }
        unsafe { self.rig_context() };
    }

    /// Yield partner of this fiber on the calling thread.
    fn partner(&self) -> SharedFiber {
        if self.run_in_scheduler {
            runtime::scheduler_fiber().expect("no scheduler fiber on this thread")
        } else {
            runtime::bootstrap_fiber().expect("no bootstrap fiber on this thread")
        }
    }

    /// Switches the calling thread out of this fiber and into its partner.
    fn switch_out(&self) {
        {
            let mut inner: MutexGuard<'_, FiberInner> = self.lock();
            match inner.state {
                FiberState::Running => inner.state = FiberState::Ready,
                FiberState::Term => (),
                FiberState::Ready => panic!("yield on a READY fiber"),
            }
        }

        let partner: SharedFiber = self.partner();
        runtime::set_current_fiber(partner.clone());
        // The thread-locals keep the partner alive; drop our handle before
        // switching so a terminal yield leaves no reference behind on this
        // stack, which is freed without unwinding.
        let partner_ctx: *mut libc::ucontext_t = partner.ctx.get();
        drop(partner);
        if unsafe { libc::swapcontext(self.ctx.get(), partner_ctx) } != 0 {
            Self::die("swapcontext");
        }
    }

    /// Points the saved context at the entry trampoline on this fiber's stack.
    ///
    /// Safety: the caller must guarantee that no thread is executing on this
    /// fiber's stack.
    unsafe fn rig_context(&self) {
        let ctx: *mut libc::ucontext_t = self.ctx.get();
        if libc::getcontext(ctx) != 0 {
            Self::die("getcontext");
        }
        let stack: &StackArea = self.stack.as_ref().expect("spawned fibers own a stack");
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = stack.base as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = stack.layout.size();
        libc::makecontext(ctx, fiber_trampoline, 0);
    }

    /// Losing the context of a running fiber strands its stack, which is not
    /// locally recoverable.
    fn die(syscall: &str) -> ! {
        error!("{}() failed, aborting", syscall);
        process::abort();
    }

    fn lock(&self) -> MutexGuard<'_, FiberInner> {
        self.inner.lock().expect("fiber lock poisoned")
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Entry point of every spawned fiber: runs the entry callable, marks the
/// fiber TERM, drops its own strong reference, and performs a final yield.
/// Never returns.
extern "C" fn fiber_trampoline() {
    let current: SharedFiber = runtime::current_fiber().expect("trampoline without a current fiber");

    let entry: Option<FiberEntry> = current.lock().entry.take();
    if let Some(entry) = entry {
        entry();
    }

    {
        let mut inner: MutexGuard<'_, FiberInner> = current.lock();
        inner.state = FiberState::Term;
        inner.entry = None;
    }

    // Drop our strong reference before switching away for good; the worker
    // that resumed this fiber still holds one, keeping `raw` valid across
    // the final switch.
    let raw: *const Fiber = Arc::as_ptr(&current);
    drop(current);
    unsafe { (*raw).switch_out() };
    unreachable!("terminated fiber resumed");
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// Safety: `inner` is mutex-protected; `ctx` and `stack` are only touched by
// the single thread currently switching this fiber, which the scheduler's
// exclusive-ownership discipline guarantees.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

/// Drop Trait Implementation for Fibers
impl Drop for Fiber {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            unsafe { dealloc(stack.base, stack.layout) };
        }
        trace!("drop(): id={:?}", self.id);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Fiber,
        FiberState,
        SharedFiber,
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
    fn bootstrap_fiber_is_running_and_stackless() -> Result<()> {
        let main: SharedFiber = Fiber::current();
        crate::ensure_eq!(main.state(), FiberState::Running);
        crate::ensure_eq!(Fiber::current_id(), main.id());
        Ok(())
    }

    #[test]
    fn resume_runs_entry_to_completion() -> Result<()> {
        Fiber::current();
        let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let fiber_hits: Arc<AtomicUsize> = hits.clone();
        let fiber: SharedFiber = Fiber::new(
            Box::new(move || {
                fiber_hits.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            false,
        );
        crate::ensure_eq!(fiber.state(), FiberState::Ready);

        Fiber::resume(&fiber);
        crate::ensure_eq!(hits.load(Ordering::SeqCst), 1);
        crate::ensure_eq!(fiber.state(), FiberState::Term);
        Ok(())
    }

    #[test]
    fn yield_suspends_and_resume_continues() -> Result<()> {
        Fiber::current();
        let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let fiber_hits: Arc<AtomicUsize> = hits.clone();
        let fiber: SharedFiber = Fiber::new(
            Box::new(move || {
                fiber_hits.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                fiber_hits.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            false,
        );

        Fiber::resume(&fiber);
        crate::ensure_eq!(hits.load(Ordering::SeqCst), 1);
        crate::ensure_eq!(fiber.state(), FiberState::Ready);

        Fiber::resume(&fiber);
        crate::ensure_eq!(hits.load(Ordering::SeqCst), 2);
        crate::ensure_eq!(fiber.state(), FiberState::Term);
        Ok(())
    }

    #[test]
    fn reset_rearms_a_terminated_fiber() -> Result<()> {
        Fiber::current();
        let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let first_hits: Arc<AtomicUsize> = hits.clone();
        let fiber: SharedFiber = Fiber::new(
            Box::new(move || {
                first_hits.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            false,
        );
        Fiber::resume(&fiber);
        crate::ensure_eq!(fiber.state(), FiberState::Term);

        let second_hits: Arc<AtomicUsize> = hits.clone();
        fiber.reset(Box::new(move || {
            second_hits.fetch_add(10, Ordering::SeqCst);
        }));
        crate::ensure_eq!(fiber.state(), FiberState::Ready);

        Fiber::resume(&fiber);
        crate::ensure_eq!(hits.load(Ordering::SeqCst), 11);
        crate::ensure_eq!(fiber.state(), FiberState::Term);
        Ok(())
    }

    #[test]
    fn fiber_ids_are_unique() -> Result<()> {
        let a: SharedFiber = Fiber::new(Box::new(|| {}), 0, false);
        let b: SharedFiber = Fiber::new(Box::new(|| {}), 0, false);
        crate::ensure_neq!(a.id(), b.id());
        Ok(())
    }
}
