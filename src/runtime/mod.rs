// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Core runtime primitives: fibers, threads, timers, and the M:N scheduler.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod fiber;
pub mod scheduler;
pub mod thread;
pub mod timer;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    io::IoManager,
    runtime::fiber::SharedFiber,
};
use ::std::{
    cell::RefCell,
    sync::{
        Arc,
        Weak,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-OS-thread runtime state. Initialized at worker birth and torn down at
/// worker exit; never shared across threads.
struct ThreadContext {
    /// Fiber currently executing on this thread.
    current: Option<SharedFiber>,
    /// Fiber representing the thread's native stack.
    bootstrap: Option<SharedFiber>,
    /// Fiber running the worker loop; yield partner of scheduled fibers.
    scheduler: Option<SharedFiber>,
    /// I/O manager driving this thread, if any.
    io: Weak<IoManager>,
    /// Whether hooked syscalls are fiber-aware on this thread.
    hook_enabled: bool,
}

thread_local! {
    static CONTEXT: RefCell<ThreadContext> = RefCell::new(ThreadContext {
        current: None,
        bootstrap: None,
        scheduler: None,
        io: Weak::new(),
        hook_enabled: false,
    });
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

// All accessors clone out of the thread-local cell so that no borrow is ever
// live across a fiber context switch.

pub(crate) fn current_fiber() -> Option<SharedFiber> {
    CONTEXT.with(|ctx| ctx.borrow().current.clone())
}

pub(crate) fn set_current_fiber(fiber: SharedFiber) {
    CONTEXT.with(|ctx| ctx.borrow_mut().current = Some(fiber));
}

pub(crate) fn bootstrap_fiber() -> Option<SharedFiber> {
    CONTEXT.with(|ctx| ctx.borrow().bootstrap.clone())
}

pub(crate) fn set_bootstrap_fiber(fiber: SharedFiber) {
    CONTEXT.with(|ctx| ctx.borrow_mut().bootstrap = Some(fiber));
}

pub(crate) fn scheduler_fiber() -> Option<SharedFiber> {
    CONTEXT.with(|ctx| ctx.borrow().scheduler.clone())
}

pub(crate) fn set_scheduler_fiber(fiber: SharedFiber) {
    CONTEXT.with(|ctx| ctx.borrow_mut().scheduler = Some(fiber));
}

pub(crate) fn current_io() -> Option<Arc<IoManager>> {
    CONTEXT.with(|ctx| ctx.borrow().io.upgrade())
}

pub(crate) fn set_current_io(io: Weak<IoManager>) {
    CONTEXT.with(|ctx| ctx.borrow_mut().io = io);
}

pub(crate) fn hook_enabled() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().hook_enabled)
}

pub(crate) fn set_hook_enabled(enabled: bool) {
    CONTEXT.with(|ctx| ctx.borrow_mut().hook_enabled = enabled);
}
