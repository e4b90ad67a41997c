// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Stackful M:N fiber runtime.
//!
//! The crate is organized in dependency order: [runtime] holds the fiber,
//! thread, timer, and scheduler primitives; [io] extends the scheduler with
//! an epoll-driven readiness loop; [hook] rewrites blocking descriptor calls
//! into cooperative fiber suspensions.

#[macro_use]
extern crate log;

pub mod config;
pub mod fail;
pub mod hook;
pub mod io;
pub mod logging;
pub mod runtime;

pub use crate::{
    config::Config,
    fail::Fail,
    io::{
        Event,
        FdContext,
        FdTable,
        IoManager,
        SharedIoManager,
    },
    runtime::{
        fiber::{
            Fiber,
            FiberState,
            SharedFiber,
        },
        scheduler::{
            Schedule,
            Scheduler,
            Task,
        },
        thread::{
            Semaphore,
            Thread,
        },
        timer::{
            Timer,
            TimerManager,
        },
    },
};

/// Asserts that two expressions are equal, bailing out of the enclosing
/// test with a diagnostic instead of panicking.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            ::anyhow::bail!(
                "ensure_eq failed: {} == {} ({:?} != {:?})",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

/// Asserts that two expressions differ. See [ensure_eq].
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left == right {
            ::anyhow::bail!(
                "ensure_neq failed: {} != {} (both {:?})",
                stringify!($left),
                stringify!($right),
                left
            );
        }
    }};
}
