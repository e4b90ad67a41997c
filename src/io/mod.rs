// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! I/O manager: extends the scheduler with an edge-triggered readiness loop
//! and the timer heap, plus the descriptor bookkeeping the hooked syscall
//! layer depends on.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod fd_table;
pub mod manager;
pub mod poller;

pub use self::{
    fd_table::{
        FdContext,
        FdTable,
    },
    manager::{
        Event,
        IoManager,
        SharedIoManager,
    },
    poller::Poller,
};
