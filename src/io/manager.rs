// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! I/O manager.
//!
//! Extends the scheduler with an edge-triggered readiness loop and the timer
//! heap. Suspended fibers (or callables) park in per-descriptor,
//! per-direction event slots; readiness, cancellation, or descriptor close
//! moves them back into the task queue through the one-shot trigger
//! procedure. The idle fiber blocks on the readiness handle with the
//! earliest timer deadline as its timeout, and a self-pipe lets
//! [Schedule::tickle] cut that wait short.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::Config,
    fail::Fail,
    io::{
        fd_table::FdTable,
        poller::Poller,
    },
    logging,
    runtime::{
        self,
        fiber::{
            Fiber,
            FiberEntry,
            FiberState,
            SharedFiber,
        },
        scheduler::{
            self,
            Schedule,
            Scheduler,
            Task,
        },
        timer::{
            Timer,
            TimerCallback,
            TimerManager,
            NO_TIMEOUT,
        },
    },
};
use ::libc::c_int;
use ::std::{
    cmp,
    mem,
    os::fd::RawFd,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
        Weak,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Initial size of the descriptor-event array.
const INITIAL_RECORDS: usize = 32;

/// Maximum readiness events drained per poll.
const MAX_EVENTS: usize = 256;

/// Upper bound on the blocking timeout of the readiness loop (ms).
const MAX_TIMEOUT_MS: u64 = 5_000;

/// Edge-triggered flag, in the width epoll masks use.
const EPOLLET: u32 = libc::EPOLLET as u32;

/// Error-or-hangup conditions widened to both directions.
const EPOLL_ERR_HUP: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A readiness direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Read,
    Write,
}

/// What fires when a direction becomes ready: a parked fiber or a callable.
#[derive(Default)]
struct EventSlot {
    fiber: Option<SharedFiber>,
    callback: Option<FiberEntry>,
}

/// Per-descriptor event record.
struct FdRecord {
    fd: RawFd,
    inner: Mutex<FdRecordInner>,
}

struct FdRecordInner {
    /// Registered interest; a direction bit is set exactly when its slot is
    /// populated.
    events: u32,
    read: EventSlot,
    write: EventSlot,
}

/// I/O manager: scheduler + timer heap + readiness loop.
pub struct IoManager {
    /// Embedded scheduler core.
    sched: Scheduler,
    /// Timer heap; front insertions wake the readiness loop.
    timers: TimerManager,
    /// Readiness handle.
    poller: Poller,
    /// Self-pipe: `[read end, write end]`.
    tickle_fds: [RawFd; 2],
    /// Number of registered event directions across all records.
    pending: AtomicUsize,
    /// Descriptor-event array, grown under the write lock.
    records: RwLock<Vec<Option<Arc<FdRecord>>>>,
    /// Descriptor-context table consulted by the hooked syscall layer.
    fd_table: FdTable,
    /// Runtime configuration.
    config: Config,
}

/// A reference-counted I/O manager handle.
pub type SharedIoManager = Arc<IoManager>;

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Events
impl Event {
    /// The epoll bit of this direction.
    fn bits(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// Associate Functions for Per-Descriptor Event Records
impl FdRecord {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdRecordInner {
                events: 0,
                read: EventSlot::default(),
                write: EventSlot::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FdRecordInner> {
        self.inner.lock().expect("event record lock poisoned")
    }
}

impl FdRecordInner {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

/// Associate Functions for I/O Managers
impl IoManager {
    /// Creates an I/O manager and starts its worker pool. `threads` and
    /// `use_caller` follow [Scheduler::new].
    pub fn new(config: Config, threads: usize, use_caller: bool, name: &str) -> Result<SharedIoManager, Fail> {
        logging::initialize();

        let poller: Poller = Poller::new()?;

        // Self-pipe, read end non-blocking and watched edge-triggered.
        let mut tickle_fds: [RawFd; 2] = [0; 2];
        if unsafe { libc::pipe(tickle_fds.as_mut_ptr()) } != 0 {
            let fail: Fail = Fail::last_os_error("failed to create self-pipe");
            error!("new(): {}", fail.cause);
            return Err(fail);
        }
        let flags: c_int = unsafe { libc::fcntl(tickle_fds[0], libc::F_GETFL, 0) };
        unsafe { libc::fcntl(tickle_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let mut records: Vec<Option<Arc<FdRecord>>> = Vec::new();
        records.resize_with(INITIAL_RECORDS, || None);

        let me: SharedIoManager = Arc::new(Self {
            sched: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            poller,
            tickle_fds,
            pending: AtomicUsize::new(0),
            records: RwLock::new(records),
            fd_table: FdTable::new(),
            config,
        });
        me.poller
            .register(tickle_fds[0], libc::EPOLLIN as u32 | EPOLLET, tickle_fds[0] as u64)?;

        scheduler::start(&me);
        Ok(me)
    }

    /// The I/O manager driving the calling thread, if any.
    pub fn current() -> Option<SharedIoManager> {
        runtime::current_io()
    }

    /// Stops the worker pool, draining queued work first.
    pub fn stop(this: &SharedIoManager) {
        scheduler::stop(this);
    }

    /// The descriptor-context table.
    pub fn fd_table(&self) -> &FdTable {
        &self.fd_table
    }

    /// The runtime configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of registered event directions.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Registers one-shot interest in `event` on `fd`. With a callable the
    /// callable fires on readiness; without one the currently running fiber
    /// parks in the direction slot, and the caller is expected to yield.
    /// Duplicate registration of an already-armed direction fails.
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<FiberEntry>) -> Result<(), Fail> {
        let record: Arc<FdRecord> = match self.record(fd, true) {
            Some(record) => record,
            None => return Err(Fail::new(libc::EBADF, &format!("invalid descriptor (fd={:?})", fd))),
        };
        let mut inner: MutexGuard<'_, FdRecordInner> = record.lock();

        if inner.events & event.bits() != 0 {
            return Err(Fail::new(
                libc::EEXIST,
                &format!("event already registered (fd={:?}, event={:?})", fd, event),
            ));
        }

        let mask: u32 = EPOLLET | inner.events | event.bits();
        let result: Result<(), Fail> = if inner.events == 0 {
            self.poller.register(fd, mask, fd as u64)
        } else {
            self.poller.modify(fd, mask, fd as u64)
        };
        if let Err(fail) = result {
            error!("add_event(): {}", fail.cause);
            return Err(fail);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events |= event.bits();

        let slot: &mut EventSlot = inner.slot_mut(event);
        debug_assert!(slot.fiber.is_none() && slot.callback.is_none());
        match callback {
            Some(callback) => slot.callback = Some(callback),
            None => {
                let fiber: SharedFiber = Fiber::current();
                debug_assert_eq!(fiber.state(), FiberState::Running);
                slot.fiber = Some(fiber);
            },
        }
        Ok(())
    }

    /// Withdraws interest in `event` on `fd` without firing its slot.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let record: Arc<FdRecord> = match self.record(fd, false) {
            Some(record) => record,
            None => return false,
        };
        let mut inner: MutexGuard<'_, FdRecordInner> = record.lock();
        if inner.events & event.bits() == 0 {
            return false;
        }

        let remaining: u32 = inner.events & !event.bits();
        if !self.update_kernel(fd, remaining) {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = remaining;
        *inner.slot_mut(event) = EventSlot::default();
        true
    }

    /// Withdraws interest in `event` on `fd` and fires its slot.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let record: Arc<FdRecord> = match self.record(fd, false) {
            Some(record) => record,
            None => return false,
        };
        let mut inner: MutexGuard<'_, FdRecordInner> = record.lock();
        if inner.events & event.bits() == 0 {
            return false;
        }

        let remaining: u32 = inner.events & !event.bits();
        if !self.update_kernel(fd, remaining) {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.trigger(&mut inner, event);
        true
    }

    /// Withdraws all interest on `fd`, firing every armed direction. Used by
    /// the hooked `close` so suspended fibers observe the closed descriptor.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let record: Arc<FdRecord> = match self.record(fd, false) {
            Some(record) => record,
            None => return false,
        };
        let mut inner: MutexGuard<'_, FdRecordInner> = record.lock();
        if inner.events == 0 {
            return false;
        }

        if let Err(fail) = self.poller.unregister(fd) {
            error!("cancel_all(): {}", fail.cause);
            return false;
        }

        if inner.events & Event::Read.bits() != 0 {
            self.trigger(&mut inner, Event::Read);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events & Event::Write.bits() != 0 {
            self.trigger(&mut inner, Event::Write);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }

    /// Arms a timer; a new earliest deadline wakes the readiness loop.
    pub fn add_timer(&self, ms: u64, callback: TimerCallback, recurring: bool) -> Timer {
        let (timer, at_front): (Timer, bool) = self.timers.add(ms, callback, recurring);
        if at_front {
            Schedule::tickle(self);
        }
        timer
    }

    /// Arms a timer that only fires while `witness` is still alive.
    pub fn add_conditional_timer<T>(
        &self,
        ms: u64,
        callback: TimerCallback,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        T: Send + Sync + 'static,
    {
        let (timer, at_front): (Timer, bool) = self.timers.add_conditional(ms, callback, witness, recurring);
        if at_front {
            Schedule::tickle(self);
        }
        timer
    }

    /// Cancels a timer. See [TimerManager::cancel].
    pub fn cancel_timer(&self, timer: &Timer) -> bool {
        self.timers.cancel(timer)
    }

    /// Re-anchors a timer at `now`. See [TimerManager::refresh].
    pub fn refresh_timer(&self, timer: &Timer) -> bool {
        self.timers.refresh(timer)
    }

    /// Changes a timer's period. See [TimerManager::reset].
    pub fn reset_timer(&self, timer: &Timer, ms: u64, from_now: bool) -> bool {
        let (ok, at_front): (bool, bool) = self.timers.reset(timer, ms, from_now);
        if at_front {
            Schedule::tickle(self);
        }
        ok
    }

    /// Reports whether any timer is armed.
    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Fires one direction: clears its bit, moves the parked fiber or
    /// callable into the task queue, and empties the slot. Registrations are
    /// one-shot; persistent interest requires re-registration.
    fn trigger(&self, inner: &mut FdRecordInner, event: Event) {
        debug_assert!(inner.events & event.bits() != 0);
        inner.events &= !event.bits();

        let slot: &mut EventSlot = inner.slot_mut(event);
        if let Some(callback) = slot.callback.take() {
            self.schedule(Task::from_call(callback));
        } else if let Some(fiber) = slot.fiber.take() {
            self.schedule(Task::from_fiber(fiber));
        }
    }

    /// Narrows or removes the kernel registration of `fd` to `remaining`.
    fn update_kernel(&self, fd: RawFd, remaining: u32) -> bool {
        let result: Result<(), Fail> = if remaining != 0 {
            self.poller.modify(fd, EPOLLET | remaining, fd as u64)
        } else {
            self.poller.unregister(fd)
        };
        if let Err(fail) = result {
            error!("update_kernel(): {}", fail.cause);
            return false;
        }
        true
    }

    /// Looks up the event record of `fd`, creating it (and growing the
    /// array) when `create` is set.
    fn record(&self, fd: RawFd, create: bool) -> Option<Arc<FdRecord>> {
        if fd < 0 {
            return None;
        }
        let index: usize = fd as usize;

        {
            let records: RwLockReadGuard<'_, Vec<Option<Arc<FdRecord>>>> =
                self.records.read().expect("event array lock poisoned");
            if index < records.len() {
                if let Some(record) = &records[index] {
                    return Some(record.clone());
                }
            }
        }
        if !create {
            return None;
        }

        let mut records: RwLockWriteGuard<'_, Vec<Option<Arc<FdRecord>>>> =
            self.records.write().expect("event array lock poisoned");
        if records.len() <= index {
            // 1.5x growth, clamped so the requested index always fits.
            let target: usize = cmp::max(index + 1, index * 3 / 2);
            records.resize_with(target, || None);
        }
        Some(
            records[index]
                .get_or_insert_with(|| Arc::new(FdRecord::new(fd)))
                .clone(),
        )
    }

    /// Drains the self-pipe; edge-triggered registration demands exhaustion.
    fn drain_tickle_pipe(&self) {
        let mut buffer: [u8; 256] = [0; 256];
        while unsafe {
            libc::read(
                self.tickle_fds[0],
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        } > 0
        {}
    }

    /// Handles one readiness report: widen error/hangup to the registered
    /// directions, narrow the kernel registration to what stays armed, and
    /// fire every direction that became ready.
    fn dispatch(&self, event: &libc::epoll_event) {
        let fd: RawFd = event.u64 as RawFd;
        let record: Arc<FdRecord> = match self.record(fd, false) {
            Some(record) => record,
            // Raced with close; the registration is already gone.
            None => return,
        };
        let mut inner: MutexGuard<'_, FdRecordInner> = record.lock();

        let mut ready: u32 = event.events;
        if ready & EPOLL_ERR_HUP != 0 {
            ready |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & inner.events;
        }
        let ready: u32 = ready & (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32);
        if inner.events & ready == 0 {
            return;
        }

        let remaining: u32 = inner.events & !ready;
        if !self.update_kernel(record.fd, remaining) {
            return;
        }

        if ready & Event::Read.bits() & inner.events != 0 {
            self.trigger(&mut inner, Event::Read);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if ready & Event::Write.bits() & inner.events != 0 {
            self.trigger(&mut inner, Event::Write);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Scheduler hooks: the readiness loop is the idle routine, the self-pipe is
/// the wakeup, and shutdown additionally waits for timers and events.
impl Schedule for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Makes this I/O manager ambient on the calling thread.
    fn publish(this: &Arc<Self>) {
        runtime::set_current_io(Arc::downgrade(this));
    }

    /// Wakes a blocked readiness wait. A no-op without idle workers: a
    /// worker still draining the queue will see the new task before it
    /// blocks.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let n: libc::ssize_t =
            unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        if n != 1 {
            warn!("tickle(): short write on self-pipe");
        }
    }

    /// Strengthened stopping predicate: the timer heap must be empty and no
    /// event direction may remain registered.
    fn stopping(&self) -> bool {
        self.timers.next_timeout() == NO_TIMEOUT
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    /// The readiness loop. Blocks with the earliest timer deadline (capped)
    /// as timeout, submits expired timer callables and fired directions to
    /// the task queue, then yields so the worker can run them.
    fn idle(this: &Arc<Self>) {
        let mut events: Vec<libc::epoll_event> = vec![unsafe { mem::zeroed() }; MAX_EVENTS];

        loop {
            if this.stopping() {
                trace!("idle(): {:?} exits", this.sched.name());
                break;
            }

            let ready: usize = loop {
                let timeout_ms: u64 = cmp::min(this.timers.next_timeout(), MAX_TIMEOUT_MS);
                match this.poller.wait(&mut events, timeout_ms as i32) {
                    Ok(ready) => break ready,
                    Err(fail) if fail.errno == libc::EINTR => continue,
                    Err(fail) => {
                        warn!("idle(): {}", fail.cause);
                        break 0;
                    },
                }
            };

            for callback in this.timers.take_expired() {
                this.schedule(Task::from_call(Box::new(move || callback())));
            }

            for i in 0..ready {
                let event: libc::epoll_event = events[i];
                if event.u64 as RawFd == this.tickle_fds[0] {
                    this.drain_tickle_pipe();
                    continue;
                }
                this.dispatch(&event);
            }

            // Let the worker run what we just queued.
            Fiber::yield_now();
        }
    }
}

/// Drop Trait Implementation for I/O Managers
impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
