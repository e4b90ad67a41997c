// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! M:N fiber scheduler.
//!
//! A pool of OS worker threads drains a shared FIFO task queue. Each worker
//! alternates between executing tasks and resuming an idle fiber. When the
//! constructing thread participates, it contributes a dedicated scheduler
//! fiber whose body is the worker loop; that fiber is only resumed by
//! [stop], so the constructing thread drains its share of work on shutdown.
//!
//! The [Schedule] trait stands in for subclassing: the I/O manager overrides
//! the `tickle`/`idle`/`stopping` hooks while reusing the worker loop, the
//! task queue, and the shutdown protocol defined here.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    logging,
    runtime::{
        self,
        fiber::{
            Fiber,
            FiberEntry,
            FiberState,
            SharedFiber,
        },
        thread::Thread,
    },
};
use ::std::{
    collections::VecDeque,
    mem,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread as os_thread,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A unit of work: a fiber to resume, or a callable to wrap in a fresh fiber.
pub struct Task {
    kind: TaskKind,
    /// Kernel thread id the task is pinned to; `None` means any worker.
    hint: Option<libc::pid_t>,
}

enum TaskKind {
    Fiber(SharedFiber),
    Call(FiberEntry),
}

/// M:N fiber scheduler.
pub struct Scheduler {
    /// Display name.
    name: String,
    /// FIFO task queue.
    tasks: Mutex<VecDeque<Task>>,
    /// Worker pool, joined on shutdown.
    threads: Mutex<Vec<Thread>>,
    /// Kernel ids of all participating threads.
    thread_ids: Mutex<Vec<libc::pid_t>>,
    /// Number of pool threads to spawn.
    thread_count: usize,
    /// Workers currently executing a task.
    active_threads: AtomicUsize,
    /// Workers currently inside their idle fiber.
    idle_threads: AtomicUsize,
    /// Set once by [stop].
    stop_flag: AtomicBool,
    /// Whether the constructing thread participates as a worker.
    use_caller: bool,
    /// Kernel id of the constructing thread, when it participates.
    root_tid: Option<libc::pid_t>,
    /// The constructing thread's scheduler fiber, resumed by [stop].
    caller_fiber: Mutex<Option<SharedFiber>>,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Scheduler extension hooks. Implementors embed a [Scheduler] and may
/// override the idle routine, the wakeup, and the stopping predicate; the
/// defaults are the plain scheduler behavior.
pub trait Schedule: Send + Sync + Sized + 'static {
    /// The embedded scheduler core.
    fn scheduler(&self) -> &Scheduler;

    /// Publishes per-thread ambient state at worker birth.
    fn publish(_this: &Arc<Self>) {}

    /// Wakes one blocked worker, if any. The base scheduler busy-idles, so
    /// nothing needs waking.
    fn tickle(&self) {}

    /// Reports whether the scheduler has fully drained and may shut down.
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Body of the per-worker idle fiber.
    fn idle(this: &Arc<Self>) {
        while !this.stopping() {
            os_thread::sleep(Duration::from_millis(1));
            Fiber::yield_now();
        }
    }

    /// Enqueues a task, waking a worker when the queue transitions from
    /// empty to non-empty.
    fn schedule(&self, task: Task) {
        let need_tickle: bool = {
            let mut tasks: MutexGuard<'_, VecDeque<Task>> = self.scheduler().queue();
            let was_empty: bool = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Tasks
impl Task {
    /// A task that resumes an existing fiber.
    pub fn from_fiber(fiber: SharedFiber) -> Self {
        Self {
            kind: TaskKind::Fiber(fiber),
            hint: None,
        }
    }

    /// A task that moves the fiber out of `slot`, leaving it empty so the
    /// call site cannot accidentally schedule the handle twice.
    pub fn take_fiber(slot: &mut Option<SharedFiber>) -> Self {
        Self {
            kind: TaskKind::Fiber(slot.take().expect("take_fiber() on an empty slot")),
            hint: None,
        }
    }

    /// A task that runs a callable inside a fresh fiber.
    pub fn from_call(entry: FiberEntry) -> Self {
        Self {
            kind: TaskKind::Call(entry),
            hint: None,
        }
    }

    /// Pins this task to the worker with the given kernel thread id.
    pub fn pin(mut self, tid: libc::pid_t) -> Self {
        self.hint = Some(tid);
        self
    }
}

/// Associate Functions for Schedulers
impl Scheduler {
    /// Creates a scheduler. `threads` counts all participating workers; when
    /// `use_caller` is set, the constructing thread is one of them and one
    /// fewer pool thread is spawned. Must be called on the thread that will
    /// later call [stop].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        assert!(threads > 0, "scheduler needs at least one worker");
        logging::initialize();

        let mut thread_count: usize = threads;
        let mut root_tid: Option<libc::pid_t> = None;
        if use_caller {
            thread_count -= 1;
            root_tid = Some(Thread::current_tid());
            Thread::set_name(name);
        }

        Self {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_flag: AtomicBool::new(false),
            use_caller,
            root_tid,
            caller_fiber: Mutex::new(None),
        }
    }

    /// Display name of this scheduler.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread ids of all participating workers, for task pinning.
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.thread_ids.lock().expect("scheduler lock poisoned").clone()
    }

    /// Reports whether any worker is parked in its idle fiber.
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Base stopping predicate: shutdown requested, queue drained, and no
    /// worker mid-task.
    pub fn base_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
            && self.queue().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.tasks.lock().expect("task queue lock poisoned")
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Starts the worker pool. When the constructing thread participates, its
/// bootstrap fiber is materialized here and a scheduler fiber is rigged with
/// the worker loop; it only runs when [stop] resumes it.
pub fn start<S: Schedule>(this: &Arc<S>) {
    let sched: &Scheduler = this.scheduler();
    if sched.stop_flag.load(Ordering::SeqCst) {
        warn!("start(): scheduler {:?} is stopped", sched.name);
        return;
    }
    S::publish(this);

    let mut threads: MutexGuard<'_, Vec<Thread>> = sched.threads.lock().expect("scheduler lock poisoned");
    assert!(threads.is_empty(), "start() called twice");

    if sched.use_caller {
        Fiber::current();
        let me: Arc<S> = Arc::clone(this);
        let fiber: SharedFiber = Fiber::new(Box::new(move || worker_loop(&me)), 0, false);
        runtime::set_scheduler_fiber(fiber.clone());
        *sched.caller_fiber.lock().expect("scheduler lock poisoned") = Some(fiber);
        sched
            .thread_ids
            .lock()
            .expect("scheduler lock poisoned")
            .push(sched.root_tid.expect("caller participates"));
    }

    for i in 0..sched.thread_count {
        let me: Arc<S> = Arc::clone(this);
        let thread: Thread = Thread::new(&format!("{}_{}", sched.name, i), move || worker_loop(&me))
            .expect("failed to spawn scheduler worker");
        sched
            .thread_ids
            .lock()
            .expect("scheduler lock poisoned")
            .push(thread.tid());
        threads.push(thread);
    }
    trace!("start(): {:?} workers running", sched.name);
}

/// Initiates shutdown and waits for every worker to drain and exit. After
/// this returns the queue is empty and no worker is mid-task.
pub fn stop<S: Schedule>(this: &Arc<S>) {
    let sched: &Scheduler = this.scheduler();
    if this.stopping() {
        return;
    }
    sched.stop_flag.store(true, Ordering::SeqCst);

    if sched.use_caller {
        debug_assert_eq!(Some(Thread::current_tid()), sched.root_tid, "stop() off the constructing thread");
    }

    // One wakeup per pool worker, plus one for the caller's scheduler fiber.
    for _ in 0..sched.thread_count {
        this.tickle();
    }
    let caller_fiber: Option<SharedFiber> = sched.caller_fiber.lock().expect("scheduler lock poisoned").take();
    if caller_fiber.is_some() {
        this.tickle();
    }

    // Drain our own share of the work before joining the pool.
    if let Some(fiber) = caller_fiber {
        Fiber::resume(&fiber);
    }

    let threads: Vec<Thread> = mem::take(&mut *sched.threads.lock().expect("scheduler lock poisoned"));
    for thread in threads {
        thread.join();
    }
    trace!("stop(): {:?} drained", sched.name);
}

/// The per-worker loop: pull the first hint-compatible task and run it, or
/// resume the idle fiber when the queue has nothing for us. Exits once the
/// idle fiber has terminated, which only happens after shutdown begins.
fn worker_loop<S: Schedule>(this: &Arc<S>) {
    let tid: libc::pid_t = Thread::current_tid();
    let sched: &Scheduler = this.scheduler();
    trace!("worker_loop(): starts in thread {:?}", tid);

    S::publish(this);
    runtime::set_hook_enabled(true);
    Fiber::current();

    let me: Arc<S> = Arc::clone(this);
    let idle_fiber: SharedFiber = Fiber::new(Box::new(move || S::idle(&me)), 0, true);

    loop {
        let mut task: Option<Task> = None;
        let mut tickle_me: bool = false;
        {
            let mut tasks: MutexGuard<'_, VecDeque<Task>> = sched.queue();
            let mut found: Option<usize> = None;
            for (index, candidate) in tasks.iter().enumerate() {
                match candidate.hint {
                    // Pinned to another worker: leave it and wake someone else.
                    Some(hint) if hint != tid => tickle_me = true,
                    _ => {
                        found = Some(index);
                        break;
                    },
                }
            }
            if let Some(index) = found {
                task = tasks.remove(index);
                sched.active_threads.fetch_add(1, Ordering::SeqCst);
                tickle_me = tickle_me || !tasks.is_empty();
            }
        }
        if tickle_me {
            this.tickle();
        }

        match task {
            Some(Task {
                kind: TaskKind::Fiber(fiber),
                ..
            }) => {
                if fiber.state() != FiberState::Term {
                    Fiber::resume(&fiber);
                }
                sched.active_threads.fetch_sub(1, Ordering::SeqCst);
            },
            Some(Task {
                kind: TaskKind::Call(entry),
                ..
            }) => {
                let fiber: SharedFiber = Fiber::new(entry, 0, true);
                Fiber::resume(&fiber);
                sched.active_threads.fetch_sub(1, Ordering::SeqCst);
            },
            None => {
                if idle_fiber.state() == FiberState::Term {
                    trace!("worker_loop(): ends in thread {:?}", tid);
                    break;
                }
                sched.idle_threads.fetch_add(1, Ordering::SeqCst);
                Fiber::resume(&idle_fiber);
                sched.idle_threads.fetch_sub(1, Ordering::SeqCst);
            },
        }
    }

    runtime::set_hook_enabled(false);
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// The plain scheduler is its own (hook-free) Schedule implementation.
impl Schedule for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

/// Drop Trait Implementation for Schedulers
impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(
            self.tasks.lock().map(|tasks| tasks.is_empty()).unwrap_or(true),
            "scheduler dropped with queued tasks"
        );
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Task,
        TaskKind,
    };
    use crate::runtime::fiber::{
        Fiber,
        SharedFiber,
    };
    use ::anyhow::Result;

    #[test]
    fn take_fiber_leaves_the_slot_empty() -> Result<()> {
        let mut slot: Option<SharedFiber> = Some(Fiber::new(Box::new(|| {}), 0, false));
        let task: Task = Task::take_fiber(&mut slot);
        crate::ensure_eq!(slot.is_none(), true);
        crate::ensure_eq!(matches!(task.kind, TaskKind::Fiber(_)), true);
        Ok(())
    }

    #[test]
    fn pin_records_the_thread_hint() -> Result<()> {
        let task: Task = Task::from_call(Box::new(|| {})).pin(42);
        crate::ensure_eq!(task.hint, Some(42));
        Ok(())
    }
}
