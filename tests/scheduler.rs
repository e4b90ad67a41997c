// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    sync::{
        atomic::{
            AtomicI32,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};
use ::strand::{
    runtime::scheduler::{
        self,
        Schedule,
    },
    Fiber,
    Scheduler,
    SharedFiber,
    Task,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Upper bound for "eventually" in these tests.
const DEADLINE: Duration = Duration::from_secs(5);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Spins until `condition` holds or the deadline passes.
fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let start: Instant = Instant::now();
    while start.elapsed() < DEADLINE {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Tests if a pool of workers runs every submitted callable exactly once.
#[test]
fn pool_workers_run_all_callables() {
    let sched: Arc<Scheduler> = Arc::new(Scheduler::new(3, false, "pool-test"));
    scheduler::start(&sched);

    let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let task_hits: Arc<AtomicUsize> = hits.clone();
        sched.schedule(Task::from_call(Box::new(move || {
            task_hits.fetch_add(1, Ordering::SeqCst);
        })));
    }

    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 20), "tasks did not drain");
    scheduler::stop(&sched);
    assert_eq!(hits.load(Ordering::SeqCst), 20);
}

/// Tests if, with the constructing thread as the only worker, queued work is
/// drained by `stop`.
#[test]
fn caller_thread_drains_queue_on_stop() {
    let sched: Arc<Scheduler> = Arc::new(Scheduler::new(1, true, "caller-test"));
    scheduler::start(&sched);

    let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let task_hits: Arc<AtomicUsize> = hits.clone();
        sched.schedule(Task::from_call(Box::new(move || {
            task_hits.fetch_add(1, Ordering::SeqCst);
        })));
    }

    // No pool workers exist, so nothing ran yet.
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    scheduler::stop(&sched);
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

/// Tests if a submitted fiber resumes where it left off on its next turn:
/// the fiber reschedules itself before yielding mid-way.
#[test]
fn fibers_resume_across_yields() {
    let sched: Arc<Scheduler> = Arc::new(Scheduler::new(1, false, "fiber-test"));
    scheduler::start(&sched);

    let phases: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let fiber_phases: Arc<AtomicUsize> = phases.clone();
    let fiber_sched: Arc<Scheduler> = sched.clone();
    let fiber: SharedFiber = Fiber::new(
        Box::new(move || {
            fiber_phases.fetch_add(1, Ordering::SeqCst);
            // Park this fiber back in the queue, then give up the worker.
            let mut me: Option<SharedFiber> = Some(Fiber::current());
            fiber_sched.schedule(Task::take_fiber(&mut me));
            Fiber::yield_now();
            fiber_phases.fetch_add(1, Ordering::SeqCst);
        }),
        0,
        true,
    );
    sched.schedule(Task::from_fiber(fiber));

    assert!(wait_until(|| phases.load(Ordering::SeqCst) == 2), "fiber never finished");
    scheduler::stop(&sched);
}

/// Tests if a pinned task runs on the worker it names.
#[test]
fn pinned_task_runs_on_its_worker() {
    let sched: Arc<Scheduler> = Arc::new(Scheduler::new(2, false, "pin-test"));
    scheduler::start(&sched);

    let target: libc::pid_t = sched.thread_ids()[0];
    let observed: Arc<AtomicI32> = Arc::new(AtomicI32::new(0));

    let task_observed: Arc<AtomicI32> = observed.clone();
    sched.schedule(
        Task::from_call(Box::new(move || {
            let tid: libc::pid_t = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            task_observed.store(tid, Ordering::SeqCst);
        }))
        .pin(target),
    );

    assert!(wait_until(|| observed.load(Ordering::SeqCst) != 0), "pinned task never ran");
    assert_eq!(observed.load(Ordering::SeqCst), target);
    scheduler::stop(&sched);
}

/// Tests if no callable is ever run twice, even when many drain concurrently.
#[test]
fn concurrent_drain_runs_each_task_once() {
    let sched: Arc<Scheduler> = Arc::new(Scheduler::new(4, false, "drain-test"));
    scheduler::start(&sched);

    const TASKS: usize = 200;
    let hits: Vec<Arc<AtomicUsize>> = (0..TASKS).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for hit in &hits {
        let task_hit: Arc<AtomicUsize> = hit.clone();
        sched.schedule(Task::from_call(Box::new(move || {
            task_hit.fetch_add(1, Ordering::SeqCst);
        })));
    }

    assert!(
        wait_until(|| hits.iter().all(|hit| hit.load(Ordering::SeqCst) == 1)),
        "tasks did not drain"
    );
    scheduler::stop(&sched);
    for hit in &hits {
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
