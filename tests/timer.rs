// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    sync::{
        atomic::{
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
    Config,
    IoManager,
    SharedIoManager,
    Timer,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const DEADLINE: Duration = Duration::from_secs(5);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

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

/// Tests if a short timer fires promptly even though the readiness loop was
/// already blocking on a much later deadline.
#[test]
fn short_timer_cuts_a_long_poll_short() {
    let io: SharedIoManager = match IoManager::new(Config::default(), 1, false, "timer-short") {
        Ok(io) => io,
        Err(e) => panic!("failed to create I/O manager: {:?}", e.cause),
    };

    // Arm a far-away timer first so the loop blocks on it.
    let long_timer: Timer = io.add_timer(10_000, Arc::new(|| {}), false);
    thread::sleep(Duration::from_millis(50));

    let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let timer_hits: Arc<AtomicUsize> = hits.clone();
    let start: Instant = Instant::now();
    io.add_timer(
        1,
        Arc::new(move || {
            timer_hits.fetch_add(1, Ordering::SeqCst);
        }),
        false,
    );

    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1), "short timer never fired");
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "short timer waited for the long deadline"
    );

    assert!(io.cancel_timer(&long_timer));
    IoManager::stop(&io);
}

/// Tests if a recurring timer keeps firing until cancelled.
#[test]
fn recurring_timer_fires_repeatedly() {
    let io: SharedIoManager = match IoManager::new(Config::default(), 1, false, "timer-recurring") {
        Ok(io) => io,
        Err(e) => panic!("failed to create I/O manager: {:?}", e.cause),
    };

    let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let timer_hits: Arc<AtomicUsize> = hits.clone();
    let timer: Timer = io.add_timer(
        10,
        Arc::new(move || {
            timer_hits.fetch_add(1, Ordering::SeqCst);
        }),
        true,
    );

    assert!(wait_until(|| hits.load(Ordering::SeqCst) >= 3), "recurring timer stalled");
    assert!(io.cancel_timer(&timer));
    IoManager::stop(&io);
}

/// Tests if a conditional timer whose witness died is a no-op.
#[test]
fn conditional_timer_respects_its_witness() {
    let io: SharedIoManager = match IoManager::new(Config::default(), 1, false, "timer-conditional") {
        Ok(io) => io,
        Err(e) => panic!("failed to create I/O manager: {:?}", e.cause),
    };

    let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let witness: Arc<usize> = Arc::new(0);

    let timer_hits: Arc<AtomicUsize> = hits.clone();
    io.add_conditional_timer(
        20,
        Arc::new(move || {
            timer_hits.fetch_add(1, Ordering::SeqCst);
        }),
        Arc::downgrade(&witness),
        false,
    );
    drop(witness);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    IoManager::stop(&io);
}

/// Tests if refresh and reset reshape a pending timer instead of firing it.
#[test]
fn reset_reshapes_a_pending_timer() {
    let io: SharedIoManager = match IoManager::new(Config::default(), 1, false, "timer-reset") {
        Ok(io) => io,
        Err(e) => panic!("failed to create I/O manager: {:?}", e.cause),
    };

    let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let timer_hits: Arc<AtomicUsize> = hits.clone();
    let timer: Timer = io.add_timer(
        60_000,
        Arc::new(move || {
            timer_hits.fetch_add(1, Ordering::SeqCst);
        }),
        false,
    );

    // Pull the deadline in from a minute to (nearly) now.
    assert!(io.refresh_timer(&timer));
    assert!(io.reset_timer(&timer, 10, true));

    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1), "reset timer never fired");
    IoManager::stop(&io);
}
