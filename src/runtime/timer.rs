// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Timer manager.
//!
//! Timers are kept in an ordered map keyed by `(absolute deadline, id)`; the
//! id tiebreak makes the order total. The readiness loop derives its blocking
//! timeout from [TimerManager::next_timeout], so an insertion that becomes
//! the new front must wake the loop exactly once: a `tickled` latch
//! suppresses repeat notifications until the next `next_timeout` call clears
//! it.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
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
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Sentinel returned by [TimerManager::next_timeout] when no timer is armed.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// A wall-clock reading this far before the previous one declares a rollover.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Global timer id counter.
static TIMER_ID: AtomicU64 = AtomicU64::new(0);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Callable fired when a timer expires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Handle to an armed timer.
#[derive(Clone)]
pub struct Timer(Arc<TimerInner>);

struct TimerInner {
    /// Insertion identity; orders timers with equal deadlines.
    id: u64,
    /// Whether the timer rearms itself on expiry.
    recurring: bool,
    /// Period and absolute deadline, both in wall-clock milliseconds.
    schedule: Mutex<TimerSchedule>,
    /// Cleared on cancellation and on non-recurring expiry.
    callback: Mutex<Option<TimerCallback>>,
}

struct TimerSchedule {
    period_ms: u64,
    deadline_ms: u64,
}

/// Ordered multiset of timers keyed by absolute deadline.
pub struct TimerManager {
    queue: RwLock<TimerQueue>,
    /// Set when the front of the queue changed since the last `next_timeout`.
    tickled: AtomicBool,
}

struct TimerQueue {
    timers: BTreeMap<(u64, u64), Timer>,
    /// Last wall-clock reading, for rollover detection.
    previous_ms: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Timer Managers
impl TimerManager {
    pub fn new() -> Self {
        Self {
            queue: RwLock::new(TimerQueue {
                timers: BTreeMap::new(),
                previous_ms: now_ms(),
            }),
            tickled: AtomicBool::new(false),
        }
    }

    /// Arms a timer `ms` milliseconds from now. Returns the handle and
    /// whether the timer landed at the front of the queue (in which case the
    /// owner must wake its readiness loop).
    pub fn add(&self, ms: u64, callback: TimerCallback, recurring: bool) -> (Timer, bool) {
        self.add_at(now_ms(), ms, callback, recurring)
    }

    /// Arms a timer whose callable only fires if `witness` is still alive at
    /// expiry.
    pub fn add_conditional<T>(&self, ms: u64, callback: TimerCallback, witness: Weak<T>, recurring: bool) -> (Timer, bool)
    where
        T: Send + Sync + 'static,
    {
        let conditional: TimerCallback = Arc::new(move || {
            if witness.upgrade().is_some() {
                callback();
            }
        });
        self.add(ms, conditional, recurring)
    }

    /// Cancels a timer, detaching its callable. Fails if the timer already
    /// fired or was already cancelled.
    pub fn cancel(&self, timer: &Timer) -> bool {
        let mut queue: RwLockWriteGuard<'_, TimerQueue> = self.write();
        let mut callback = timer.0.callback.lock().expect("timer lock poisoned");
        if callback.is_none() {
            return false;
        }
        *callback = None;

        let key: (u64, u64) = timer.key();
        queue.timers.remove(&key);
        true
    }

    /// Re-anchors a timer's deadline to `now + period`.
    pub fn refresh(&self, timer: &Timer) -> bool {
        self.refresh_at(now_ms(), timer)
    }

    /// Changes a timer's period. The new deadline is anchored at `now` when
    /// `from_now` is set, else at the previously stored anchor
    /// (`deadline - old period`). Reports front insertions like [Self::add].
    pub fn reset(&self, timer: &Timer, ms: u64, from_now: bool) -> (bool, bool) {
        self.reset_at(now_ms(), timer, ms, from_now)
    }

    /// Milliseconds until the earliest deadline: zero if one is overdue,
    /// [NO_TIMEOUT] if the queue is empty. Clears the notification latch.
    pub fn next_timeout(&self) -> u64 {
        self.next_timeout_at(now_ms())
    }

    /// Detaches and returns the callables of all expired timers, in
    /// non-decreasing deadline order. Recurring timers are rearmed. On clock
    /// rollover every pending timer is drained regardless of deadline.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        self.take_expired_at(now_ms())
    }

    /// Reports whether any timer is armed.
    pub fn has_timer(&self) -> bool {
        !self.read().timers.is_empty()
    }

    fn add_at(&self, now: u64, ms: u64, callback: TimerCallback, recurring: bool) -> (Timer, bool) {
        let timer: Timer = Timer(Arc::new(TimerInner {
            id: TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            schedule: Mutex::new(TimerSchedule {
                period_ms: ms,
                deadline_ms: now.saturating_add(ms),
            }),
            callback: Mutex::new(Some(callback)),
        }));

        let mut queue: RwLockWriteGuard<'_, TimerQueue> = self.write();
        let key: (u64, u64) = timer.key();
        queue.timers.insert(key, timer.clone());
        let at_front: bool = self.note_front(&queue, key);
        (timer, at_front)
    }

    fn refresh_at(&self, now: u64, timer: &Timer) -> bool {
        let mut queue: RwLockWriteGuard<'_, TimerQueue> = self.write();
        if timer.0.callback.lock().expect("timer lock poisoned").is_none() {
            return false;
        }

        let mut schedule: MutexGuard<'_, TimerSchedule> = timer.0.schedule.lock().expect("timer lock poisoned");
        let key: (u64, u64) = (schedule.deadline_ms, timer.0.id);
        if queue.timers.remove(&key).is_none() {
            return false;
        }
        schedule.deadline_ms = now.saturating_add(schedule.period_ms);
        queue.timers.insert((schedule.deadline_ms, timer.0.id), timer.clone());
        true
    }

    fn reset_at(&self, now: u64, timer: &Timer, ms: u64, from_now: bool) -> (bool, bool) {
        {
            let schedule: MutexGuard<'_, TimerSchedule> = timer.0.schedule.lock().expect("timer lock poisoned");
            if ms == schedule.period_ms && !from_now {
                return (true, false);
            }
        }

        let mut queue: RwLockWriteGuard<'_, TimerQueue> = self.write();
        if timer.0.callback.lock().expect("timer lock poisoned").is_none() {
            return (false, false);
        }

        let mut schedule: MutexGuard<'_, TimerSchedule> = timer.0.schedule.lock().expect("timer lock poisoned");
        let key: (u64, u64) = (schedule.deadline_ms, timer.0.id);
        if queue.timers.remove(&key).is_none() {
            return (false, false);
        }

        let anchor: u64 = if from_now {
            now
        } else {
            schedule.deadline_ms.saturating_sub(schedule.period_ms)
        };
        schedule.period_ms = ms;
        schedule.deadline_ms = anchor.saturating_add(ms);
        let key: (u64, u64) = (schedule.deadline_ms, timer.0.id);
        queue.timers.insert(key, timer.clone());
        drop(schedule);

        let at_front: bool = self.note_front(&queue, key);
        (true, at_front)
    }

    fn next_timeout_at(&self, now: u64) -> u64 {
        let queue: RwLockReadGuard<'_, TimerQueue> = self.read();

        // Rearm front-insertion notifications.
        self.tickled.store(false, Ordering::Release);

        match queue.timers.keys().next() {
            Some(&(deadline_ms, _)) if deadline_ms > now => deadline_ms - now,
            Some(_) => 0,
            None => NO_TIMEOUT,
        }
    }

    fn take_expired_at(&self, now: u64) -> Vec<TimerCallback> {
        let mut queue: RwLockWriteGuard<'_, TimerQueue> = self.write();

        // A clock that went backwards by more than the rollover window makes
        // every absolute deadline meaningless: drain them all.
        let rollover: bool = now < queue.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
        queue.previous_ms = now;
        if rollover {
            warn!("take_expired(): clock rollover detected, draining all timers");
        }

        let mut expired: Vec<TimerCallback> = Vec::new();
        loop {
            let key: (u64, u64) = match queue.timers.keys().next() {
                Some(&key) if rollover || key.0 <= now => key,
                _ => break,
            };
            let timer: Timer = queue.timers.remove(&key).expect("front key vanished under the write lock");

            if timer.0.recurring {
                if let Some(callback) = timer.0.callback.lock().expect("timer lock poisoned").clone() {
                    expired.push(callback);
                }
                let mut schedule: MutexGuard<'_, TimerSchedule> =
                    timer.0.schedule.lock().expect("timer lock poisoned");
                schedule.deadline_ms = now.saturating_add(schedule.period_ms);
                let key: (u64, u64) = (schedule.deadline_ms, timer.0.id);
                drop(schedule);
                queue.timers.insert(key, timer);
            } else if let Some(callback) = timer.0.callback.lock().expect("timer lock poisoned").take() {
                expired.push(callback);
            }
        }
        expired
    }

    /// Latches a front insertion. Reports true at most once between two
    /// consecutive `next_timeout` calls.
    fn note_front(&self, queue: &TimerQueue, key: (u64, u64)) -> bool {
        if queue.timers.keys().next() == Some(&key) {
            !self.tickled.swap(true, Ordering::AcqRel)
        } else {
            false
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TimerQueue> {
        self.queue.read().expect("timer queue lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, TimerQueue> {
        self.queue.write().expect("timer queue lock poisoned")
    }
}

/// Associate Functions for Timers
impl Timer {
    fn key(&self) -> (u64, u64) {
        let schedule: MutexGuard<'_, TimerSchedule> = self.0.schedule.lock().expect("timer lock poisoned");
        (schedule.deadline_ms, self.0.id)
    }

    /// Absolute deadline in wall-clock milliseconds.
    pub fn deadline_ms(&self) -> u64 {
        self.key().0
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Current wall-clock time in milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Timer Managers
impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        TimerCallback,
        TimerManager,
        NO_TIMEOUT,
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    };

    fn counting_callback(order: &Arc<Mutex<Vec<usize>>>, tag: usize) -> TimerCallback {
        let order: Arc<Mutex<Vec<usize>>> = order.clone();
        Arc::new(move || order.lock().unwrap().push(tag))
    }

    #[test]
    fn expired_timers_drain_in_deadline_order() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let now: u64 = 1_000_000;

        // Anchor the rollover detector at the synthetic clock.
        crate::ensure_eq!(manager.take_expired_at(now).len(), 0);

        manager.add_at(now, 300, counting_callback(&order, 3), false);
        manager.add_at(now, 100, counting_callback(&order, 1), false);
        manager.add_at(now, 200, counting_callback(&order, 2), false);

        let expired: Vec<TimerCallback> = manager.take_expired_at(now + 1_000);
        crate::ensure_eq!(expired.len(), 3);
        for callback in expired {
            callback();
        }
        crate::ensure_eq!(order.lock().unwrap().clone(), vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn only_overdue_timers_drain() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let now: u64 = 1_000_000;

        crate::ensure_eq!(manager.take_expired_at(now).len(), 0);
        manager.add_at(now, 100, counting_callback(&order, 1), false);
        manager.add_at(now, 10_000, counting_callback(&order, 2), false);

        let expired: Vec<TimerCallback> = manager.take_expired_at(now + 150);
        crate::ensure_eq!(expired.len(), 1);
        crate::ensure_eq!(manager.has_timer(), true);
        Ok(())
    }

    #[test]
    fn recurring_timer_rearms_itself() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let now: u64 = 1_000_000;

        crate::ensure_eq!(manager.take_expired_at(now).len(), 0);
        let (timer, _) = manager.add_at(now, 100, counting_callback(&order, 1), true);
        crate::ensure_eq!(manager.take_expired_at(now + 100).len(), 1);
        crate::ensure_eq!(manager.take_expired_at(now + 200).len(), 1);
        crate::ensure_eq!(manager.cancel(&timer), true);
        crate::ensure_eq!(manager.has_timer(), false);
        Ok(())
    }

    #[test]
    fn front_insertion_reports_once_until_next_timeout() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let callback: TimerCallback = Arc::new(|| {});
        let now: u64 = 1_000_000;

        // First timer becomes the front and reports it.
        let (_, at_front) = manager.add_at(now, 5_000, callback.clone(), false);
        crate::ensure_eq!(at_front, true);

        // An even earlier timer is the new front, but the latch is still set.
        let (_, at_front) = manager.add_at(now, 1, callback.clone(), false);
        crate::ensure_eq!(at_front, false);

        // The poll loop re-reads its timeout, clearing the latch.
        crate::ensure_eq!(manager.next_timeout_at(now), 1);

        let (_, at_front) = manager.add_at(now, 0, callback.clone(), false);
        crate::ensure_eq!(at_front, true);

        // Timers behind the front never report.
        let (_, at_front) = manager.add_at(now, 60_000, callback, false);
        crate::ensure_eq!(at_front, false);
        Ok(())
    }

    #[test]
    fn next_timeout_reports_delta_zero_or_sentinel() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let now: u64 = 1_000_000;
        crate::ensure_eq!(manager.next_timeout_at(now), NO_TIMEOUT);

        manager.add_at(now, 250, Arc::new(|| {}), false);
        crate::ensure_eq!(manager.next_timeout_at(now), 250);
        crate::ensure_eq!(manager.next_timeout_at(now + 100), 150);
        crate::ensure_eq!(manager.next_timeout_at(now + 300), 0);
        Ok(())
    }

    #[test]
    fn cancel_detaches_the_callable_once() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let now: u64 = 1_000_000;
        let (timer, _) = manager.add_at(now, 100, Arc::new(|| {}), false);

        crate::ensure_eq!(manager.cancel(&timer), true);
        crate::ensure_eq!(manager.cancel(&timer), false);
        crate::ensure_eq!(manager.refresh_at(now, &timer), false);
        crate::ensure_eq!(manager.take_expired_at(now + 1_000).len(), 0);
        Ok(())
    }

    #[test]
    fn refresh_pushes_the_deadline_out() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let now: u64 = 1_000_000;
        let (timer, _) = manager.add_at(now, 100, Arc::new(|| {}), false);

        crate::ensure_eq!(manager.refresh_at(now + 80, &timer), true);
        crate::ensure_eq!(manager.next_timeout_at(now + 80), 100);
        Ok(())
    }

    #[test]
    fn reset_anchors_from_now_or_origin() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let now: u64 = 1_000_000;
        let (timer, _) = manager.add_at(now, 100, Arc::new(|| {}), false);

        // Same period, not from now: nothing to do.
        let (ok, _) = manager.reset_at(now + 50, &timer, 100, false);
        crate::ensure_eq!(ok, true);
        crate::ensure_eq!(manager.next_timeout_at(now + 50), 50);

        // Anchor at the original insertion point.
        let (ok, _) = manager.reset_at(now + 50, &timer, 500, false);
        crate::ensure_eq!(ok, true);
        crate::ensure_eq!(manager.next_timeout_at(now + 50), 450);

        // Anchor at the current time.
        let (ok, _) = manager.reset_at(now + 50, &timer, 100, true);
        crate::ensure_eq!(ok, true);
        crate::ensure_eq!(manager.next_timeout_at(now + 50), 100);
        Ok(())
    }

    #[test]
    fn clock_rollover_drains_every_timer() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let now: u64 = 10_000_000;

        // Anchor the previous observation.
        crate::ensure_eq!(manager.take_expired_at(now).len(), 0);

        manager.add_at(now, 10_000, Arc::new(|| {}), false);
        manager.add_at(now, 60_000, Arc::new(|| {}), false);

        // Jump the clock back by two hours.
        let expired: Vec<TimerCallback> = manager.take_expired_at(now - 2 * 60 * 60 * 1000);
        crate::ensure_eq!(expired.len(), 2);
        crate::ensure_eq!(manager.has_timer(), false);
        Ok(())
    }

    #[test]
    fn conditional_timer_noops_when_witness_is_gone() -> Result<()> {
        let manager: TimerManager = TimerManager::new();
        let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let live: Arc<usize> = Arc::new(0);
        let dead: Arc<usize> = Arc::new(0);

        let live_hits: Arc<AtomicUsize> = hits.clone();
        manager.add_conditional(0, Arc::new(move || {
            live_hits.fetch_add(1, Ordering::SeqCst);
        }), Arc::downgrade(&live), false);

        let dead_hits: Arc<AtomicUsize> = hits.clone();
        manager.add_conditional(0, Arc::new(move || {
            dead_hits.fetch_add(10, Ordering::SeqCst);
        }), Arc::downgrade(&dead), false);
        drop(dead);

        for callback in manager.take_expired_at(super::now_ms() + 1_000) {
            callback();
        }
        crate::ensure_eq!(hits.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
