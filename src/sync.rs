//! Fiber-aware synchronization primitives.
//!
//! Within one worker thread, fibers never truly run concurrently, so a
//! condition variable doesn't need a paired mutex the way `pthread_cond`
//! does — it only needs a wait queue protected against concurrent access
//! *across* worker threads, which is what the inner `Mutex` below is for.
//! [`Cond`] and [`Latch`] carry over the teacher's `fiber::Cond` and
//! `fiber::Latch`/`LatchGuard` shape, adapted to park and wake this crate's
//! own [`crate::fiber::Fiber`] instead of calling into an external engine.

use crate::fiber::{self, Fiber, FiberId, State};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// A fiber-aware condition variable.
///
/// Call [`Cond::wait`] to park the calling fiber until [`Cond::signal`] or
/// [`Cond::broadcast`] wakes it. Like `pthread_cond`, spurious wakeups are
/// possible if the waiter is resumed by some other means; callers should
/// loop on their own predicate, as [`crate::fiber::JoinHandle::join`] does.
///
/// `wait` also works from a plain OS thread with no fiber running under a
/// scheduler (e.g. a test or a `main` that just wants to block on a
/// [`crate::fiber::JoinHandle`]) — in that case it blocks the thread on an
/// internal [`Condvar`] instead of parking a fiber.
#[derive(Debug, Default)]
pub struct Cond {
    waiters: Mutex<VecDeque<Arc<Fiber>>>,
    external: Mutex<()>,
    external_cond: Condvar,
}

impl Cond {
    pub fn new() -> Self {
        Cond {
            waiters: Mutex::new(VecDeque::new()),
            external: Mutex::new(()),
            external_cond: Condvar::new(),
        }
    }

    /// Suspends the caller until woken. Parks the current fiber if one is
    /// running under a scheduler on this thread; otherwise blocks the OS
    /// thread.
    pub fn wait(&self) {
        if fiber::dispatch_fiber().is_some() || Fiber::current().home().is_some() {
            let me = Fiber::current();
            self.waiters.lock().unwrap().push_back(Arc::clone(&me));
            me.set_state(State::Hold);
            fiber::yield_now();
        } else {
            let guard = self.external.lock().unwrap();
            let _ = self
                .external_cond
                .wait_timeout(guard, std::time::Duration::from_millis(50));
        }
    }

    /// Wakes one waiting fiber, if any, and every external waiter. Does not
    /// yield.
    pub fn signal(&self) {
        if let Some(fiber) = self.waiters.lock().unwrap().pop_front() {
            wake(&fiber);
        }
        self.external_cond.notify_all();
    }

    /// Wakes every waiting fiber and every external waiter. Does not yield.
    pub fn broadcast(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        for fiber in waiters.drain(..) {
            wake(&fiber);
        }
        self.external_cond.notify_all();
    }
}

fn wake(fiber: &Arc<Fiber>) {
    fiber.set_state(State::Ready);
    crate::scheduler::wake_parked(Arc::clone(fiber));
}

/// A mutual-exclusion lock usable from fiber code, where a contending
/// acquire parks the calling fiber via [`Cond`] instead of blocking the OS
/// thread.
#[derive(Debug)]
pub struct Latch {
    locked: Mutex<Option<FiberId>>,
    cond: Cond,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Latch {
            locked: Mutex::new(None),
            cond: Cond::new(),
        }
    }

    /// Waits indefinitely until the current fiber can gain access to the
    /// latch.
    pub fn lock(&self) -> LatchGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            self.cond.wait();
        }
    }

    /// Returns immediately with `None` if the latch is currently held.
    pub fn try_lock(&self) -> Option<LatchGuard<'_>> {
        let mut locked = self.locked.lock().unwrap();
        if locked.is_some() {
            return None;
        }
        *locked = Some(Fiber::current().id());
        Some(LatchGuard { latch: self })
    }
}

/// An RAII "scoped lock" of a [`Latch`]. Dropping it unlocks the latch and
/// wakes one waiter, if any.
#[derive(Debug)]
pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        *self.latch.locked.lock().unwrap() = None;
        self.latch.cond.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn latch_serializes_two_fibers() {
        let scheduler = Scheduler::new(2).unwrap();
        let latch = Arc::new(Latch::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let latch = Arc::clone(&latch);
            let counter = Arc::clone(&counter);
            handles.push(scheduler.spawn(
                move || {
                    let _guard = latch.lock();
                    let before = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(before + 1, counter.load(Ordering::SeqCst));
                },
                None,
            ));
        }
        for h in handles {
            scheduler.join(h);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        scheduler.stop();
    }

    #[test]
    fn cond_signal_wakes_single_waiter() {
        let scheduler = Scheduler::new(1).unwrap();
        let cond = Arc::new(Cond::new());
        let woken = Arc::new(AtomicUsize::new(0));

        let cond2 = Arc::clone(&cond);
        let woken2 = Arc::clone(&woken);
        let waiter = scheduler.spawn(
            move || {
                cond2.wait();
                woken2.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        scheduler.spawn(move || cond.signal(), None);
        scheduler.join(waiter);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }
}
