//! Monotonic-ms timer heap.
//!
//! One-shot and recurring timers ordered by absolute expiration, fused into
//! [`crate::io_manager::IoManager`]'s reactor wait. [`TimerManager`] itself
//! doesn't know about fibers or the scheduler — it just tells its owner
//! when callbacks are due; the owner decides how to run them.

use crate::clock::{self, INFINITE};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, Weak};

type Callback = Box<dyn FnMut() + Send>;
pub type TimerId = u64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HeapEntry {
    expires_at: u64,
    id: TimerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so `BinaryHeap` (a max-heap) yields the earliest
        // expiration first, ties broken by id for a strict weak order.
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Record {
    callback: Arc<Mutex<Callback>>,
    /// `Some(period)` for a recurring timer, `None` for one-shot.
    period_ms: Option<u64>,
    /// The delay (or period, for a recurring timer) given at construction,
    /// used by `refresh()` to recompute `now + original_interval`.
    orig_ms: u64,
    witness: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    records: HashMap<TimerId, Record>,
    next_id: TimerId,
    front_tickled: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    on_inserted_at_front: Box<dyn Fn() + Send + Sync>,
}

/// A min-heap of pending timers, shared by handle.
#[derive(Clone)]
pub struct TimerManager(Arc<Shared>);

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    /// A manager with no front-insertion hook (used standalone / in tests).
    pub fn new() -> Self {
        Self::with_hook(|| {})
    }

    /// `on_inserted_at_front` fires at most once between `next_timer_ms()`
    /// calls, the first time an insertion becomes the new earliest timer.
    /// [`crate::io_manager::IoManager`] uses this to tickle the reactor so a
    /// shorter timeout is recomputed instead of waiting for a stale one.
    pub fn with_hook<H>(on_inserted_at_front: H) -> Self
    where
        H: Fn() + Send + Sync + 'static,
    {
        TimerManager(Arc::new(Shared {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                records: HashMap::new(),
                next_id: 1,
                front_tickled: false,
            }),
            on_inserted_at_front: Box::new(on_inserted_at_front),
        }))
    }

    /// Schedules `cb` to run no earlier than `now + ms`.
    pub fn add_timer<F>(&self, ms: u64, recurring: bool, cb: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.add(ms, recurring, None, cb)
    }

    /// As [`TimerManager::add_timer`], but `cb` only runs if `witness` can
    /// still be upgraded when the timer fires — avoids firing into an
    /// object that was destroyed in the meantime.
    pub fn add_condition_timer<T, F>(
        &self,
        ms: u64,
        witness: Weak<T>,
        recurring: bool,
        cb: F,
    ) -> Timer
    where
        T: Send + Sync + 'static,
        F: FnMut() + Send + 'static,
    {
        let check: Box<dyn Fn() -> bool + Send + Sync> =
            Box::new(move || witness.upgrade().is_some());
        self.add(ms, recurring, Some(check), cb)
    }

    fn add<F>(
        &self,
        ms: u64,
        recurring: bool,
        witness: Option<Box<dyn Fn() -> bool + Send + Sync>>,
        cb: F,
    ) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        let expires_at = clock::deadline_ms(ms);
        let mut inner = self.0.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.insert(
            id,
            Record {
                callback: Arc::new(Mutex::new(Box::new(cb))),
                period_ms: if recurring { Some(ms) } else { None },
                orig_ms: ms,
                witness,
            },
        );
        let became_front = inner
            .heap
            .peek()
            .map(|top| expires_at < top.expires_at)
            .unwrap_or(true);
        inner.heap.push(HeapEntry { expires_at, id });
        if became_front && !inner.front_tickled {
            inner.front_tickled = true;
            drop(inner);
            (self.0.on_inserted_at_front)();
        }
        Timer {
            id,
            manager: Arc::downgrade(&self.0),
        }
    }

    /// Milliseconds until the earliest pending timer, or [`INFINITE`] if
    /// none is pending. Clears the front-insertion-tickled latch.
    pub fn next_timer_ms(&self) -> u64 {
        let mut inner = self.0.inner.lock().unwrap();
        inner.front_tickled = false;
        match inner.heap.peek() {
            None => INFINITE,
            Some(top) => {
                let now = clock::now_ms();
                top.expires_at.saturating_sub(now)
            }
        }
    }

    /// Pops every timer due at or before `now_ms`, in due-time order,
    /// returning a thunk per due timer. Recurring timers are reinserted
    /// with a fresh deadline before this returns; their callback is shared
    /// (behind a `Mutex`) rather than moved, so the same `FnMut` runs again
    /// next time.
    pub fn collect_expired(&self, now_ms: u64) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut inner = self.0.inner.lock().unwrap();
        let mut due = Vec::new();
        while let Some(top) = inner.heap.peek().copied() {
            if top.expires_at > now_ms {
                break;
            }
            inner.heap.pop();
            due.push(top.id);
        }

        let mut thunks = Vec::with_capacity(due.len());
        for id in due {
            let Some(record) = inner.records.get(&id) else {
                continue; // cancelled in the meantime
            };
            if let Some(witness) = &record.witness {
                if !witness() {
                    inner.records.remove(&id);
                    continue;
                }
            }
            let callback = Arc::clone(&record.callback);
            if let Some(period) = record.period_ms {
                let next = now_ms.saturating_add(period);
                inner.heap.push(HeapEntry {
                    expires_at: next,
                    id,
                });
            } else {
                inner.records.remove(&id);
            }
            thunks.push(Box::new(move || {
                (callback.lock().unwrap())();
            }) as Box<dyn FnOnce() + Send>);
        }
        thunks
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.0.inner.lock().unwrap();
        let existed = inner.records.remove(&id).is_some();
        if existed {
            // Without this, `next_timer_ms`'s bare `heap.peek()` would still
            // see the cancelled timer's stale entry and report it as due.
            inner.heap.retain(|e| e.id != id);
        }
        existed
    }

    fn refresh(&self, id: TimerId) -> bool {
        let mut inner = self.0.inner.lock().unwrap();
        let Some(orig_ms) = inner.records.get(&id).map(|r| r.orig_ms) else {
            return false;
        };
        reheap(&mut inner, id, clock::deadline_ms(orig_ms));
        true
    }

    fn reset(&self, id: TimerId, ms: u64, from_now: bool) -> bool {
        let mut inner = self.0.inner.lock().unwrap();
        let Some(old_orig_ms) = inner.records.get(&id).map(|r| r.orig_ms) else {
            return false;
        };
        let old_expires_at = inner.heap.iter().find(|e| e.id == id).map(|e| e.expires_at);

        let expires_at = if from_now {
            clock::deadline_ms(ms)
        } else if let Some(old_expires_at) = old_expires_at {
            // Keep the original schedule point, just change the interval.
            old_expires_at
                .saturating_sub(old_orig_ms)
                .saturating_add(ms)
        } else {
            clock::deadline_ms(ms)
        };

        let record = inner.records.get_mut(&id).expect("checked above");
        if record.period_ms.is_some() {
            record.period_ms = Some(ms);
        }
        record.orig_ms = ms;
        reheap(&mut inner, id, expires_at);
        true
    }
}

fn reheap(inner: &mut Inner, id: TimerId, expires_at: u64) {
    inner.heap.retain(|e| e.id != id);
    inner.heap.push(HeapEntry { expires_at, id });
}

/// A handle to a scheduled timer.
pub struct Timer {
    id: TimerId,
    manager: Weak<Shared>,
}

impl Timer {
    /// Removes the timer. Returns `true` iff it was still pending.
    pub fn cancel(&self) -> bool {
        self.with_manager(|m| m.cancel(self.id)).unwrap_or(false)
    }

    /// Re-arms the timer for `now + original_interval`. No-op (returns
    /// `false`) if already cancelled.
    pub fn refresh(&self) -> bool {
        self.with_manager(|m| m.refresh(self.id)).unwrap_or(false)
    }

    /// Changes the timer's interval. If `from_now`, the new deadline is
    /// `now + ms`; otherwise it's re-based from the original schedule
    /// point.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        self.with_manager(|m| m.reset(self.id, ms, from_now))
            .unwrap_or(false)
    }

    fn with_manager<R>(&self, f: impl FnOnce(&TimerManager) -> R) -> Option<R> {
        self.manager.upgrade().map(|shared| f(&TimerManager(shared)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn one_shot_fires_once() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let _timer = mgr.add_timer(0, false, move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(5));
        let due = mgr.collect_expired(clock::now_ms());
        assert_eq!(due.len(), 1);
        for t in due {
            t();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // already consumed: nothing left to collect
        assert!(mgr.collect_expired(clock::now_ms()).is_empty());
    }

    #[test]
    fn recurring_timer_reinserts_itself() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let _timer = mgr.add_timer(0, true, move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(2));
            for t in mgr.collect_expired(clock::now_ms()) {
                t();
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reset_from_now_changes_period_and_next_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10, true, || {});
        // Wait for the first fire so the timer is live at its original cadence.
        loop {
            let due = mgr.collect_expired(clock::now_ms());
            if !due.is_empty() {
                for t in due {
                    t();
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(timer.reset(50, true));
        let wait_ms = mgr.next_timer_ms();
        assert!(wait_ms > 0 && wait_ms <= 50, "wait_ms={wait_ms}");

        // Let the reset deadline fire, then check the new 50ms period governs
        // the next reinsertion rather than the original 10ms one.
        loop {
            let due = mgr.collect_expired(clock::now_ms());
            if !due.is_empty() {
                for t in due {
                    t();
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let wait_ms = mgr.next_timer_ms();
        assert!(wait_ms > 20 && wait_ms <= 50, "wait_ms={wait_ms} should reflect the new period");
    }

    #[test]
    fn cancel_removes_a_pending_timer() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1000, false, || {});
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(mgr.next_timer_ms(), INFINITE);
    }

    #[test]
    fn collect_expired_orders_by_expiration() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, delay) in [(1, 6u64), (2, 0), (3, 3)] {
            let order = Arc::clone(&order);
            mgr.add_timer(delay, false, move || order.lock().unwrap().push(i));
        }
        std::thread::sleep(Duration::from_millis(10));
        for t in mgr.collect_expired(clock::now_ms()) {
            t();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
    }

    #[test]
    fn condition_timer_skips_dead_witness() {
        let mgr = TimerManager::new();
        let witness = Arc::new(());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let _timer =
            mgr.add_condition_timer(0, Arc::downgrade(&witness), false, move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            });
        drop(witness);
        std::thread::sleep(Duration::from_millis(5));
        let due = mgr.collect_expired(clock::now_ms());
        assert!(due.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
