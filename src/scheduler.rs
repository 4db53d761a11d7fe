//! Cooperative, multi-threaded fiber dispatcher.
//!
//! A [`Scheduler`] owns a pool of worker threads that dequeue and run
//! [`Fiber`]s and bare callbacks in insertion order, subject to an optional
//! per-entry thread affinity. [`crate::io_manager::IoManager`] extends this
//! by supplying a [`Reactor`] that drives the idle path with an epoll wait
//! instead of a plain condition variable — composition stands in for the
//! source's subclassing, since Rust has no inheritance.

use crate::config::RuntimeConfig;
use crate::fiber::{self, Fiber, JoinHandle, State};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

/// Thread affinity for a queued entry. `Any` may run on any worker;
/// `Worker(n)` may only run on the worker whose id is `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Any,
    Worker(usize),
}

impl From<Option<usize>> for Affinity {
    fn from(id: Option<usize>) -> Self {
        match id {
            Some(n) => Affinity::Worker(n),
            None => Affinity::Any,
        }
    }
}

enum Work {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

struct QueueEntry {
    work: Work,
    affinity: Affinity,
}

/// Drives a worker's idle path: blocks (bounded by the scheduler's
/// configured max wait) until there's reason to re-check the queue.
/// [`crate::io_manager::IoManager`] supplies the epoll-backed implementation;
/// [`Scheduler::new`] uses [`CondvarReactor`] when none is given.
pub trait Reactor: Send + Sync {
    fn wait(&self, scheduler: &Scheduler);
    fn tickle(&self);
}

struct CondvarReactor {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl CondvarReactor {
    fn new() -> Self {
        CondvarReactor {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
}

impl Reactor for CondvarReactor {
    fn wait(&self, scheduler: &Scheduler) {
        let guard = self.mutex.lock().unwrap();
        let max_wait = scheduler.inner.config.reactor_max_wait_ms;
        let _ = self
            .cond
            .wait_timeout(guard, std::time::Duration::from_millis(max_wait));
    }

    fn tickle(&self) {
        self.cond.notify_all();
    }
}

/// Shared scheduler state; `Fiber` keeps a `Weak<Inner>` back-reference (its
/// "home") so external wakers know where to re-enqueue it.
pub struct Inner {
    queue: Mutex<VecDeque<QueueEntry>>,
    active_workers: AtomicUsize,
    worker_count: usize,
    auto_stop: AtomicBool,
    use_caller: bool,
    reactor: Arc<dyn Reactor>,
    pub(crate) config: RuntimeConfig,
    worker_threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Inner {
    fn stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_workers.load(Ordering::SeqCst) == 0
    }
}

thread_local! {
    static WORKER_ID: std::cell::Cell<Option<usize>> = std::cell::Cell::new(None);
    static CALLBACK_SLOT: std::cell::RefCell<Option<Box<dyn FnOnce()>>> =
        std::cell::RefCell::new(None);
    static CALLBACK_WRAPPER: std::cell::RefCell<Option<Arc<Fiber>>> = std::cell::RefCell::new(None);
}

/// A pool of worker threads dispatching fibers and callbacks.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Spawns `worker_count` fresh worker threads.
    pub fn new(worker_count: usize) -> std::io::Result<Self> {
        Self::with_config(worker_count, RuntimeConfig::default(), false)
    }

    /// As [`Scheduler::new`], but the constructing thread also acts as a
    /// worker (worker id `0`); `stop()` must then be called from that same
    /// thread, and it runs its share of the work while stopping.
    pub fn new_with_caller(worker_count: usize) -> std::io::Result<Self> {
        Self::with_config(worker_count, RuntimeConfig::default(), true)
    }

    pub fn with_config(
        worker_count: usize,
        config: RuntimeConfig,
        use_caller: bool,
    ) -> std::io::Result<Self> {
        Self::with_reactor(worker_count, config, use_caller, Arc::new(CondvarReactor::new()))
    }

    pub(crate) fn with_reactor(
        worker_count: usize,
        config: RuntimeConfig,
        use_caller: bool,
        reactor: Arc<dyn Reactor>,
    ) -> std::io::Result<Self> {
        assert!(worker_count > 0, "a scheduler needs at least one worker");
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            active_workers: AtomicUsize::new(0),
            worker_count,
            auto_stop: AtomicBool::new(false),
            use_caller,
            reactor,
            config,
            worker_threads: Mutex::new(Vec::new()),
        });

        let spawn_from = if use_caller { 1 } else { 0 };
        let mut threads = Vec::new();
        for id in spawn_from..worker_count {
            let inner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("fiberflow-worker-{id}"))
                    .spawn(move || worker_loop(inner, id))?,
            );
        }
        *inner.worker_threads.lock().unwrap() = threads;

        if use_caller {
            WORKER_ID.with(|w| w.set(Some(0)));
            fiber::set_dispatch_fiber(Fiber::current());
        }

        Ok(Scheduler { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Spawns a closure as a new fiber, returning a handle to its eventual
    /// result. `affinity` pins it to a specific worker id, or `None` for
    /// any worker.
    pub fn spawn<F, T>(&self, f: F, affinity: Option<usize>) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (fiber, handle) = fiber::Builder::new()
            .stack_size(self.inner.config.fiber_stack_size)
            .build(f)
            .expect("failed to allocate fiber stack");
        fiber.set_home(Arc::downgrade(&self.inner));
        fiber.set_state(State::Ready);
        enqueue(&self.inner, Work::Fiber(fiber), affinity.into());
        handle
    }

    /// Enqueues a bare callback, run on a reusable per-worker wrapper fiber.
    pub fn spawn_callback<F>(&self, f: F, affinity: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        enqueue(&self.inner, Work::Callback(Box::new(f)), affinity.into());
    }

    /// Cross-thread wakeup: if a worker is idle in its reactor wait, make it
    /// re-check the queue now.
    pub fn tickle(&self) {
        self.inner.reactor.tickle();
    }

    /// Blocks the calling (non-worker) thread until `handle`'s fiber
    /// terminates, returning its result. Safe to call from `main` or a test.
    pub fn join<T>(&self, handle: JoinHandle<T>) -> T {
        handle.join()
    }

    /// Signals shutdown and joins every worker thread (plus runs the
    /// caller's own share of work, in `use_caller` mode).
    pub fn stop(self) {
        self.inner.auto_stop.store(true, Ordering::SeqCst);
        self.inner.reactor.tickle();

        if self.inner.use_caller {
            worker_loop(Arc::clone(&self.inner), 0);
        }

        let threads = std::mem::take(&mut *self.inner.worker_threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }
}

fn enqueue(inner: &Arc<Inner>, work: Work, affinity: Affinity) {
    inner
        .queue
        .lock()
        .unwrap()
        .push_back(QueueEntry { work, affinity });
    inner.reactor.tickle();
}

/// Re-enqueues a fiber that was parked ([`State::Hold`]) and has just become
/// runnable again (a timer fired, an I/O event arrived, a [`crate::sync::Cond`]
/// was signaled). No-op (with a warning) if the fiber's scheduler has since
/// been dropped.
pub(crate) fn wake_parked(fiber: Arc<Fiber>) {
    let Some(home) = fiber.home() else {
        log::warn!("fiber {} woken with no home scheduler", fiber.id());
        return;
    };
    let Some(inner) = Weak::upgrade(&home) else {
        log::debug!(
            "fiber {} woken after its scheduler was dropped",
            fiber.id()
        );
        return;
    };
    enqueue(&inner, Work::Fiber(fiber), Affinity::Any);
}

fn pick_entry(inner: &Inner, worker_id: usize) -> Option<QueueEntry> {
    let mut queue = inner.queue.lock().unwrap();
    let pos = queue.iter().position(|e| match e.affinity {
        Affinity::Any => true,
        Affinity::Worker(id) => id == worker_id,
    })?;
    queue.remove(pos)
}

fn callback_wrapper() -> Arc<Fiber> {
    CALLBACK_WRAPPER.with(|w| {
        if let Some(f) = w.borrow().as_ref() {
            return Arc::clone(f);
        }
        let (fiber, _join) = fiber::Builder::new()
            .name("callback-wrapper")
            .build(|| loop {
                if let Some(cb) = CALLBACK_SLOT.with(|s| s.borrow_mut().take()) {
                    cb();
                }
                fiber::yield_hold();
            })
            .expect("failed to allocate callback wrapper stack");
        *w.borrow_mut() = Some(Arc::clone(&fiber));
        fiber
    })
}

fn run_entry(inner: &Arc<Inner>, entry: QueueEntry) {
    match entry.work {
        Work::Fiber(f) => {
            fiber::switch_to(&f);
            match f.state() {
                State::Ready => enqueue(inner, Work::Fiber(f), entry.affinity),
                State::Hold | State::Term | State::Except => {}
                State::Init | State::Exec => {
                    unreachable!("a fiber cannot still be Init/Exec after being resumed")
                }
            }
        }
        Work::Callback(cb) => {
            let wrapper = callback_wrapper();
            CALLBACK_SLOT.with(|s| *s.borrow_mut() = Some(cb));
            wrapper.set_state(State::Ready);
            fiber::switch_to(&wrapper);
        }
    }
}

fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    WORKER_ID.with(|w| w.set(Some(worker_id)));
    fiber::set_dispatch_fiber(Fiber::current());
    // Every worker thread is opted into cooperative I/O by construction;
    // otherwise fibers dispatched here would silently fall back to blocking
    // syscalls the moment they called into `crate::hook`.
    crate::hook::enable();

    loop {
        if let Some(entry) = pick_entry(&inner, worker_id) {
            inner.active_workers.fetch_add(1, Ordering::SeqCst);
            run_entry(&inner, entry);
            inner.active_workers.fetch_sub(1, Ordering::SeqCst);
            continue;
        }
        if inner.stopping() {
            break;
        }
        let scheduler = Scheduler {
            inner: Arc::clone(&inner),
        };
        inner.reactor.wait(&scheduler);
    }
}

/// The id of the worker thread currently executing, if any.
pub fn current_worker_id() -> Option<usize> {
    WORKER_ID.with(|w| w.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_many_fibers_across_workers() {
        let scheduler = Scheduler::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let counter = Arc::clone(&counter);
                scheduler.spawn(move || counter.fetch_add(1, Ordering::SeqCst), None)
            })
            .collect();
        for h in handles {
            scheduler.join(h);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        scheduler.stop();
    }

    #[test]
    fn affinity_pins_fiber_to_one_worker() {
        let scheduler = Scheduler::new(2).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let handle = scheduler.spawn(
            move || {
                for _ in 0..5 {
                    seen2.lock().unwrap().push(current_worker_id());
                    fiber::yield_ready();
                }
            },
            Some(0),
        );
        scheduler.join(handle);
        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|id| *id == Some(0)));
        scheduler.stop();
    }

    #[test]
    fn callback_runs_without_a_dedicated_stack_each_time() {
        let scheduler = Scheduler::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            scheduler.spawn_callback(move || { counter.fetch_add(1, Ordering::SeqCst); }, None);
        }
        let handle = scheduler.spawn(move || (), None);
        scheduler.join(handle);
        // give callbacks (enqueued before the marker fiber) a chance to run
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        scheduler.stop();
    }
}
