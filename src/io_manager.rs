//! Edge-triggered I/O reactor, extending the scheduler.
//!
//! [`IoManager`] composes a [`Scheduler`] with a [`Reactor`] implementation
//! that drives its idle path with `epoll_wait` (edge-triggered) fused with
//! the [`TimerManager`]'s next deadline, instead of the plain condition
//! variable [`crate::scheduler::CondvarReactor`] uses. Rust has no
//! subclassing, so "the I/O Manager extends the Scheduler" is expressed as
//! composition plus the `Reactor` trait, the same adaptation the teacher's
//! `coio` module makes of the source's raw-libc calling convention.
//!
//! The per-registration token the source passes through the kernel's
//! readiness record (the address of a `FdContext`) is, here, simply the fd
//! itself — [`FdTable`] already provides O(1) lookup by fd, so there's no
//! need for a raw pointer and the aliasing it would require.

use crate::clock;
use crate::error::{Error, Result};
use crate::fd_table::{Event, FdTable, Waiter};
use crate::fiber::{self, Fiber, State};
use crate::scheduler::{Reactor, Scheduler};
use crate::timer::TimerManager;
use once_cell::sync::Lazy;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// The most recently constructed [`IoManager`], if any is still alive.
///
/// A process typically runs a single reactor; this lets [`crate::hook`]'s
/// free functions (`sleep`, `read`, `connect`, ...) reach it without every
/// call site threading an explicit handle through, the same convenience the
/// teacher's code gets for free from Tarantool's single embedded engine.
static CURRENT: Lazy<RwLock<Option<Weak<IoManager>>>> = Lazy::new(|| RwLock::new(None));

struct ReactorCore {
    epoll_fd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    fds: Arc<FdTable>,
    timers: TimerManager,
    pending: AtomicUsize,
    max_batch: usize,
}

impl ReactorCore {
    fn new(fds: Arc<FdTable>, max_batch: usize) -> Result<Arc<Self>> {
        // SAFETY: straightforward FFI; every call's return value is checked.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io_err("epoll_create1"));
        }
        let mut pipe_fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io_err("pipe2"));
        }
        let [wake_read, wake_write] = pipe_fds;

        let core = Arc::new(ReactorCore {
            epoll_fd,
            wake_read,
            wake_write,
            fds,
            timers: TimerManager::new(),
            pending: AtomicUsize::new(0),
            max_batch,
        });
        core.add_to_epoll(wake_read, libc::EPOLLIN as u32)?;
        Ok(core)
    }

    fn add_to_epoll(&self, fd: RawFd, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: events | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            return Err(Error::ReactorProgramming {
                fd,
                op: "epoll_ctl(ADD)",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn reprogram(&self, fd: RawFd, mask: Event) -> Result<()> {
        if mask.is_empty() {
            let rc = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(Error::ReactorProgramming {
                        fd,
                        op: "epoll_ctl(DEL)",
                        source: err,
                    });
                }
            }
            return Ok(());
        }
        let mut ev = libc::epoll_event {
            events: to_raw(mask) | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
            if rc == 0 {
                return Ok(());
            }
            return Err(Error::ReactorProgramming {
                fd,
                op: "epoll_ctl(ADD)",
                source: std::io::Error::last_os_error(),
            });
        }
        Err(Error::ReactorProgramming {
            fd,
            op: "epoll_ctl(MOD)",
            source: err,
        })
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: `wake_read` is our own self-pipe, opened O_NONBLOCK.
            let n = unsafe {
                libc::read(self.wake_read, buf.as_mut_ptr() as *mut _, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn tickle(&self) {
        let byte = [1u8];
        // SAFETY: `wake_write` is our own self-pipe; EAGAIN (pipe already
        // has a pending byte) is an expected, harmless outcome.
        unsafe {
            libc::write(self.wake_write, byte.as_ptr() as *const _, 1);
        }
    }

    /// One reactor pass: wait for readiness or the next timer, enqueue
    /// expired timer callbacks, then wake up whatever became ready.
    fn wait(&self, scheduler: &Scheduler) {
        let max_wait_ms = scheduler.inner().config.reactor_max_wait_ms;
        let timer_wait_ms = self.timers.next_timer_ms();
        let wait_ms = if timer_wait_ms == clock::INFINITE {
            max_wait_ms
        } else {
            timer_wait_ms.min(max_wait_ms)
        };

        let mut events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            self.max_batch.max(1)
        ];
        // SAFETY: `events` has `max_batch` valid slots for epoll to fill.
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                wait_ms as i32,
            )
        };
        let n = if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                log::warn!("epoll_wait failed: {err}");
            }
            0
        } else {
            n as usize
        };

        let now = clock::now_ms();
        for callback in self.timers.collect_expired(now) {
            scheduler.spawn_callback(callback, None);
        }

        for ev in &events[..n] {
            let fd = ev.u64 as RawFd;
            if fd == self.wake_read {
                self.drain_wake_pipe();
                continue;
            }
            let observed = translate(ev.events);
            let triggered = self.fds.with(fd, |ctx| {
                let real = observed & ctx.registered();
                if real.is_empty() {
                    return Vec::new();
                }
                let mut woken = Vec::new();
                for event in [Event::READ, Event::WRITE] {
                    if real.contains(event) {
                        if let Some(waiter) = ctx.unregister(event) {
                            woken.push(waiter);
                        }
                    }
                }
                let remaining = ctx.registered();
                (fd, remaining, woken)
            });
            if let Some((fd, remaining, woken)) = triggered {
                if !woken.is_empty() {
                    self.pending.fetch_sub(woken.len(), Ordering::SeqCst);
                    if let Err(e) = self.reprogram(fd, remaining) {
                        log::warn!("{e}");
                    }
                    for w in woken {
                        trigger(w, scheduler);
                    }
                }
            }
        }
    }
}

fn translate(raw: u32) -> Event {
    let mut e = Event::empty();
    if raw & libc::EPOLLIN as u32 != 0 {
        e.insert(Event::READ);
    }
    if raw & libc::EPOLLOUT as u32 != 0 {
        e.insert(Event::WRITE);
    }
    if raw & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
        e.insert(Event::READ | Event::WRITE);
    }
    e
}

fn to_raw(event: Event) -> u32 {
    let mut raw = 0u32;
    if event.contains(Event::READ) {
        raw |= libc::EPOLLIN as u32;
    }
    if event.contains(Event::WRITE) {
        raw |= libc::EPOLLOUT as u32;
    }
    raw
}

fn trigger(waiter: Waiter, scheduler: &Scheduler) {
    match waiter {
        Waiter::Fiber(f) => {
            f.set_state(State::Ready);
            crate::scheduler::wake_parked(f);
        }
        Waiter::Callback(cb) => scheduler.spawn_callback(cb, None),
    }
}

fn io_err(op: &'static str) -> Error {
    Error::ReactorProgramming {
        fd: -1,
        op,
        source: std::io::Error::last_os_error(),
    }
}

impl Reactor for ReactorCore {
    fn wait(&self, scheduler: &Scheduler) {
        ReactorCore::wait(self, scheduler)
    }

    fn tickle(&self) {
        ReactorCore::tickle(self)
    }
}

impl Drop for ReactorCore {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// A [`Scheduler`] whose idle path is an edge-triggered epoll reactor fused
/// with a timer heap.
pub struct IoManager {
    scheduler: Scheduler,
    core: Arc<ReactorCore>,
    fds: Arc<FdTable>,
}

impl IoManager {
    pub fn new(worker_count: usize) -> Result<Arc<Self>> {
        Self::with_config(worker_count, crate::config::RuntimeConfig::default(), false)
    }

    pub fn new_with_caller(worker_count: usize) -> Result<Arc<Self>> {
        Self::with_config(worker_count, crate::config::RuntimeConfig::default(), true)
    }

    pub fn with_config(
        worker_count: usize,
        config: crate::config::RuntimeConfig,
        use_caller: bool,
    ) -> Result<Arc<Self>> {
        let fds = Arc::new(FdTable::new());
        let core = ReactorCore::new(Arc::clone(&fds), config.reactor_max_batch)?;
        let scheduler =
            Scheduler::with_reactor(worker_count, config, use_caller, core.clone() as Arc<dyn Reactor>)
                .map_err(Error::Io)?;
        let manager = Arc::new(IoManager {
            scheduler,
            core,
            fds,
        });
        *CURRENT.write().unwrap() = Some(Arc::downgrade(&manager));
        Ok(manager)
    }

    /// The process's current reactor, if one is alive. Used by [`crate::hook`].
    pub(crate) fn current() -> Option<Arc<IoManager>> {
        CURRENT.read().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Registers interest in `event` on `fd` for the calling fiber, parks
    /// it, and returns once woken (or [`Error::TimedOut`] once `timeout_ms`
    /// elapses, unless it's [`clock::INFINITE`]) — the park/wake half of the
    /// check-wouldblock/register/yield/retry loop [`crate::hook`]'s wrappers
    /// run around each raw syscall.
    pub fn wait_for_event(&self, fd: RawFd, event: Event, timeout_ms: u64) -> Result<()> {
        self.add_event(fd, event, None)?;
        let timed_out = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let timer = (timeout_ms != clock::INFINITE).then(|| {
            let timed_out = Arc::clone(&timed_out);
            self.core.timers.add_timer(timeout_ms, false, move || {
                // `cancel_event` only finds something to cancel if the fiber
                // is still genuinely waiting; if real readiness already woke
                // it (on another worker, racing this callback), there's
                // nothing left to cancel and the timeout must not count.
                let cancelled = IoManager::current()
                    .map(|io| io.cancel_event(fd, event))
                    .unwrap_or(false);
                if cancelled {
                    timed_out.store(true, Ordering::SeqCst);
                }
            })
        });
        fiber::yield_hold();
        if let Some(t) = timer {
            t.cancel();
        }
        if timed_out.load(Ordering::SeqCst) {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn fds(&self) -> &Arc<FdTable> {
        &self.fds
    }

    pub fn timers(&self) -> &TimerManager {
        &self.core.timers
    }

    /// Number of outstanding `add_event` registrations not yet triggered,
    /// deleted, or cancelled. Used by tests asserting the reactor returns to
    /// its initial state.
    pub fn pending_events(&self) -> usize {
        self.core.pending.load(Ordering::SeqCst)
    }

    /// Registers interest in `event` on `fd`, without parking anything.
    /// With `callback = None`, the calling fiber becomes the registration's
    /// waiter, to be woken by a later `cancel_event`/reactor readiness —
    /// most callers want [`IoManager::wait_for_event`], which also parks.
    /// With `Some(cb)`, `cb` runs (on a scheduler callback fiber) instead.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        let waiter = callback.map(Waiter::Callback).unwrap_or_else(|| Waiter::Fiber(Fiber::current()));
        let outcome = self
            .fds
            .with_or_create(fd, |ctx| ctx.register(event, waiter).map(|()| ctx.registered()));
        let mask = outcome.map_err(|_| Error::AlreadyRegistered {
            fd,
            event: event_name(event),
        })?;
        self.core.pending.fetch_add(1, Ordering::SeqCst);
        self.core.reprogram(fd, mask)
    }

    /// Unregisters `event` on `fd` without triggering it. Returns `false`
    /// if nothing was registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let outcome = self
            .fds
            .with(fd, |ctx| ctx.unregister(event).map(|_| ctx.registered()))
            .flatten();
        match outcome {
            Some(mask) => {
                self.core.pending.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = self.core.reprogram(fd, mask) {
                    log::warn!("{e}");
                }
                true
            }
            None => false,
        }
    }

    /// Unregisters `event` on `fd` and resumes its waiter as if it had
    /// become ready. Returns `false` if nothing was registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let outcome = self
            .fds
            .with(fd, |ctx| ctx.unregister(event).map(|w| (w, ctx.registered())))
            .flatten();
        match outcome {
            Some((waiter, mask)) => {
                self.core.pending.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = self.core.reprogram(fd, mask) {
                    log::warn!("{e}");
                }
                trigger(waiter, &self.scheduler);
                true
            }
            None => false,
        }
    }

    /// Unregisters and triggers both directions on `fd`, leaving its
    /// `FdContext` otherwise intact.
    pub fn cancel_all(&self, fd: RawFd) {
        let waiters = self.fds.with(fd, |ctx| ctx.take_all()).unwrap_or_default();
        if waiters.is_empty() {
            return;
        }
        self.core.pending.fetch_sub(waiters.len(), Ordering::SeqCst);
        if let Err(e) = self.core.reprogram(fd, Event::empty()) {
            log::warn!("{e}");
        }
        for w in waiters {
            trigger(w, &self.scheduler);
        }
    }

    /// `cancel_all` plus removing the fd's context entirely, matching
    /// [`crate::hook::close`]'s "cancel, then forget this fd" contract.
    pub fn forget(&self, fd: RawFd) {
        let waiters = self.fds.remove(fd);
        if waiters.is_empty() {
            return;
        }
        self.core.pending.fetch_sub(waiters.len(), Ordering::SeqCst);
        if let Err(e) = self.core.reprogram(fd, Event::empty()) {
            log::warn!("{e}");
        }
        for w in waiters {
            trigger(w, &self.scheduler);
        }
    }

    /// Shuts down the scheduler. Requires this to be the only surviving
    /// `Arc` (the global `current()` handle is a `Weak` and doesn't count).
    pub fn stop(self: Arc<Self>) {
        match Arc::try_unwrap(self) {
            Ok(manager) => manager.scheduler.stop(),
            Err(_) => log::warn!("IoManager::stop called while other Arc handles are still alive"),
        }
    }
}

fn event_name(event: Event) -> &'static str {
    if event.contains(Event::READ) && event.contains(Event::WRITE) {
        "read+write"
    } else if event.contains(Event::READ) {
        "read"
    } else {
        "write"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn tickle_wakes_an_idle_worker_promptly() {
        let io = IoManager::new(1).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        let handle = io.scheduler().spawn(
            move || {
                done2.store(true, Ordering::SeqCst);
            },
            None,
        );
        io.scheduler().join(handle);
        assert!(done.load(Ordering::SeqCst));
        io.stop();
    }

    #[test]
    fn add_del_event_round_trips_pending_count() {
        let io = IoManager::new(1).unwrap();
        let (r, _w) = {
            let mut fds = [0i32; 2];
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
            (fds[0], fds[1])
        };
        io.add_event(r, Event::READ, Some(Box::new(|| {}))).unwrap();
        assert_eq!(io.pending_events(), 1);
        assert!(io.del_event(r, Event::READ));
        assert_eq!(io.pending_events(), 0);
        assert!(!io.del_event(r, Event::READ));
        unsafe {
            libc::close(r);
            libc::close(_w);
        }
        io.stop();
    }

    #[test]
    fn forget_on_close_wakes_all_pending_waiters_and_is_idempotent() {
        let io = IoManager::new(1).unwrap();
        let (r, w) = {
            let mut fds = [0i32; 2];
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
            (fds[0], fds[1])
        };

        let read_ran = Arc::new(AtomicBool::new(false));
        let write_ran = Arc::new(AtomicBool::new(false));
        let read_ran2 = Arc::clone(&read_ran);
        let write_ran2 = Arc::clone(&write_ran);

        let before = io.pending_events();
        io.add_event(r, Event::READ, Some(Box::new(move || read_ran2.store(true, Ordering::SeqCst))))
            .unwrap();
        io.add_event(r, Event::WRITE, Some(Box::new(move || write_ran2.store(true, Ordering::SeqCst))))
            .unwrap();
        assert_eq!(io.pending_events(), before + 2);

        // Mirrors what `hook::close` does: forget the fd, waking everything
        // still registered on it so it observes a failing retry.
        io.forget(r);
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert!(read_ran.load(Ordering::SeqCst));
        assert!(write_ran.load(Ordering::SeqCst));
        assert_eq!(io.pending_events(), before);

        // A second close/forget finds nothing left to cancel: a no-op.
        io.forget(r);
        assert_eq!(io.pending_events(), before);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
        io.stop();
    }

    #[test]
    fn idle_wait_is_bounded_by_configured_max_wait() {
        let fds = Arc::new(FdTable::new());
        let core = ReactorCore::new(Arc::clone(&fds), 16).unwrap();
        let config = crate::config::RuntimeConfig {
            reactor_max_wait_ms: 50,
            ..Default::default()
        };
        let scheduler = Scheduler::with_config(1, config, false).unwrap();

        let start = std::time::Instant::now();
        core.wait(&scheduler);
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(40), "returned too early: {elapsed:?}");
        assert!(elapsed < std::time::Duration::from_millis(300), "overran its bound: {elapsed:?}");

        scheduler.stop();
    }
}
