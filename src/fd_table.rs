//! Per-descriptor state.
//!
//! A grow-only table indexed by `RawFd`: a table-level `RwLock` covers only
//! growing the slot vector and inserting/removing a slot's entry, and is
//! taken for reading on every lookup, falling back to a write lock only
//! when a slot must be created or dropped. Each slot's `FdContext` is
//! independently guarded by its own `Mutex`, so two unrelated fds' hooked
//! calls never serialize against each other through one global lock.

use crate::fiber::{Fiber, FiberId};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock};

bitflags::bitflags! {
    /// Readiness directions tracked per descriptor.
    #[derive(Default)]
    pub struct Event: u8 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

/// What to do when a direction becomes ready: resume a parked fiber, or run
/// a callback. Mirrors the source's event context holding "either a fiber
/// or a callback".
pub enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Waiter {
    pub(crate) fn fiber_id(&self) -> Option<FiberId> {
        match self {
            Waiter::Fiber(f) => Some(f.id()),
            Waiter::Callback(_) => None,
        }
    }
}

/// One direction's pending registration.
#[derive(Default)]
pub struct EventContext {
    waiter: Option<Waiter>,
}

/// Per-descriptor bookkeeping: socket-ness, the nonblocking flags the hook
/// layer must keep straight, per-direction timeouts, and pending waiters.
pub struct FdContext {
    fd: RawFd,
    pub is_socket: bool,
    pub is_closed: bool,
    /// What the application asked for via `fcntl`/`ioctl`.
    pub user_nonblock: bool,
    /// What the runtime forced on the real descriptor so the reactor works.
    pub sys_nonblock: bool,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    read: EventContext,
    write: EventContext,
    registered: Event,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            is_socket: false,
            is_closed: false,
            user_nonblock: false,
            sys_nonblock: false,
            recv_timeout_ms: crate::clock::INFINITE,
            send_timeout_ms: crate::clock::INFINITE,
            read: EventContext::default(),
            write: EventContext::default(),
            registered: Event::empty(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn registered(&self) -> Event {
        self.registered
    }

    fn slot(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            panic!("event must be exactly READ or WRITE, got {event:?}")
        }
    }

    /// Registers `waiter` for `event`. Fails if this direction already has a
    /// waiter.
    pub fn register(&mut self, event: Event, waiter: Waiter) -> Result<(), Waiter> {
        if self.registered.contains(event) {
            return Err(waiter);
        }
        self.slot(event).waiter = Some(waiter);
        self.registered.insert(event);
        Ok(())
    }

    /// Removes and returns the waiter for `event`, without treating it as
    /// ready.
    pub fn unregister(&mut self, event: Event) -> Option<Waiter> {
        if !self.registered.contains(event) {
            return None;
        }
        self.registered.remove(event);
        self.slot(event).waiter.take()
    }

    /// Takes every registered waiter (read then write), clearing the fd's
    /// registration. Used by `close`/`cancel_all`.
    pub fn take_all(&mut self) -> Vec<Waiter> {
        let mut out = Vec::new();
        for event in [Event::READ, Event::WRITE] {
            if let Some(w) = self.unregister(event) {
                out.push(w);
            }
        }
        out
    }
}

/// The fd table itself: `Vec<Option<Arc<Mutex<FdContext>>>>` behind an
/// `RwLock`, grown by 1.5x (and never shrunk) when an fd beyond the current
/// length is first touched.
#[derive(Default)]
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<Mutex<FdContext>>>>>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Runs `f` against the `FdContext` for `fd`, creating it on first use.
    /// Takes the table's read lock for the common case where `fd` already
    /// has a slot; only grows/inserts under the write lock.
    pub fn with_or_create<R>(&self, fd: RawFd, f: impl FnOnce(&mut FdContext) -> R) -> R {
        let ctx = self.get_or_create(fd);
        f(&mut ctx.lock().unwrap())
    }

    fn get_or_create(&self, fd: RawFd) -> Arc<Mutex<FdContext>> {
        let idx = fd as usize;
        if let Some(ctx) = self.slots.read().unwrap().get(idx).and_then(Option::clone) {
            return ctx;
        }
        let mut slots = self.slots.write().unwrap();
        if slots.len() <= idx {
            let new_len = ((idx + 1) as f64 * 1.5).ceil() as usize;
            slots.resize_with(new_len, || None);
        }
        Arc::clone(slots[idx].get_or_insert_with(|| Arc::new(Mutex::new(FdContext::new(fd)))))
    }

    /// Runs `f` against the `FdContext` for `fd` if one has been created.
    /// Only the table's read lock is taken; the fd's own mutex serializes
    /// against concurrent `with`/`with_or_create` calls on the same fd.
    pub fn with<R>(&self, fd: RawFd, f: impl FnOnce(&mut FdContext) -> R) -> Option<R> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        let ctx = self.slots.read().unwrap().get(idx).and_then(Option::clone)?;
        Some(f(&mut ctx.lock().unwrap()))
    }

    /// Drops the `FdContext` for `fd`, if any, returning any waiters that
    /// were still registered (for the caller to trigger).
    pub fn remove(&self, fd: RawFd) -> Vec<Waiter> {
        if fd < 0 {
            return Vec::new();
        }
        let idx = fd as usize;
        let taken = {
            let mut slots = self.slots.write().unwrap();
            slots.get_mut(idx).and_then(Option::take)
        };
        match taken {
            Some(ctx) => ctx.lock().unwrap().take_all(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_to_fit_high_fds() {
        let table = FdTable::new();
        table.with_or_create(1000, |ctx| ctx.is_socket = true);
        let seen = table.with(1000, |ctx| ctx.is_socket).unwrap();
        assert!(seen);
    }

    #[test]
    fn double_registration_is_rejected() {
        let table = FdTable::new();
        table.with_or_create(3, |ctx| {
            assert!(ctx
                .register(Event::READ, Waiter::Callback(Box::new(|| {})))
                .is_ok());
            assert!(ctx
                .register(Event::READ, Waiter::Callback(Box::new(|| {})))
                .is_err());
        });
    }

    #[test]
    fn remove_returns_pending_waiters() {
        let table = FdTable::new();
        table.with_or_create(4, |ctx| {
            ctx.register(Event::READ, Waiter::Callback(Box::new(|| {}))).unwrap();
            ctx.register(Event::WRITE, Waiter::Callback(Box::new(|| {}))).unwrap();
        });
        let waiters = table.remove(4);
        assert_eq!(waiters.len(), 2);
        assert!(table.with(4, |_| ()).is_none());
    }
}
