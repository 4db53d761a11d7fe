//! Stackful coroutines.
//!
//! A [`Fiber`] is a user-space coroutine with its own stack and a saved
//! machine context, switched with [`context`]'s assembly-level
//! `Context`/`Transfer` primitive — the same register-swap technique driven
//! by [the `context`-crate-based fiber implementations elsewhere in the
//! ecosystem](https://crates.io/crates/context). Unlike `async`/`await`,
//! suspension is not limited to explicit await points: any call, however
//! deeply nested, can suspend the whole fiber by yielding.
//!
//! Only the [`crate::scheduler`] and [`crate::io_manager`] modules construct
//! and resume fibers directly; application code spawns work through
//! [`crate::scheduler::Scheduler::spawn`] and waits on the returned
//! [`JoinHandle`].

pub mod csw;
mod stack;

pub use stack::FiberStack;

use crate::sync::Cond;
use context::{Context, Transfer};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Default stack size used when a [`Builder`] doesn't override it.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Uniquely identifies a [`Fiber`] for the lifetime of the process.
pub type FiberId = u64;

fn next_fiber_id() -> FiberId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A fiber's position in the state machine described in the crate's design
/// notes: `Init -> Exec -> {Ready, Hold} -> Exec -> {Term, Except}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, never yet resumed.
    Init,
    /// Runnable, sitting in a scheduler queue.
    Ready,
    /// Currently executing on some worker thread.
    Exec,
    /// Parked, waiting on an external event (timer, I/O readiness, cond).
    Hold,
    /// Returned normally; will never run again.
    Term,
    /// Panicked; will never run again.
    Except,
}

impl State {
    pub fn is_runnable(self) -> bool {
        matches!(self, State::Init | State::Ready)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

enum Body {
    Pending(Box<dyn FnOnce() + 'static>),
    Empty,
}

/// A stackful coroutine.
///
/// Exactly one fiber is `Exec` per OS thread at any instant; the scheduler
/// enforces this by never picking a fiber that is already `Exec`. A `Fiber`
/// is handed around as `Arc<Fiber>`; the `unsafe impl Send + Sync` below
/// relies on that scheduler invariant, the same way a coroutine library's
/// internal handle type does.
pub struct Fiber {
    id: FiberId,
    name: Option<String>,
    state: Cell<State>,
    /// My own suspended body context; `None` while I'm `Exec` or finished.
    context: Cell<Option<Context>>,
    /// The context that last resumed me; resuming it is how I yield back.
    caller_context: RefCell<Option<Context>>,
    body: RefCell<Body>,
    _stack: Option<FiberStack>,
    /// Whether a yield from this fiber returns to the thread's main fiber
    /// (`true`) instead of the worker's dispatch fiber (`false`). In this
    /// implementation a yield always resumes `caller_context`, so this flag
    /// only documents intent — it is consistent with the flag's meaning
    /// because the main fiber is exactly what calls into a fiber built with
    /// `return_to_caller = true` (see [`crate::scheduler::Scheduler`]'s
    /// `use_caller` mode).
    return_to_caller: Cell<bool>,
    csw: Cell<u64>,
    done: Cond,
    /// The scheduler this fiber was spawned on, used to re-enqueue it when
    /// something external (a [`Cond`], a timer, a reactor event) wakes it
    /// from [`State::Hold`]. `None` for the thread's main fiber.
    home: RefCell<Option<std::sync::Weak<crate::scheduler::Inner>>>,
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish()
    }
}

// SAFETY: a `Fiber` is only ever `Exec` on one thread at a time; the
// scheduler's queue discipline (never re-picking an `Exec` entry) is what
// makes concurrent access to the interior-mutable fields sound.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    fn new_main() -> Arc<Fiber> {
        Arc::new(Fiber {
            id: next_fiber_id(),
            name: Some("main".into()),
            state: Cell::new(State::Exec),
            context: Cell::new(None),
            caller_context: RefCell::new(None),
            body: RefCell::new(Body::Empty),
            _stack: None,
            return_to_caller: Cell::new(true),
            csw: Cell::new(0),
            done: Cond::new(),
            home: RefCell::new(None),
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.set(state);
    }

    /// Number of completed context switches into and out of this fiber.
    /// Exposed for [`csw`] and for tests asserting whether a call yielded.
    pub fn switch_count(&self) -> u64 {
        self.csw.get()
    }

    pub(crate) fn set_home(&self, scheduler: std::sync::Weak<crate::scheduler::Inner>) {
        *self.home.borrow_mut() = Some(scheduler);
    }

    pub(crate) fn home(&self) -> Option<std::sync::Weak<crate::scheduler::Inner>> {
        self.home.borrow().clone()
    }

    /// The fiber currently executing on this thread.
    pub fn current() -> Arc<Fiber> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// The thread's main fiber (constructed lazily from the native context
    /// the first time any fiber code runs on this thread).
    pub fn main() -> Arc<Fiber> {
        MAIN.with(|m| m.clone())
    }
}

thread_local! {
    static MAIN: Arc<Fiber> = Fiber::new_main();
    static CURRENT: RefCell<Arc<Fiber>> = RefCell::new(Fiber::main());
    static DISPATCH: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// Registers this worker thread's dispatch fiber, called once by
/// [`crate::scheduler::Scheduler`] when a worker starts.
pub(crate) fn set_dispatch_fiber(fiber: Arc<Fiber>) {
    DISPATCH.with(|d| *d.borrow_mut() = Some(fiber));
}

/// The scheduler's idle/dispatch fiber for this worker thread, if any.
pub(crate) fn dispatch_fiber() -> Option<Arc<Fiber>> {
    DISPATCH.with(|d| d.borrow().clone())
}

extern "C" fn fiber_trampoline(t: Transfer) -> ! {
    let fiber_ptr = t.data as *const Fiber;
    // SAFETY: `data` is `Arc::as_ptr(&fiber)` set by `switch_to` for the
    // very first resume of this context; the `Arc` stays alive for the
    // whole call because it's held both by the caller and by `CURRENT`.
    let fiber: &Fiber = unsafe { &*fiber_ptr };
    *fiber.caller_context.borrow_mut() = Some(t.context);

    let body = match std::mem::replace(&mut *fiber.body.borrow_mut(), Body::Empty) {
        Body::Pending(f) => f,
        Body::Empty => panic!("fiber {} started with no body", fiber.id),
    };

    let result = std::panic::catch_unwind(AssertUnwindSafe(body));
    match result {
        Ok(()) => fiber.state.set(State::Term),
        Err(payload) => {
            log::error!("fiber {} panicked: {}", fiber.id, panic_message(&payload));
            fiber.state.set(State::Except);
        }
    }
    fiber.done.broadcast();

    let caller = fiber
        .caller_context
        .borrow_mut()
        .take()
        .expect("fiber finished with no caller to return to");
    // SAFETY: this fiber will never be resumed again; its stack is
    // reclaimed once the owning `Arc<Fiber>` drops.
    unsafe {
        caller.resume(0);
    }
    unreachable!("a finished fiber's context was resumed again")
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Switches execution into `target`, returning once `target` yields (or
/// finishes) back to us. Used by the scheduler to resume a `Ready` fiber and
/// by `yield_now`'s caller-side bookkeeping; application code never calls
/// this directly.
pub(crate) fn switch_to(target: &Arc<Fiber>) {
    let prev = Fiber::current();
    if Arc::ptr_eq(&prev, target) {
        return;
    }
    prev.csw.set(prev.csw.get().wrapping_add(1));
    CURRENT.with(|c| *c.borrow_mut() = target.clone());
    target.state.set(State::Exec);

    let ctx = target
        .context
        .take()
        .unwrap_or_else(|| panic!("fiber {} resumed with no pending context", target.id));
    let data = Arc::as_ptr(target) as usize;
    // SAFETY: `ctx` was created by `Context::new` for this fiber (or is its
    // own previously-saved suspend point); `data` points at `target`, which
    // outlives the switch via the `Arc` clone stored above.
    let transfer = unsafe { ctx.resume(data) };

    if !target.state.get().is_finished() {
        target.context.set(Some(transfer.context));
    }
    CURRENT.with(|c| *c.borrow_mut() = prev);
}

/// Suspends the calling fiber, resuming whoever last resumed it (the
/// scheduler's dispatch fiber, or the thread's main fiber in `use_caller`
/// mode). The caller is responsible for having already set its own state to
/// [`State::Ready`] or [`State::Hold`] and for arranging to be rescheduled.
pub fn yield_now() {
    let me = Fiber::current();
    let caller = me
        .caller_context
        .borrow_mut()
        .take()
        .expect("fiber yielded with no caller context recorded");
    // SAFETY: `caller` is the context captured either by `fiber_trampoline`
    // on first entry or by the previous `yield_now` call on this fiber.
    let transfer = unsafe { caller.resume(0) };
    *me.caller_context.borrow_mut() = Some(transfer.context);
}

/// Marks the calling fiber [`State::Ready`] and yields; the scheduler that
/// owns it is expected to have already re-enqueued it (or be about to).
pub(crate) fn yield_ready() {
    Fiber::current().set_state(State::Ready);
    yield_now();
}

/// Marks the calling fiber [`State::Hold`] and yields; something external
/// (a timer, a reactor event, a [`Cond`]) must call
/// [`crate::scheduler::wake_parked`] to make it runnable again.
pub(crate) fn yield_hold() {
    Fiber::current().set_state(State::Hold);
    yield_now();
}

/// Builds a [`Fiber`] with a configurable name and stack size.
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Allocates a stack and constructs a fiber in [`State::Init`], along
    /// with a [`JoinHandle`] that will yield `f`'s return value once the
    /// fiber terminates.
    pub fn build<F, T>(self, f: F) -> std::io::Result<(Arc<Fiber>, JoinHandle<T>)>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let stack = FiberStack::new(self.stack_size)?;
        let result: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let result_slot = Arc::clone(&result);
        let wrapped: Box<dyn FnOnce()> = Box::new(move || {
            let value = f();
            *result_slot.lock().unwrap() = Some(value);
        });

        let fiber = Arc::new(Fiber {
            id: next_fiber_id(),
            name: self.name,
            state: Cell::new(State::Init),
            context: Cell::new(None),
            caller_context: RefCell::new(None),
            body: RefCell::new(Body::Pending(wrapped)),
            _stack: Some(stack),
            return_to_caller: Cell::new(false),
            csw: Cell::new(0),
            done: Cond::new(),
            home: RefCell::new(None),
        });
        let ctx = Context::new(fiber._stack.as_ref().unwrap().inner(), fiber_trampoline);
        fiber.context.set(Some(ctx));

        let handle = JoinHandle {
            fiber: Arc::clone(&fiber),
            result,
        };
        Ok((fiber, handle))
    }
}

/// An owned permission to wait for a fiber's termination and collect its
/// result.
pub struct JoinHandle<T> {
    fiber: Arc<Fiber>,
    result: Arc<Mutex<Option<T>>>,
}

impl<T> JoinHandle<T> {
    pub fn fiber_id(&self) -> FiberId {
        self.fiber.id
    }

    pub fn is_finished(&self) -> bool {
        self.fiber.state().is_finished()
    }

    /// Parks the calling fiber until the joined fiber terminates, then
    /// returns its result. Must be called from fiber context (i.e. with a
    /// scheduler driving the calling thread), since it waits on a [`Cond`].
    pub fn join(self) -> T {
        while !self.is_finished() {
            self.fiber.done.wait();
        }
        self.result
            .lock()
            .unwrap()
            .take()
            .expect("fiber finished without recording a result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn state_predicates() {
        assert!(State::Init.is_runnable());
        assert!(State::Ready.is_runnable());
        assert!(!State::Exec.is_runnable());
        assert!(State::Term.is_finished());
        assert!(State::Except.is_finished());
        assert!(!State::Hold.is_finished());
    }

    #[test]
    fn spawned_fiber_runs_and_joins() {
        let scheduler = Scheduler::new(1).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let handle = scheduler.spawn(
            move || {
                flag2.store(true, Ordering::SeqCst);
                42
            },
            None,
        );
        let result = scheduler.join(handle);
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(result, 42);
        scheduler.stop();
    }

    #[test]
    fn panicking_fiber_becomes_except_without_killing_scheduler() {
        let scheduler = Scheduler::new(1).unwrap();
        let _handle = scheduler.spawn(|| panic!("boom"), None);
        let ok = scheduler.spawn(|| 7, None);
        assert_eq!(scheduler.join(ok), 7);
        scheduler.stop();
    }
}
