//! Context switch tracking utilities.
//!
//! Mostly useful for tests that want to assert whether a given call
//! suspended the calling fiber or ran straight through.

use super::Fiber;

/// Returns the number of context switches of the calling fiber.
pub fn csw() -> u64 {
    Fiber::current().switch_count()
}

/// Calls a function and checks whether it yielded the calling fiber.
///
/// # Example
///
/// ```no_run
/// # use fiberflow::fiber::check_yield;
/// # use fiberflow::fiber::YieldResult::*;
/// # use fiberflow::hook;
/// # use std::time::Duration;
/// assert_eq!(check_yield(|| hook::sleep(Duration::ZERO)), Yielded(()));
/// ```
pub fn check_yield<F, T>(f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let before = csw();
    let result = f();
    if csw() == before {
        YieldResult::DidntYield(result)
    } else {
        YieldResult::Yielded(result)
    }
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function didn't yield.
    DidntYield(T),
    /// The function did yield.
    Yielded(T),
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::YieldResult;
    use crate::scheduler::Scheduler;
    use std::time::Duration;

    #[test]
    fn check_yield_detects_sleep() {
        let scheduler = Scheduler::new(1).unwrap();
        let handle =
            scheduler.spawn(|| super::check_yield(|| crate::hook::sleep(Duration::ZERO)), None);
        assert_eq!(scheduler.join(handle), YieldResult::Yielded(()));
        scheduler.stop();
    }

    #[test]
    fn check_yield_passes_through_non_yielding_calls() {
        let scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.spawn(|| super::check_yield(|| 1 + 1), None);
        assert_eq!(scheduler.join(handle), YieldResult::DidntYield(2));
        scheduler.stop();
    }
}
