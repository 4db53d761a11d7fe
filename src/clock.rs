//! Monotonic millisecond clock used throughout the scheduler and reactor.
//!
//! Derived from `clock_gettime(CLOCK_MONOTONIC)`, never `CLOCK_REALTIME`, so
//! timers are immune to wall-clock adjustments (NTP steps, `settimeofday`,
//! daylight saving changes). See also: [`crate::timer`].

/// Sentinel meaning "no timeout" / "infinite wait".
pub const INFINITE: u64 = u64::MAX;

/// Milliseconds elapsed since an unspecified fixed point in the past.
///
/// Guaranteed never to decrease between two calls on the same machine.
#[inline]
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, uniquely-owned timespec; CLOCK_MONOTONIC is
    // always available on Linux.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) cannot fail");
    (ts.tv_sec as u64)
        .saturating_mul(1000)
        .saturating_add(ts.tv_nsec as u64 / 1_000_000)
}

/// `now_ms() + ms`, saturating instead of overflowing near [`INFINITE`].
#[inline]
pub fn deadline_ms(ms: u64) -> u64 {
    now_ms().saturating_add(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_non_decreasing() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn deadline_is_in_the_future() {
        let now = now_ms();
        assert!(deadline_ms(100) >= now + 100);
    }

    #[test]
    fn deadline_saturates() {
        assert_eq!(deadline_ms(INFINITE), u64::MAX);
    }
}
