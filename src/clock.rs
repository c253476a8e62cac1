//! Monotonic, cross-process-consistent nanosecond clock.
//!
//! TTL arithmetic needs a timestamp that keeps advancing across process
//! restarts of the *same host* without jumping on wall-clock adjustments.
//! On Linux we read `CLOCK_MONOTONIC` directly, which is already relative to
//! an arbitrary but fixed boot-time epoch shared by every process on the
//! host. Elsewhere we fake the same property with a process-local anchor:
//! the first call on a given process remembers `Instant::now()` and the
//! corresponding wall-clock offset, and every later call reports elapsed
//! monotonic time relative to that anchor. This is only coherent across
//! processes that started reasonably close together, which is acceptable
//! for test/dev use of non-Linux targets; the Linux path is what production
//! deployments rely on.

use std::sync::OnceLock;
use std::time::Instant;

#[cfg(target_os = "linux")]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-param for clock_gettime.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(ret, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(target_os = "linux"))]
pub fn now_ns() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_nondecreasing() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
