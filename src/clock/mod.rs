use std::sync::atomic::{AtomicI64, Ordering};

use crate::guardrail::EngineError;

/// Source of elapsed-time nanoseconds. All pipeline timing derives from one
/// wall-time-independent monotonic clock.
pub trait ElapsedClock: Send + Sync {
    fn now_ns(&self) -> Result<i64, EngineError>;
}

/// Reads `CLOCK_BOOTTIME`, which keeps counting across suspend. Falls back
/// to `CLOCK_MONOTONIC` where boottime is unavailable.
pub struct BootClock;

impl ElapsedClock for BootClock {
    fn now_ns(&self) -> Result<i64, EngineError> {
        read_clock(libc::CLOCK_BOOTTIME).or_else(|_| read_clock(libc::CLOCK_MONOTONIC))
    }
}

fn read_clock(clock_id: libc::clockid_t) -> Result<i64, EngineError> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime` is thread-safe and only requires a valid
    // pointer for the out-parameter.
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return Err(EngineError::ClockUnavailable);
    }
    Ok((ts.tv_sec as i64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as i64))
}

/// Manually driven clock for tests.
#[derive(Default)]
pub struct TestClock {
    now_ns: AtomicI64,
}

impl TestClock {
    pub fn new(now_ns: i64) -> Self {
        Self {
            now_ns: AtomicI64::new(now_ns),
        }
    }

    pub fn set(&self, now_ns: i64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ns: i64) {
        self.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl ElapsedClock for TestClock {
    fn now_ns(&self) -> Result<i64, EngineError> {
        Ok(self.now_ns.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_clock_is_monotonic() {
        let clock = BootClock;
        let a = clock.now_ns().expect("clock readable");
        let b = clock.now_ns().expect("clock readable");
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_test_clock_advances() {
        let clock = TestClock::new(100);
        assert_eq!(clock.now_ns().expect("readable"), 100);
        clock.advance(50);
        assert_eq!(clock.now_ns().expect("readable"), 150);
        clock.set(10);
        assert_eq!(clock.now_ns().expect("readable"), 10);
    }
}
