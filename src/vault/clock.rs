//! Execution-environment time.
//!
//! "Now" is always supplied by the environment, never by the caller.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually advanced clock for replays and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now().timestamp())
    }

    pub fn advance(&self, secs: i64) -> i64 {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }

    pub fn set(&self, ts: i64) {
        self.now.store(ts, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        assert_eq!(clock.advance(60), 1_060);
        assert_eq!(clock.now(), 1_060);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
