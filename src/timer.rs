//! Wall-clock sources
//!
//! Property freshness is measured in milliseconds since the Unix epoch. The
//! clock is injected so tests can pin and advance time.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of the current wall-clock time
pub trait Timer: Send + Sync {
    /// Milliseconds since 1970-01-01T00:00:00Z
    fn now_ms(&self) -> i64;
}

/// Timer backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimer;

impl SystemTimer {
    /// Create a new system timer
    pub fn new() -> Self {
        Self
    }
}

impl Timer for SystemTimer {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven timer for tests
#[derive(Debug)]
pub struct MockTimer {
    now_ms: AtomicI64,
}

impl MockTimer {
    /// 2010-04-05 00:00:00 UTC, a convenient fixed starting point
    pub const APR_5_2010_MS: i64 = 1_270_425_600_000;

    /// Create a timer frozen at `now_ms`
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    /// Set the current time
    pub fn set_time_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Move the clock forward (or backward for negative deltas)
    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Timer for MockTimer {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_timer_advance() {
        let timer = MockTimer::new(MockTimer::APR_5_2010_MS);
        assert_eq!(timer.now_ms(), MockTimer::APR_5_2010_MS);

        timer.advance_ms(1500);
        assert_eq!(timer.now_ms(), MockTimer::APR_5_2010_MS + 1500);

        timer.set_time_ms(42);
        assert_eq!(timer.now_ms(), 42);
    }

    #[test]
    fn test_system_timer_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemTimer::new().now_ms() > 1_577_836_800_000);
    }
}
