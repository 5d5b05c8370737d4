//! Time sources for the circuit breaker
//!
//! This module provides different clock implementations:
//! - `MonotonicClock`: Real monotonic time anchored at creation
//! - `ManualClock`: Hand-driven time for tests and simulations

use parking_lot::Mutex;
use std::time::Instant;

/// Source of monotonic time used for cooldowns and interval resets
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Get monotonic time in seconds (relative to an arbitrary anchor)
    fn monotonic_time(&self) -> f64;
}

/// Monotonic clock backed by `Instant` (prevents clock skew issues from NTP)
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start_time: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to
///
/// # Example
///
/// ```rust
/// use rest_breaker::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// clock.advance_secs(61.0);
/// assert_eq!(clock.monotonic_time(), 61.0);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `seconds`
    pub fn advance_secs(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }

    /// Jump to an absolute point in time
    pub fn set_secs(&self, seconds: f64) {
        *self.now.lock() = seconds;
    }
}

impl Clock for ManualClock {
    fn monotonic_time(&self) -> f64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();

        let time1 = clock.monotonic_time();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let time2 = clock.monotonic_time();

        assert!(time2 > time1);
    }

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        assert_eq!(clock.monotonic_time(), 0.0);

        clock.advance_secs(1.5);
        clock.advance_secs(0.5);
        assert_eq!(clock.monotonic_time(), 2.0);

        clock.set_secs(10.0);
        assert_eq!(clock.monotonic_time(), 10.0);
    }
}
