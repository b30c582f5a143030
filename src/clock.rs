//! A pluggable time source.
//!
//! Every rolling-window primitive (rate limiter, circuit breaker, SLO
//! tracker) needs a monotonic notion of "now" that tests can control without
//! sleeping in wall-clock time. `Clock` is that seam.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the current time, expressed as seconds since the Unix epoch.
///
/// Implementations must be cheap to call and safe to share across threads.
pub trait Clock: Send + Sync {
    /// Current time, in fractional seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// The real wall clock, backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// A clock that returns a fixed, externally-advanced time.
///
/// Used in tests to assert exact boundary behavior (e.g. "the Lth request in
/// a fresh window is allowed, the (L+1)th denied") without depending on real
/// elapsed wall-clock time.
#[derive(Debug, Clone)]
pub struct FixedClock {
    micros: Arc<AtomicU64>,
}

impl FixedClock {
    /// Create a fixed clock starting at the given time (seconds since epoch).
    pub fn new(start_secs: f64) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new((start_secs * 1_000_000.0) as u64)),
        }
    }

    /// Advance the clock by the given number of seconds.
    pub fn advance(&self, secs: f64) {
        let delta = (secs * 1_000_000.0) as u64;
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time (seconds since epoch).
    pub fn set(&self, secs: f64) {
        self.micros
            .store((secs * 1_000_000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

/// A boxed, shareable clock handle, the form primitives store internally.
pub type SharedClock = Arc<dyn Clock>;

/// Build the default production clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_increases() {
        let clock = SystemClock;
        let t0 = clock.now();
        let t1 = clock.now();
        assert!(t1 >= t0);
    }

    #[test]
    fn test_fixed_clock_advance() {
        let clock = FixedClock::new(100.0);
        assert_eq!(clock.now(), 100.0);
        clock.advance(5.5);
        assert!((clock.now() - 105.5).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_clock_set() {
        let clock = FixedClock::new(0.0);
        clock.set(42.0);
        assert_eq!(clock.now(), 42.0);
    }

    #[test]
    fn test_fixed_clock_shared_across_clones() {
        let clock = FixedClock::new(0.0);
        let clone = clock.clone();
        clone.advance(10.0);
        assert_eq!(clock.now(), 10.0);
    }
}
