//! `Clock` — injected monotonic + wall time source.
//!
//! Kept as a trait so the scheduler and connection backoff can be driven by
//! a fake clock in tests instead of real sleeps.

use std::time::Duration;

use tokio::time::Instant;

use crate::wire::wall_clock_secs;

/// Monotonic + wall time source, sleep/timer primitives.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;
    /// Current wall-clock time as seconds since the Unix epoch.
    fn wall_now(&self) -> f64;
    /// Sleep until the given monotonic instant.
    fn sleep_until(&self, deadline: Instant) -> tokio::time::Sleep {
        tokio::time::sleep_until(deadline)
    }
}

/// Real clock backed by `tokio::time` and the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> f64 {
        wall_clock_secs()
    }
}

/// Convenience: monotonic instant offset by a duration from "now".
#[must_use]
pub fn deadline_in(duration: Duration) -> Instant {
    Instant::now() + duration
}
