//! Time and cancellation seams for the polling loops.
//!
//! The correlator never sleeps on the transport; it polls, and when a poll
//! finds nothing it calls [`Clock::idle`]. Tests swap in a fake clock whose
//! time only moves on `idle`, which makes timeout behaviour deterministic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Pause between empty polls on the real clock.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Called when a poll found no data. May sleep briefly.
    fn idle(&self);
}

/// [`Clock`] backed by [`Instant`].
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn idle(&self) {
        std::thread::sleep(IDLE_BACKOFF);
    }
}

/// External abort request, polled once per correlator iteration.
pub trait CancelSignal: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

impl CancelSignal for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// A cancel signal that never fires.
pub struct Never;

impl CancelSignal for Never {
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) use fake::FakeClock;
