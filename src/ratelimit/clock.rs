//! Time sources for limiters.
//!
//! Every limiter reads time through a [`Clock`] so that window rollover,
//! segment rotation, token refill and queue timeouts can be driven by hand in
//! tests.

use std::fmt;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::warn;

/// A source of monotonic time that can also wait for a duration to pass.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant.
    fn now(&self) -> Instant;

    /// A future that completes once `duration` has passed on this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Time elapsed from `earlier` to `now`, or zero if the clock went backwards.
pub(crate) fn elapsed_since(now: Instant, earlier: Instant) -> Duration {
    if now < earlier {
        warn!(
            behind_ms = earlier.duration_since(now).as_millis() as u64,
            "Clock moved backwards, counting no elapsed time"
        );
        return Duration::ZERO;
    }
    now.duration_since(earlier)
}

/// Real monotonic time, with sleeps backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A clock that only moves when told to.
///
/// Pending [`Clock::sleep`] futures complete as soon as an [`advance`] or
/// [`set`] reaches their deadline, which makes queue timeouts testable
/// without real delays.
///
/// [`advance`]: ManualClock::advance
/// [`set`]: ManualClock::set
pub struct ManualClock {
    now: watch::Sender<Instant>,
}

impl ManualClock {
    /// Create a clock frozen at the current real instant.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Create a clock frozen at `start`.
    pub fn starting_at(start: Instant) -> Self {
        let (now, _) = watch::channel(start);
        Self { now }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.now.send_modify(|now| *now += duration);
    }

    /// Move the clock backward, as a misbehaving system clock would.
    ///
    /// Saturates at the earliest instant the platform can represent.
    pub fn rewind(&self, duration: Duration) {
        self.now.send_modify(|now| {
            if let Some(earlier) = now.checked_sub(duration) {
                *now = earlier;
            }
        });
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: Instant) {
        self.now.send_replace(instant);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.now.borrow())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let deadline = self.now() + duration;
        let mut rx = self.now.subscribe();
        Box::pin(async move {
            loop {
                let reached = *rx.borrow_and_update() >= deadline;
                if reached {
                    return;
                }
                // The sender lives as long as the clock; once it is gone time
                // can no longer move, so the sleep is over.
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}
