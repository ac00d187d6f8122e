//! Fixed window limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{elapsed_since, Clock};
use super::limiter::{
    release_acknowledged, AdmissionLedger, Limiter, LimiterKind, LimiterStatistics,
};
use super::permit::{Outcome, Permit};
use super::policy::FixedWindowOptions;
use crate::error::Result;

/// Counts admissions in consecutive windows of equal length.
///
/// A window opens at the first access after the previous one expired, and
/// the count resets in the same step. A full burst at the end of one window
/// followed by another at the start of the next is allowed, so up to twice
/// the configured rate can pass around a boundary.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    options: FixedWindowOptions,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
    ledger: AdmissionLedger,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

impl WindowState {
    /// Reset the window if it has expired.
    fn roll_over(&mut self, now: Instant, window: Duration) {
        if elapsed_since(now, self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
        }
    }

    fn remaining(&self, now: Instant, window: Duration) -> Duration {
        (self.window_start + window)
            .saturating_duration_since(now)
            .min(window)
    }
}

impl FixedWindowLimiter {
    pub fn new(options: FixedWindowOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;
        let window_start = clock.now();
        Ok(Self {
            options,
            clock,
            state: Mutex::new(WindowState {
                window_start,
                count: 0,
            }),
            ledger: AdmissionLedger::default(),
        })
    }

    pub fn options(&self) -> &FixedWindowOptions {
        &self.options
    }

    /// Admissions counted in the current window.
    pub fn current_count(&self) -> u32 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.roll_over(now, self.options.window);
        state.count
    }

    /// Time until the current window closes.
    pub fn duration_until_reset(&self) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.roll_over(now, self.options.window);
        state.remaining(now, self.options.window)
    }
}

impl Limiter for FixedWindowLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::FixedWindow
    }

    fn try_acquire(&self, permits: u32) -> Result<Outcome> {
        self.ledger
            .check(self.kind(), permits, self.options.permit_limit)?;

        let now = self.clock.now();
        let window = self.options.window;
        let outcome = {
            let mut state = self.state.lock();
            state.roll_over(now, window);

            if permits == 0 {
                if state.count < self.options.permit_limit {
                    Outcome::admitted()
                } else {
                    Outcome::rejected_for(state.remaining(now, window))
                }
            } else if state.count as u64 + permits as u64 <= self.options.permit_limit as u64 {
                state.count += permits;
                trace!(
                    count = state.count,
                    limit = self.options.permit_limit,
                    "Fixed window admitted"
                );
                Outcome::admitted()
            } else {
                Outcome::rejected_for(state.remaining(now, window))
            }
        };

        if let Some(retry_after) = outcome.retry_after() {
            debug!(
                permits,
                limit = self.options.permit_limit,
                retry_after_ms = retry_after.as_millis() as u64,
                "Fixed window exhausted"
            );
        }
        self.ledger.record(&outcome);
        Ok(outcome)
    }

    fn release(&self, permit: Permit) -> Result<()> {
        release_acknowledged(self.kind(), permit)
    }

    fn statistics(&self) -> LimiterStatistics {
        let count = self.current_count();
        self.ledger.statistics(
            self.options.permit_limit.saturating_sub(count) as u64,
            0,
        )
    }

    fn close(&self) {
        if self.ledger.close() {
            debug!("Fixed window limiter closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;
    use crate::ratelimit::clock::ManualClock;

    fn limiter(limit: u32, window_secs: u64) -> (Arc<ManualClock>, FixedWindowLimiter) {
        let clock = Arc::new(ManualClock::new());
        let options = FixedWindowOptions::new(limit, Duration::from_secs(window_secs));
        let limiter = FixedWindowLimiter::new(options, clock.clone()).unwrap();
        (clock, limiter)
    }

    #[test]
    fn test_fresh_limiter_reports_full_capacity() {
        let (_clock, limiter) = limiter(10, 1);
        let stats = limiter.statistics();
        assert_eq!(stats.available_permits, 10);
        assert_eq!(stats.queued_permits, 0);
        assert_eq!(stats.total_successful_leases, 0);
    }

    #[test]
    fn test_exactly_limit_admissions_per_window() {
        let (_clock, limiter) = limiter(5, 10);

        for _ in 0..5 {
            assert!(limiter.try_acquire(1).unwrap().is_admitted());
        }

        // The 6th request should be rejected
        let outcome = limiter.try_acquire(1).unwrap();
        assert!(outcome.is_rejected());
        assert_eq!(outcome.retry_after(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_retry_after_shrinks_through_window() {
        let (clock, limiter) = limiter(1, 10);
        assert!(limiter.try_acquire(1).unwrap().is_admitted());

        clock.advance(Duration::from_secs(4));
        let outcome = limiter.try_acquire(1).unwrap();
        assert_eq!(outcome.retry_after(), Some(Duration::from_secs(6)));
    }

    #[test]
    fn test_request_at_window_end_starts_fresh_window() {
        let (clock, limiter) = limiter(3, 10);
        for _ in 0..3 {
            assert!(limiter.try_acquire(1).unwrap().is_admitted());
        }

        clock.advance(Duration::from_secs(10));
        assert_eq!(limiter.current_count(), 0);
        assert!(limiter.try_acquire(1).unwrap().is_admitted());
        assert_eq!(limiter.current_count(), 1);
        assert_eq!(limiter.duration_until_reset(), Duration::from_secs(10));
    }

    #[test]
    fn test_boundary_burst_is_allowed() {
        let (clock, limiter) = limiter(4, 12);

        // A full burst at the very end of the first window
        clock.advance(Duration::from_millis(11_999));
        assert!(limiter.try_acquire(4).unwrap().is_admitted());
        assert!(limiter.try_acquire(1).unwrap().is_rejected());

        // and another full burst right as the next one opens
        clock.advance(Duration::from_millis(1));
        for _ in 0..4 {
            assert!(limiter.try_acquire(1).unwrap().is_admitted());
        }
        assert!(limiter.try_acquire(1).unwrap().is_rejected());
    }

    #[test]
    fn test_multi_permit_acquire() {
        let (_clock, limiter) = limiter(10, 1);

        assert!(limiter.try_acquire(8).unwrap().is_admitted());
        assert!(limiter.try_acquire(3).unwrap().is_rejected());
        assert!(limiter.try_acquire(2).unwrap().is_admitted());
        assert_eq!(limiter.statistics().available_permits, 0);
    }

    #[test]
    fn test_zero_permit_probe_consumes_nothing() {
        let (_clock, limiter) = limiter(1, 1);

        assert!(limiter.try_acquire(0).unwrap().is_admitted());
        assert_eq!(limiter.current_count(), 0);

        assert!(limiter.try_acquire(1).unwrap().is_admitted());
        assert!(limiter.try_acquire(0).unwrap().is_rejected());
    }

    #[test]
    fn test_oversized_request_is_misuse() {
        let (_clock, limiter) = limiter(2, 1);
        let err = limiter.try_acquire(3).unwrap_err();
        assert!(matches!(err, TurnstileError::ProtocolMisuse(_)));
    }

    #[test]
    fn test_clock_rollback_does_not_reset_window() {
        let (clock, limiter) = limiter(2, 10);
        clock.advance(Duration::from_secs(5));
        assert!(limiter.try_acquire(2).unwrap().is_admitted());

        clock.rewind(Duration::from_secs(3));
        let outcome = limiter.try_acquire(1).unwrap();
        assert!(outcome.is_rejected());
        assert_eq!(outcome.retry_after(), Some(Duration::from_secs(8)));

        // The window opened at construction and still closes at 10s
        clock.advance(Duration::from_secs(7));
        assert!(limiter.try_acquire(1).unwrap().is_rejected());
        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire(1).unwrap().is_admitted());
    }

    #[test]
    fn test_full_window_at_u32_max_limit() {
        let clock = Arc::new(ManualClock::new());
        let options = FixedWindowOptions::new(u32::MAX, Duration::from_secs(10));
        let limiter = FixedWindowLimiter::new(options, clock.clone()).unwrap();

        assert!(limiter.try_acquire(u32::MAX).unwrap().is_admitted());
        let outcome = limiter.try_acquire(1).unwrap();
        assert!(outcome.is_rejected());
        assert_eq!(outcome.retry_after(), Some(Duration::from_secs(10)));
        assert_eq!(limiter.current_count(), u32::MAX);

        clock.advance(Duration::from_secs(10));
        assert!(limiter.try_acquire(1).unwrap().is_admitted());
    }

    #[test]
    fn test_closed_limiter_rejects_acquire() {
        let (_clock, limiter) = limiter(2, 10);
        limiter.close();
        let err = limiter.try_acquire(1).unwrap_err();
        assert!(matches!(err, TurnstileError::ProtocolMisuse(_)));
    }

    #[test]
    fn test_statistics_count_outcomes() {
        let (_clock, limiter) = limiter(1, 10);
        let _ = limiter.try_acquire(1).unwrap();
        let _ = limiter.try_acquire(1).unwrap();

        let stats = limiter.statistics();
        assert_eq!(stats.total_successful_leases, 1);
        assert_eq!(stats.total_failed_leases, 1);
    }
}
