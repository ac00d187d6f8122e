//! Sliding window limiter.
//!
//! The window is split into `segments_per_window` segments kept in a ring
//! with one extra slot. The extra slot holds the segment that has just slid
//! out of the newest `segments_per_window`; it is still partly inside the
//! trailing window, and its count is weighted by how much of it is. That
//! linear interpolation is what smooths out the fixed window cliff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{elapsed_since, Clock};
use super::limiter::{
    release_acknowledged, AdmissionLedger, Limiter, LimiterKind, LimiterStatistics,
};
use super::permit::{Outcome, Permit};
use super::policy::SlidingWindowOptions;
use crate::error::Result;

/// Bounds admissions over any trailing window using segment counters.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    options: SlidingWindowOptions,
    segment_length: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<SegmentRing>,
    ledger: AdmissionLedger,
}

#[derive(Debug)]
struct SegmentRing {
    counts: Vec<u32>,
    /// Slot of the active segment
    current: usize,
    /// When the active segment started
    segment_start: Instant,
}

impl SegmentRing {
    fn new(slots: usize, start: Instant) -> Self {
        Self {
            counts: vec![0; slots],
            current: 0,
            segment_start: start,
        }
    }

    /// Rotate past every segment that has fully elapsed, zeroing each slot as
    /// it becomes active again.
    fn advance(&mut self, now: Instant, segment_length: Duration) {
        let elapsed = elapsed_since(now, self.segment_start);
        let segment_nanos = segment_length.as_nanos();
        let steps = elapsed.as_nanos() / segment_nanos;
        if steps == 0 {
            return;
        }

        let slots = self.counts.len();
        // After one lap every slot is zero, further laps change nothing
        let to_clear = steps.min(slots as u128) as usize;
        for _ in 0..to_clear {
            self.current = (self.current + 1) % slots;
            self.counts[self.current] = 0;
        }

        let into_segment = Duration::from_nanos((elapsed.as_nanos() % segment_nanos) as u64);
        self.segment_start = now - into_segment;
    }

    fn oldest(&self) -> usize {
        (self.current + 1) % self.counts.len()
    }

    /// Fraction of the active segment that has elapsed, in `[0, 1)`.
    fn progress(&self, now: Instant, segment_length: Duration) -> f64 {
        let into_segment = now.saturating_duration_since(self.segment_start);
        (into_segment.as_secs_f64() / segment_length.as_secs_f64()).min(1.0)
    }

    /// Admissions inside the trailing window, with the oldest segment
    /// weighted by the part of it still inside.
    fn effective_count(&self, progress: f64) -> f64 {
        let oldest = self.oldest();
        self.counts
            .iter()
            .enumerate()
            .map(|(slot, &count)| {
                if slot == oldest {
                    count as f64 * (1.0 - progress)
                } else {
                    count as f64
                }
            })
            .sum()
    }

    /// How long until the effective count drops by more than `excess`,
    /// measured in segments.
    fn segments_until_drop(&self, progress: f64, excess: f64) -> f64 {
        let slots = self.counts.len();
        let oldest = self.oldest();

        // The oldest segment drains linearly over the rest of this segment
        let count = self.counts[oldest] as f64;
        let weight = 1.0 - progress;
        if count * weight > excess {
            return excess / count;
        }
        let mut remaining = excess - count * weight;
        let mut waited = weight;

        // Each newer segment then drains over one full segment length
        for step in 1..slots {
            let count = self.counts[(oldest + step) % slots] as f64;
            if count > remaining {
                return waited + remaining / count;
            }
            remaining -= count;
            waited += 1.0;
        }
        waited
    }
}

impl SlidingWindowLimiter {
    pub fn new(options: SlidingWindowOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;
        let slots = options.segments_per_window as usize + 1;
        let start = clock.now();
        Ok(Self {
            options,
            segment_length: options.segment_length(),
            clock,
            state: Mutex::new(SegmentRing::new(slots, start)),
            ledger: AdmissionLedger::default(),
        })
    }

    pub fn options(&self) -> &SlidingWindowOptions {
        &self.options
    }

    /// Admissions currently counted against the window, interpolated.
    pub fn effective_count(&self) -> f64 {
        let now = self.clock.now();
        let mut ring = self.state.lock();
        ring.advance(now, self.segment_length);
        ring.effective_count(ring.progress(now, self.segment_length))
    }

    fn retry_after(&self, ring: &SegmentRing, progress: f64, excess: f64) -> Duration {
        let segments = ring.segments_until_drop(progress, excess.max(0.0));
        // to the nearest microsecond, absorbing float noise in the interpolation
        let micros = (segments * self.segment_length.as_secs_f64() * 1e6).round();
        Duration::from_micros(micros.max(0.0) as u64).min(self.options.window)
    }
}

impl Limiter for SlidingWindowLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::SlidingWindow
    }

    fn try_acquire(&self, permits: u32) -> Result<Outcome> {
        self.ledger
            .check(self.kind(), permits, self.options.permit_limit)?;

        let now = self.clock.now();
        let limit = self.options.permit_limit as f64;
        let outcome = {
            let mut ring = self.state.lock();
            ring.advance(now, self.segment_length);
            let progress = ring.progress(now, self.segment_length);
            let effective = ring.effective_count(progress);

            // A request of n permits fits when the first of them would
            let threshold = limit - permits.max(1) as f64 + 1.0;
            if effective < threshold {
                let current = ring.current;
                // admission bounds the active slot by permit_limit
                ring.counts[current] = ring.counts[current].saturating_add(permits);
                trace!(
                    effective,
                    limit = self.options.permit_limit,
                    "Sliding window admitted"
                );
                Outcome::admitted()
            } else {
                Outcome::rejected_for(self.retry_after(&ring, progress, effective - threshold))
            }
        };

        if let Some(retry_after) = outcome.retry_after() {
            debug!(
                permits,
                limit = self.options.permit_limit,
                retry_after_ms = retry_after.as_millis() as u64,
                "Sliding window exhausted"
            );
        }
        self.ledger.record(&outcome);
        Ok(outcome)
    }

    fn release(&self, permit: Permit) -> Result<()> {
        release_acknowledged(self.kind(), permit)
    }

    fn statistics(&self) -> LimiterStatistics {
        let headroom = self.options.permit_limit as f64 - self.effective_count();
        self.ledger.statistics(headroom.max(0.0).ceil() as u64, 0)
    }

    fn close(&self) {
        if self.ledger.close() {
            debug!("Sliding window limiter closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn limiter(
        limit: u32,
        window_secs: u64,
        segments: u32,
    ) -> (Arc<ManualClock>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::new());
        let options = SlidingWindowOptions::new(limit, Duration::from_secs(window_secs), segments);
        let limiter = SlidingWindowLimiter::new(options, clock.clone()).unwrap();
        (clock, limiter)
    }

    #[test]
    fn test_fresh_limiter_reports_full_capacity() {
        let (_clock, limiter) = limiter(20, 120, 4);
        assert_eq!(limiter.statistics().available_permits, 20);
        assert_eq!(limiter.effective_count(), 0.0);
    }

    #[test]
    fn test_evenly_spread_admissions_fill_window() {
        let (clock, limiter) = limiter(20, 120, 4);

        for i in 0..20 {
            if i > 0 {
                clock.advance(Duration::from_secs(6));
            }
            assert!(limiter.try_acquire(1).unwrap().is_admitted(), "request {}", i);
        }

        // The 21st, immediately after the 20th, is over the limit
        let outcome = limiter.try_acquire(1).unwrap();
        assert!(outcome.is_rejected());
        // Nothing leaves the window until the first segment starts sliding out
        assert_eq!(outcome.retry_after(), Some(Duration::from_secs(6)));
    }

    #[test]
    fn test_oldest_segment_is_interpolated() {
        let (clock, limiter) = limiter(20, 120, 4);
        assert!(limiter.try_acquire(20).unwrap().is_admitted());

        // A full window later the burst is still entirely counted
        clock.advance(Duration::from_secs(120));
        assert!(limiter.try_acquire(1).unwrap().is_rejected());

        // Halfway through the next segment, half of it has slid out
        clock.advance(Duration::from_secs(15));
        assert_eq!(limiter.effective_count(), 10.0);
        for _ in 0..10 {
            assert!(limiter.try_acquire(1).unwrap().is_admitted());
        }
        assert!(limiter.try_acquire(1).unwrap().is_rejected());
    }

    #[test]
    fn test_counts_expire_after_window_and_a_segment() {
        let (clock, limiter) = limiter(10, 10, 2);
        assert!(limiter.try_acquire(10).unwrap().is_admitted());

        clock.advance(Duration::from_secs(15));
        assert_eq!(limiter.effective_count(), 0.0);
        assert_eq!(limiter.statistics().available_permits, 10);
    }

    #[test]
    fn test_long_idle_clears_ring() {
        let (clock, limiter) = limiter(5, 4, 4);
        assert!(limiter.try_acquire(5).unwrap().is_admitted());

        clock.advance(Duration::from_secs(3600));
        assert_eq!(limiter.effective_count(), 0.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire(1).unwrap().is_admitted());
        }
    }

    #[test]
    fn test_retry_after_tracks_draining_segment() {
        let (clock, limiter) = limiter(4, 4, 4);
        assert!(limiter.try_acquire(4).unwrap().is_admitted());

        // All four sit in the first segment, which starts sliding out at 4s
        let outcome = limiter.try_acquire(1).unwrap();
        assert_eq!(outcome.retry_after(), Some(Duration::from_secs(4)));

        clock.advance(Duration::from_secs(4));
        let outcome = limiter.try_acquire(2).unwrap();
        // Needs the count to fall below 3: a quarter of the segment
        assert_eq!(outcome.retry_after(), Some(Duration::from_millis(250)));

        clock.advance(Duration::from_millis(500));
        assert!(limiter.try_acquire(2).unwrap().is_admitted());
    }

    #[test]
    fn test_never_exceeds_limit_in_trailing_window() {
        let (clock, limiter) = limiter(10, 10, 5);
        let mut admitted_at: Vec<Duration> = Vec::new();
        let mut elapsed = Duration::ZERO;

        for _ in 0..400 {
            if limiter.try_acquire(1).unwrap().is_admitted() {
                admitted_at.push(elapsed);
            }
            clock.advance(Duration::from_millis(250));
            elapsed += Duration::from_millis(250);
        }

        let window = Duration::from_secs(10);
        for (i, start) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[i..]
                .iter()
                .take_while(|t| **t < *start + window)
                .count();
            // One segment's worth of slack covers interpolation rounding
            assert!(in_window <= 12, "{} admissions in window at {:?}", in_window, start);
        }
    }

    #[test]
    fn test_full_window_at_u32_max_limit() {
        let (clock, limiter) = limiter(u32::MAX, 10, 2);

        assert!(limiter.try_acquire(u32::MAX).unwrap().is_admitted());
        assert!(limiter.try_acquire(1).unwrap().is_rejected());
        assert_eq!(limiter.effective_count(), u32::MAX as f64);

        // A window plus a segment later the whole burst has slid out
        clock.advance(Duration::from_secs(15));
        assert!(limiter.try_acquire(1).unwrap().is_admitted());
    }

    #[test]
    fn test_clock_rollback_keeps_counts() {
        let (clock, limiter) = limiter(3, 3, 3);
        clock.advance(Duration::from_millis(2500));
        assert!(limiter.try_acquire(3).unwrap().is_admitted());

        clock.rewind(Duration::from_secs(2));
        assert!(limiter.try_acquire(1).unwrap().is_rejected());
        assert_eq!(limiter.effective_count(), 3.0);
    }

    #[test]
    fn test_zero_permit_probe() {
        let (_clock, limiter) = limiter(1, 10, 2);
        assert!(limiter.try_acquire(0).unwrap().is_admitted());
        assert!(limiter.try_acquire(1).unwrap().is_admitted());
        assert!(limiter.try_acquire(0).unwrap().is_rejected());
    }
}
