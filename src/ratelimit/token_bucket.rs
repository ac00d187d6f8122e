//! Token bucket limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{elapsed_since, Clock};
use super::limiter::{
    release_acknowledged, AdmissionLedger, Limiter, LimiterKind, LimiterStatistics,
};
use super::permit::{Outcome, Permit};
use super::policy::TokenBucketOptions;
use crate::error::Result;

/// Admits work while tokens remain; tokens refill continuously at
/// `tokens_per_period / replenishment_period` up to `token_limit`.
///
/// The bucket starts full. Refill is computed from the time elapsed since
/// the last access, so an idle limiter costs nothing.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    options: TokenBucketOptions,
    /// Tokens per second
    refill_rate: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<Bucket>,
    ledger: AdmissionLedger,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        // Only move forward: after a clock rollback the lost time is not
        // counted twice once the clock catches up again.
        let elapsed = elapsed_since(now, self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        // Excess refill is discarded, not banked
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        self.last_refill = now;
    }
}

impl TokenBucketLimiter {
    pub fn new(options: TokenBucketOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;
        let last_refill = clock.now();
        Ok(Self {
            options,
            refill_rate: options.refill_rate(),
            clock,
            state: Mutex::new(Bucket {
                tokens: options.token_limit as f64,
                last_refill,
            }),
            ledger: AdmissionLedger::default(),
        })
    }

    pub fn options(&self) -> &TokenBucketOptions {
        &self.options
    }

    /// Tokens currently in the bucket, including fractional refill.
    pub fn available_tokens(&self) -> f64 {
        let now = self.clock.now();
        let mut bucket = self.state.lock();
        bucket.refill(now, self.refill_rate, self.capacity());
        bucket.tokens
    }

    fn capacity(&self) -> f64 {
        self.options.token_limit as f64
    }

    /// Time to refill `deficit` tokens, to the nearest microsecond.
    fn time_to_refill(&self, deficit: f64) -> Duration {
        let micros = (deficit / self.refill_rate * 1e6).round();
        Duration::from_micros(micros.max(0.0) as u64)
    }
}

impl Limiter for TokenBucketLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::TokenBucket
    }

    fn try_acquire(&self, permits: u32) -> Result<Outcome> {
        self.ledger
            .check(self.kind(), permits, self.options.token_limit)?;

        let now = self.clock.now();
        let outcome = {
            let mut bucket = self.state.lock();
            bucket.refill(now, self.refill_rate, self.capacity());

            // A zero-permit probe needs one whole token to succeed
            let needed = permits.max(1) as f64;
            if bucket.tokens >= needed {
                bucket.tokens -= permits as f64;
                trace!(tokens = bucket.tokens, "Token bucket admitted");
                Outcome::admitted()
            } else {
                Outcome::rejected_for(self.time_to_refill(needed - bucket.tokens))
            }
        };

        if let Some(retry_after) = outcome.retry_after() {
            debug!(
                permits,
                limit = self.options.token_limit,
                retry_after_ms = retry_after.as_millis() as u64,
                "Token bucket empty"
            );
        }
        self.ledger.record(&outcome);
        Ok(outcome)
    }

    fn release(&self, permit: Permit) -> Result<()> {
        release_acknowledged(self.kind(), permit)
    }

    fn statistics(&self) -> LimiterStatistics {
        let tokens = self.available_tokens();
        self.ledger.statistics(tokens.max(0.0).floor() as u64, 0)
    }

    fn close(&self) {
        if self.ledger.close() {
            debug!("Token bucket limiter closed");
        }
    }
}
