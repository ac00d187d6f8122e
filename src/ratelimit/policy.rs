//! Limiter policies.
//!
//! A [`Policy`] is the immutable description of one limiter: its algorithm
//! and that algorithm's parameters. Policies are validated once, when the
//! limiter is built; a limiter never sees an invalid policy.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::Clock;
use super::concurrency::ConcurrencyLimiter;
use super::fixed_window::FixedWindowLimiter;
use super::limiter::{Limiter, LimiterKind};
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::error::{Result, TurnstileError};

/// Configuration for one limiter instance, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Policy {
    #[serde(rename = "fixed", alias = "fixed_window")]
    FixedWindow(FixedWindowOptions),
    #[serde(rename = "sliding", alias = "sliding_window")]
    SlidingWindow(SlidingWindowOptions),
    #[serde(rename = "token", alias = "token_bucket")]
    TokenBucket(TokenBucketOptions),
    #[serde(rename = "concurrency")]
    Concurrency(ConcurrencyOptions),
}

/// At most `permit_limit` admissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowOptions {
    pub permit_limit: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// At most `permit_limit` admissions in any trailing `window`, tracked in
/// `segments_per_window` segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowOptions {
    pub permit_limit: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub segments_per_window: u32,
}

/// A bucket of `token_limit` tokens refilled by `tokens_per_period` every
/// `replenishment_period`, continuously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketOptions {
    pub token_limit: u32,
    pub tokens_per_period: u32,
    #[serde(with = "humantime_serde")]
    pub replenishment_period: Duration,
}

/// At most `permit_limit` units of work in flight, with up to `queue_limit`
/// permits' worth of callers waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyOptions {
    pub permit_limit: u32,
    #[serde(default)]
    pub queue_limit: u32,
}

fn at_least_one(field: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(TurnstileError::Config(format!(
            "{} must be at least 1",
            field
        )));
    }
    Ok(())
}

fn positive(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(TurnstileError::Config(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

impl FixedWindowOptions {
    pub fn new(permit_limit: u32, window: Duration) -> Self {
        Self {
            permit_limit,
            window,
        }
    }

    pub fn validate(&self) -> Result<()> {
        at_least_one("permit_limit", self.permit_limit)?;
        positive("window", self.window)
    }
}

impl SlidingWindowOptions {
    pub fn new(permit_limit: u32, window: Duration, segments_per_window: u32) -> Self {
        Self {
            permit_limit,
            window,
            segments_per_window,
        }
    }

    /// Length of one segment.
    pub fn segment_length(&self) -> Duration {
        self.window / self.segments_per_window.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        at_least_one("permit_limit", self.permit_limit)?;
        positive("window", self.window)?;
        at_least_one("segments_per_window", self.segments_per_window)?;
        if self.segment_length().is_zero() {
            return Err(TurnstileError::Config(format!(
                "window of {:?} cannot be split into {} segments",
                self.window, self.segments_per_window
            )));
        }
        Ok(())
    }
}

impl TokenBucketOptions {
    pub fn new(token_limit: u32, tokens_per_period: u32, replenishment_period: Duration) -> Self {
        Self {
            token_limit,
            tokens_per_period,
            replenishment_period,
        }
    }

    /// Tokens added per second of elapsed time.
    pub fn refill_rate(&self) -> f64 {
        self.tokens_per_period as f64 / self.replenishment_period.as_secs_f64()
    }

    pub fn validate(&self) -> Result<()> {
        at_least_one("token_limit", self.token_limit)?;
        at_least_one("tokens_per_period", self.tokens_per_period)?;
        positive("replenishment_period", self.replenishment_period)
    }
}

impl ConcurrencyOptions {
    pub fn new(permit_limit: u32, queue_limit: u32) -> Self {
        Self {
            permit_limit,
            queue_limit,
        }
    }

    pub fn validate(&self) -> Result<()> {
        at_least_one("permit_limit", self.permit_limit)
    }
}

impl Policy {
    pub fn kind(&self) -> LimiterKind {
        match self {
            Policy::FixedWindow(_) => LimiterKind::FixedWindow,
            Policy::SlidingWindow(_) => LimiterKind::SlidingWindow,
            Policy::TokenBucket(_) => LimiterKind::TokenBucket,
            Policy::Concurrency(_) => LimiterKind::Concurrency,
        }
    }

    /// Check every parameter of the policy.
    pub fn validate(&self) -> Result<()> {
        let result = match self {
            Policy::FixedWindow(options) => options.validate(),
            Policy::SlidingWindow(options) => options.validate(),
            Policy::TokenBucket(options) => options.validate(),
            Policy::Concurrency(options) => options.validate(),
        };
        result.map_err(|e| match e {
            TurnstileError::Config(msg) => {
                TurnstileError::Config(format!("{} policy: {}", self.kind(), msg))
            }
            other => other,
        })
    }

    /// Validate the policy and construct its limiter.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn Limiter>> {
        self.validate()?;
        let limiter: Arc<dyn Limiter> = match *self {
            Policy::FixedWindow(options) => Arc::new(FixedWindowLimiter::new(options, clock)?),
            Policy::SlidingWindow(options) => Arc::new(SlidingWindowLimiter::new(options, clock)?),
            Policy::TokenBucket(options) => Arc::new(TokenBucketLimiter::new(options, clock)?),
            Policy::Concurrency(options) => Arc::new(ConcurrencyLimiter::new(options, clock)?),
        };
        Ok(limiter)
    }
}

impl From<FixedWindowOptions> for Policy {
    fn from(options: FixedWindowOptions) -> Self {
        Policy::FixedWindow(options)
    }
}

impl From<SlidingWindowOptions> for Policy {
    fn from(options: SlidingWindowOptions) -> Self {
        Policy::SlidingWindow(options)
    }
}

impl From<TokenBucketOptions> for Policy {
    fn from(options: TokenBucketOptions) -> Self {
        Policy::TokenBucket(options)
    }
}

impl From<ConcurrencyOptions> for Policy {
    fn from(options: ConcurrencyOptions) -> Self {
        Policy::Concurrency(options)
    }
}
