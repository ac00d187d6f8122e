//! The contract shared by every limiter.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::permit::{Outcome, Permit};
use crate::error::{Result, TurnstileError};

/// The limiting algorithm behind a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    Concurrency,
}

impl LimiterKind {
    /// The tag used for this kind in policy files.
    pub fn tag(&self) -> &'static str {
        match self {
            LimiterKind::FixedWindow => "fixed",
            LimiterKind::SlidingWindow => "sliding",
            LimiterKind::TokenBucket => "token",
            LimiterKind::Concurrency => "concurrency",
        }
    }

    /// Whether `acquire` on this kind can suspend the caller.
    pub fn is_blocking(&self) -> bool {
        matches!(self, LimiterKind::Concurrency)
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LimiterStatistics {
    /// Permits that could be admitted right now
    pub available_permits: u64,
    /// Permits held by callers waiting in a queue
    pub queued_permits: u64,
    /// Acquisitions that were admitted
    pub total_successful_leases: u64,
    /// Acquisitions that were rejected
    pub total_failed_leases: u64,
}

/// An admission-control limiter.
///
/// Implementations are safe to share across threads and tasks; each instance
/// serializes access to its own state and shares nothing with other
/// instances.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// The algorithm behind this limiter.
    fn kind(&self) -> LimiterKind;

    /// Attempt to admit `permits` units of work without waiting.
    ///
    /// A count of zero probes for free capacity without consuming any.
    fn try_acquire(&self, permits: u32) -> Result<Outcome>;

    /// Admit `permits` units of work, waiting up to `timeout` for capacity
    /// where the algorithm supports waiting.
    ///
    /// Only the concurrency limiter ever suspends; the other kinds answer
    /// exactly as [`Limiter::try_acquire`] does.
    async fn acquire(&self, permits: u32, _timeout: Option<Duration>) -> Result<Outcome> {
        self.try_acquire(permits)
    }

    /// Give a permit back.
    fn release(&self, permit: Permit) -> Result<()>;

    /// Snapshot of current capacity and lifetime counters.
    fn statistics(&self) -> LimiterStatistics;

    /// Stop admitting. Later acquisitions fail with
    /// [`TurnstileError::ProtocolMisuse`].
    fn close(&self);

    /// Attempt to admit a single unit of work.
    fn try_acquire_one(&self) -> Result<Outcome> {
        self.try_acquire(1)
    }

    /// Admit a single unit of work, waiting up to `timeout` where supported.
    async fn acquire_one(&self, timeout: Option<Duration>) -> Result<Outcome> {
        self.acquire(1, timeout).await
    }
}

/// Lifetime counters and the closed flag every limiter carries.
#[derive(Debug, Default)]
pub(crate) struct AdmissionLedger {
    closed: AtomicBool,
    successful: AtomicU64,
    failed: AtomicU64,
}

impl AdmissionLedger {
    /// Fail if the limiter was closed, or if `permits` could never be granted.
    pub(crate) fn check(&self, kind: LimiterKind, permits: u32, ceiling: u32) -> Result<()> {
        self.ensure_open(kind)?;
        if permits > ceiling {
            return Err(misuse(format!(
                "{} permits requested from a {} limiter with a ceiling of {}",
                permits, kind, ceiling
            )));
        }
        Ok(())
    }

    /// Fail if the limiter was closed.
    ///
    /// Limiters that queue call this again under their state lock, where
    /// `close` also flips the flag, so nothing slips in after a close.
    pub(crate) fn ensure_open(&self, kind: LimiterKind) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(misuse(format!("acquire on a closed {} limiter", kind)));
        }
        Ok(())
    }

    pub(crate) fn record(&self, outcome: &Outcome) {
        let counter = if outcome.is_admitted() {
            &self.successful
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn statistics(&self, available: u64, queued: u64) -> LimiterStatistics {
        LimiterStatistics {
            available_permits: available,
            queued_permits: queued,
            total_successful_leases: self.successful.load(Ordering::Relaxed),
            total_failed_leases: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Build a protocol-misuse error, logging it loudly on the way out.
pub(crate) fn misuse(message: String) -> TurnstileError {
    error!(reason = %message, "Limiter protocol misuse");
    TurnstileError::ProtocolMisuse(message)
}

/// Release handling for limiters whose permits are plain acknowledgments.
pub(crate) fn release_acknowledged(kind: LimiterKind, permit: Permit) -> Result<()> {
    match permit {
        Permit::Acknowledged => Ok(()),
        Permit::Lease(_) => Err(misuse(format!(
            "concurrency lease released to a {} limiter",
            kind
        ))),
    }
}
