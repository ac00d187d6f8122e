//! Admission outcomes and the permits they carry.

use std::time::Duration;

use super::concurrency::Lease;

/// Proof of admission handed back by a limiter.
#[derive(Debug)]
pub enum Permit {
    /// Capacity was consumed at acquisition time; nothing to give back.
    ///
    /// Issued by the fixed window, sliding window and token bucket limiters,
    /// and for zero-permit probes.
    Acknowledged,
    /// A live claim on concurrency capacity, returned on release or drop.
    Lease(Lease),
}

impl Permit {
    /// Whether this permit carries a release obligation.
    pub fn is_lease(&self) -> bool {
        matches!(self, Permit::Lease(_))
    }

    /// Number of permits held by this lease, zero for acknowledgments.
    pub fn permits(&self) -> u32 {
        match self {
            Permit::Acknowledged => 0,
            Permit::Lease(lease) => lease.permits(),
        }
    }
}

impl From<Lease> for Permit {
    fn from(lease: Lease) -> Self {
        Permit::Lease(lease)
    }
}

/// Result of an acquisition attempt.
#[derive(Debug)]
#[must_use = "a rejected outcome means the unit of work must not run"]
pub enum Outcome {
    /// The unit of work may proceed.
    Admitted(Permit),
    /// Capacity is exhausted.
    ///
    /// `retry_after` is an advisory lower bound on when a retry could
    /// succeed. It is `None` when capacity is not time-bound, as with a full
    /// concurrency queue.
    Rejected { retry_after: Option<Duration> },
}

impl Outcome {
    pub(crate) fn admitted() -> Self {
        Outcome::Admitted(Permit::Acknowledged)
    }

    pub(crate) fn rejected_for(retry_after: Duration) -> Self {
        Outcome::Rejected {
            retry_after: Some(retry_after),
        }
    }

    pub(crate) fn rejected() -> Self {
        Outcome::Rejected { retry_after: None }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Outcome::Admitted(_))
    }

    pub fn is_rejected(&self) -> bool {
        !self.is_admitted()
    }

    /// The retry hint of a rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Outcome::Admitted(_) => None,
            Outcome::Rejected { retry_after } => *retry_after,
        }
    }

    /// The retry hint rounded up to whole seconds, as used by a
    /// `Retry-After` response header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after().map(|d| {
            let secs = d.as_secs();
            if d.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }

    /// Take the permit out of an admitted outcome.
    pub fn into_permit(self) -> Option<Permit> {
        match self {
            Outcome::Admitted(permit) => Some(permit),
            Outcome::Rejected { .. } => None,
        }
    }
}
