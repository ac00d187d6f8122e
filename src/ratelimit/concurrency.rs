//! Concurrency limiter with a FIFO wait queue.
//!
//! Admission hands out a [`Lease`] that holds capacity until it is released,
//! explicitly through [`Limiter::release`] or implicitly when dropped. When
//! capacity is exhausted callers queue in arrival order. Each waiter parks on
//! its own oneshot channel, outside the lock; grants are decided and sent
//! under the lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use super::clock::Clock;
use super::limiter::{misuse, AdmissionLedger, Limiter, LimiterKind, LimiterStatistics};
use super::permit::{Outcome, Permit};
use super::policy::ConcurrencyOptions;
use crate::error::Result;

/// Bounds the number of units of work in flight.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct Shared {
    options: ConcurrencyOptions,
    state: Mutex<State>,
    ledger: AdmissionLedger,
}

#[derive(Debug)]
struct State {
    available: u32,
    queued_permits: u32,
    queue: VecDeque<Waiter>,
    /// Outstanding leases and the permits each one holds
    leases: HashMap<u64, u32>,
    next_id: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    permits: u32,
    grant: oneshot::Sender<u64>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_lease(&mut self, permits: u32) -> u64 {
        let id = self.next_id();
        self.available -= permits;
        self.leases.insert(id, permits);
        id
    }

    /// Return a lease's permits, then hand capacity to the queue.
    fn close_lease(&mut self, id: u64) -> bool {
        match self.leases.remove(&id) {
            Some(permits) => {
                self.available += permits;
                self.grant_waiters();
                true
            }
            None => false,
        }
    }

    /// Grant capacity to waiters from the head of the queue, stopping at the
    /// first one that does not fit so nobody is served out of order.
    fn grant_waiters(&mut self) {
        while let Some(head) = self.queue.front() {
            if head.permits > self.available {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.queued_permits -= waiter.permits;
            let lease = self.open_lease(waiter.permits);
            if waiter.grant.send(lease).is_err() {
                // The waiter vanished without leaving the queue; take the
                // capacity back and try the next one.
                self.leases.remove(&lease);
                self.available += waiter.permits;
                continue;
            }
            trace!(lease, permits = waiter.permits, "Granted queued waiter");
        }
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == id) {
            Some(position) => {
                if let Some(waiter) = self.queue.remove(position) {
                    self.queued_permits -= waiter.permits;
                }
                // A large request leaving the head may unblock smaller ones
                if position == 0 {
                    self.grant_waiters();
                }
                true
            }
            None => false,
        }
    }
}

impl Shared {
    fn lease(self: &Arc<Self>, id: u64, permits: u32) -> Lease {
        Lease {
            id,
            permits,
            limiter: Some(Arc::clone(self)),
        }
    }

    fn release_lease(&self, id: u64) -> bool {
        self.state.lock().close_lease(id)
    }
}

/// A claim on concurrency capacity.
///
/// Dropping a lease releases it, so capacity comes back on every exit path,
/// including unwinding.
pub struct Lease {
    id: u64,
    permits: u32,
    limiter: Option<Arc<Shared>>,
}

impl Lease {
    /// Permits held by this lease.
    pub fn permits(&self) -> u32 {
        self.permits
    }

    fn issued_by(&self, shared: &Arc<Shared>) -> bool {
        self.limiter
            .as_ref()
            .is_some_and(|owner| Arc::ptr_eq(owner, shared))
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("permits", &self.permits)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            if !limiter.release_lease(self.id) {
                error!(lease = self.id, "Dropped lease was not outstanding");
            }
        }
    }
}

/// A queued acquisition. Leaving the queue is tied to dropping this guard,
/// so a cancelled or timed-out caller can never be granted capacity it will
/// not use.
struct QueuedAcquire {
    shared: Arc<Shared>,
    waiter: u64,
    permits: u32,
    grant: oneshot::Receiver<u64>,
    settled: bool,
}

impl QueuedAcquire {
    /// Stop waiting. Returns the lease if a grant won the race.
    fn cancel(&mut self) -> Option<u64> {
        let mut state = self.shared.state.lock();
        if state.remove_waiter(self.waiter) {
            return None;
        }
        // Grants are sent under the lock, so once the waiter is gone the
        // lease id is already in the channel (or the limiter was closed).
        self.grant.try_recv().ok()
    }
}

impl Drop for QueuedAcquire {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(lease) = self.cancel() {
            self.shared.release_lease(lease);
        }
    }
}

impl ConcurrencyLimiter {
    pub fn new(options: ConcurrencyOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(State {
                    available: options.permit_limit,
                    queued_permits: 0,
                    queue: VecDeque::new(),
                    leases: HashMap::new(),
                    next_id: 0,
                }),
                ledger: AdmissionLedger::default(),
            }),
            clock,
        })
    }

    pub fn options(&self) -> &ConcurrencyOptions {
        &self.shared.options
    }

    /// Number of leases currently held.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().leases.len()
    }

    /// Admit `permits` units of work, waiting in the queue until capacity
    /// frees up or `cancel` completes, whichever comes first.
    ///
    /// Dropping the returned future also cancels the wait.
    pub async fn acquire_or_cancel<C>(&self, permits: u32, cancel: C) -> Result<Outcome>
    where
        C: Future<Output = ()> + Send,
    {
        let shared = &self.shared;
        shared
            .ledger
            .check(self.kind(), permits, shared.options.permit_limit)?;

        let mut queued = {
            let mut state = shared.state.lock();
            shared.ledger.ensure_open(self.kind())?;
            if let Some(outcome) = self.admit_now(&mut state, permits) {
                drop(state);
                shared.ledger.record(&outcome);
                return Ok(outcome);
            }

            let queued_after = state.queued_permits as u64 + permits as u64;
            if queued_after > shared.options.queue_limit as u64 {
                drop(state);
                debug!(
                    permits,
                    queue_limit = shared.options.queue_limit,
                    "Concurrency queue full"
                );
                let outcome = Outcome::rejected();
                shared.ledger.record(&outcome);
                return Ok(outcome);
            }

            let (grant, granted) = oneshot::channel();
            let waiter = state.next_id();
            state.queue.push_back(Waiter {
                id: waiter,
                permits,
                grant,
            });
            state.queued_permits += permits;
            trace!(
                waiter,
                permits,
                queued = state.queued_permits,
                "Queued for concurrency"
            );

            QueuedAcquire {
                shared: Arc::clone(shared),
                waiter,
                permits,
                grant: granted,
                settled: false,
            }
        };

        let grant = tokio::select! {
            granted = &mut queued.grant => granted.ok(),
            () = cancel => queued.cancel(),
        };
        queued.settled = true;

        let outcome = match grant {
            Some(id) => Outcome::Admitted(Permit::Lease(shared.lease(id, queued.permits))),
            None => Outcome::rejected(),
        };
        shared.ledger.record(&outcome);
        Ok(outcome)
    }

    /// Admit immediately when nobody is waiting and capacity is free.
    fn admit_now(&self, state: &mut State, permits: u32) -> Option<Outcome> {
        if permits == 0 {
            let outcome = if state.available > 0 {
                Outcome::admitted()
            } else {
                Outcome::rejected()
            };
            return Some(outcome);
        }
        if state.queue.is_empty() && state.available >= permits {
            let id = state.open_lease(permits);
            trace!(
                lease = id,
                permits,
                available = state.available,
                "Concurrency admitted"
            );
            return Some(Outcome::Admitted(Permit::Lease(self.shared.lease(id, permits))));
        }
        None
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::Concurrency
    }

    /// Admit without queueing: succeeds only when nobody is waiting and
    /// capacity is free right now.
    fn try_acquire(&self, permits: u32) -> Result<Outcome> {
        let shared = &self.shared;
        shared
            .ledger
            .check(self.kind(), permits, shared.options.permit_limit)?;

        let outcome = {
            let mut state = shared.state.lock();
            shared.ledger.ensure_open(self.kind())?;
            self.admit_now(&mut state, permits)
                .unwrap_or_else(Outcome::rejected)
        };
        shared.ledger.record(&outcome);
        Ok(outcome)
    }

    async fn acquire(&self, permits: u32, timeout: Option<Duration>) -> Result<Outcome> {
        match timeout {
            Some(timeout) => self.acquire_or_cancel(permits, self.clock.sleep(timeout)).await,
            None => self.acquire_or_cancel(permits, future::pending()).await,
        }
    }

    /// Return a lease.
    ///
    /// The only acknowledgments this limiter issues are zero-permit probes,
    /// which hold nothing, so any acknowledgment is accepted as a no-op.
    fn release(&self, permit: Permit) -> Result<()> {
        let mut lease = match permit {
            Permit::Acknowledged => return Ok(()),
            Permit::Lease(lease) => lease,
        };
        if !lease.issued_by(&self.shared) {
            return Err(misuse(format!(
                "lease {} was issued by a different limiter",
                lease.id
            )));
        }

        lease.limiter = None;
        if self.shared.release_lease(lease.id) {
            trace!(lease = lease.id, permits = lease.permits, "Lease released");
            Ok(())
        } else {
            Err(misuse(format!("lease {} is not outstanding", lease.id)))
        }
    }

    fn statistics(&self) -> LimiterStatistics {
        let (available, queued) = {
            let state = self.shared.state.lock();
            (state.available, state.queued_permits)
        };
        self.shared.ledger.statistics(available as u64, queued as u64)
    }

    /// Stop admitting and turn away everyone still queued.
    ///
    /// Outstanding leases stay valid and can still be released.
    fn close(&self) {
        // The flag flips under the state lock so no acquisition that checked
        // it earlier can still queue after the drain.
        let drained: Vec<Waiter> = {
            let mut state = self.shared.state.lock();
            if !self.shared.ledger.close() {
                return;
            }
            state.queued_permits = 0;
            state.queue.drain(..).collect()
        };
        debug!(rejected_waiters = drained.len(), "Concurrency limiter closed");
        // Dropping the senders resumes each waiter with a rejection
        drop(drained);
    }
}
