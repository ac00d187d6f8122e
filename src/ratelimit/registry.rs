//! Named limiters.
//!
//! The registry maps a policy name to a constructed limiter. It is filled
//! once at startup; every hot-path decision happens inside the limiters
//! themselves.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::limiter::{Limiter, LimiterStatistics};
use super::permit::{Outcome, Permit};
use super::policy::Policy;
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// Limiters indexed by policy name.
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<dyn Limiter>>,
    clock: Arc<dyn Clock>,
}

impl LimiterRegistry {
    /// Create an empty registry whose limiters read time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            limiters: DashMap::new(),
            clock,
        }
    }

    /// Build a registry holding every policy in `config`.
    pub fn from_config(config: &TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = Self::new(clock);
        for (name, policy) in &config.policies {
            registry.register(name, policy.clone())?;
        }
        info!(policies = registry.len(), "Limiter registry initialized");
        Ok(registry)
    }

    /// Validate `policy`, construct its limiter and store it under `name`.
    pub fn register(&self, name: &str, policy: Policy) -> Result<Arc<dyn Limiter>> {
        if name.trim().is_empty() {
            return Err(TurnstileError::Config(
                "policy name must not be empty".to_string(),
            ));
        }

        match self.limiters.entry(name.to_string()) {
            Entry::Occupied(_) => Err(TurnstileError::DuplicatePolicy(name.to_string())),
            Entry::Vacant(slot) => {
                let limiter = policy.build(self.clock.clone()).map_err(|e| match e {
                    TurnstileError::Config(msg) => {
                        TurnstileError::Config(format!("policy '{}': {}", name, msg))
                    }
                    other => other,
                })?;
                info!(
                    policy = %name,
                    kind = %policy.kind(),
                    "Registered limiter"
                );
                slot.insert(limiter.clone());
                Ok(limiter)
            }
        }
    }

    /// Look up the limiter registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Limiter>> {
        self.limiters
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TurnstileError::UnknownPolicy(name.to_string()))
    }

    /// Non-blocking acquisition against the named policy.
    pub fn try_acquire(&self, name: &str, permits: u32) -> Result<Outcome> {
        let outcome = self.resolve(name)?.try_acquire(permits)?;
        if outcome.is_rejected() {
            debug!(policy = %name, "Admission rejected");
        }
        Ok(outcome)
    }

    /// Acquisition against the named policy, waiting up to `timeout` where
    /// the policy queues.
    pub async fn acquire(
        &self,
        name: &str,
        permits: u32,
        timeout: Option<Duration>,
    ) -> Result<Outcome> {
        let limiter = self.resolve(name)?;
        let outcome = limiter.acquire(permits, timeout).await?;
        if outcome.is_rejected() {
            debug!(policy = %name, "Admission rejected");
        }
        Ok(outcome)
    }

    /// Give a permit back to the named policy.
    pub fn release(&self, name: &str, permit: Permit) -> Result<()> {
        self.resolve(name)?.release(permit)
    }

    /// Statistics for the named policy.
    pub fn statistics(&self, name: &str) -> Result<LimiterStatistics> {
        Ok(self.resolve(name)?.statistics())
    }

    /// Registered policy names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Close every registered limiter.
    pub fn close_all(&self) {
        for entry in self.limiters.iter() {
            entry.value().close();
        }
        info!(policies = self.len(), "Closed all limiters");
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("policies", &self.names())
            .finish()
    }
}
