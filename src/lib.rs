//! Turnstile - In-process Admission Control
//!
//! This crate gates units of work (requests, RPCs, jobs) against throughput
//! and concurrency budgets. Four algorithms sit behind one [`Limiter`]
//! contract: fixed window, sliding window, token bucket, and a concurrency
//! limiter with a FIFO wait queue. Each limiter guards only its own process;
//! there is no cross-instance coordination.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use turnstile::ratelimit::{FixedWindowOptions, LimiterRegistry, SystemClock};
//!
//! let registry = LimiterRegistry::new(Arc::new(SystemClock));
//! registry
//!     .register("api", FixedWindowOptions::new(2, Duration::from_secs(10)).into())
//!     .unwrap();
//!
//! assert!(registry.try_acquire("api", 1).unwrap().is_admitted());
//! assert!(registry.try_acquire("api", 1).unwrap().is_admitted());
//!
//! let rejected = registry.try_acquire("api", 1).unwrap();
//! assert!(rejected.retry_after().is_some());
//! ```
//!
//! [`Limiter`]: ratelimit::Limiter

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
