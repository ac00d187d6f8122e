//! Rate limiting algorithms and the registry that names them.

mod clock;
mod concurrency;
mod fixed_window;
mod limiter;
mod permit;
mod policy;
mod registry;
mod sliding_window;
mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::{ConcurrencyLimiter, Lease};
pub use fixed_window::FixedWindowLimiter;
pub use limiter::{Limiter, LimiterKind, LimiterStatistics};
pub use permit::{Outcome, Permit};
pub use policy::{
    ConcurrencyOptions, FixedWindowOptions, Policy, SlidingWindowOptions, TokenBucketOptions,
};
pub use registry::LimiterRegistry;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
