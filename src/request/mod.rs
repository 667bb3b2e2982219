//! Outbound request orchestration: dedup, retry, rate limiting and stats.

mod limiter;
pub mod manager;
pub mod policy;
mod stats;

pub use limiter::RateLimiter;
pub use manager::{ExecuteOptions, ManagerSettings, RequestManager};
pub use policy::{RetryDecision, RetryPolicy, RetryRule};
pub use stats::{Counter, RequestStatCounters, RequestStats};
