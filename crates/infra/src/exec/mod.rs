//! Execution utilities shared by every connector: retry with backoff, a
//! sliding-window rate limiter, a TTL cache and chunked batch processing.

pub mod batch;
pub mod cache;
pub mod rate_limit;
pub mod retry;

pub use batch::{BatchProgress, process_batch, run_bulk};
pub use cache::TtlCache;
pub use rate_limit::RateLimiter;
pub use retry::{RetryPolicy, execute_with_retry};
