//! Infrastructure shared by connectors and the orchestrator: execution
//! utilities, runtime configuration and the activity log.

pub mod activity;
pub mod config;
pub mod exec;

pub use activity::{ActivityLog, ActivityRecord, InMemoryActivityLog, Severity, TracingActivityLog};
pub use config::BridgeConfig;
pub use exec::{
    BatchProgress, RateLimiter, RetryPolicy, TtlCache, execute_with_retry, process_batch, run_bulk,
};
