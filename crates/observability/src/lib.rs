//! Process-wide logging setup shared by binaries and tests.

/// Initialize tracing from the environment.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() -> bool {
    tracing::init()
}

pub mod tracing;

pub use tracing::{LogFormat, UnknownLogFormat, init_with};
