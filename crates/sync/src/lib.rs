//! `erpbridge-sync`: keeps several ERP connections in agreement.
//!
//! [`SyncOrchestrator`] fans reads out to every connection, [`detect_conflicts`]
//! spots disagreements and [`ConflictResolver`] decides who wins.

pub mod detect;
pub mod error;
pub mod orchestrator;
pub mod resolver;

pub use detect::{ComparisonPolicy, Detection, Observation, detect_conflicts};
pub use error::{ResolveError, SyncError};
pub use orchestrator::{Connection, ConnectionHealth, EntitySyncReport, SyncOrchestrator, SyncReport};
pub use resolver::ConflictResolver;
