//! Activity log sink.
//!
//! Activity entries are an audit trail for operators, separate from the
//! orchestrator's event stream.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use erpbridge_core::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// One logged activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    pub severity: Severity,
    pub message: String,
    pub details: JsonValue,
    pub at: DateTime<Utc>,
}

pub trait ActivityLog: Send + Sync + 'static {
    fn log_activity(
        &self,
        connection_id: Option<&ConnectionId>,
        severity: Severity,
        message: &str,
        details: JsonValue,
    );
}

/// Writes activities as structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn log_activity(
        &self,
        connection_id: Option<&ConnectionId>,
        severity: Severity,
        message: &str,
        details: JsonValue,
    ) {
        let connection_id = connection_id.map(ConnectionId::as_str).unwrap_or("-");
        match severity {
            Severity::Debug => debug!(connection_id, %details, "{message}"),
            Severity::Info => info!(connection_id, %details, "{message}"),
            Severity::Warning => warn!(connection_id, %details, "{message}"),
            Severity::Error => error!(connection_id, %details, "{message}"),
        }
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryActivityLog {
    inner: Mutex<Vec<ActivityRecord>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<ActivityRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<ActivityRecord> {
        self.all().into_iter().filter(|r| r.severity == severity).collect()
    }
}

impl ActivityLog for InMemoryActivityLog {
    fn log_activity(
        &self,
        connection_id: Option<&ConnectionId>,
        severity: Severity,
        message: &str,
        details: JsonValue,
    ) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ActivityRecord {
                connection_id: connection_id.cloned(),
                severity,
                message: message.to_string(),
                details,
                at: Utc::now(),
            });
    }
}
