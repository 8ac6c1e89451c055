//! Connection-level data model: configuration, sync strategy, bulk results,
//! health and connector-emitted events.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entity::EntityKind;
use crate::error::ConnectorError;
use crate::id::{ConnectionId, ErpType};

/// Configuration of one connection.
///
/// `erp_type` selects the factory and cannot change once a connection exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub erp_type: ErpType,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_retry_limit: Option<u32>,
    /// Adapter-specific, non-secret settings (endpoints, store ids, ...).
    #[serde(default)]
    pub settings: JsonValue,
}

fn default_enabled() -> bool {
    true
}

impl ConnectorConfig {
    pub fn new(erp_type: impl Into<ErpType>, name: impl Into<String>) -> Self {
        Self {
            erp_type: erp_type.into(),
            name: name.into(),
            enabled: true,
            sync_interval_minutes: None,
            last_sync: None,
            rate_limit_per_minute: None,
            error_retry_limit: None,
            settings: JsonValue::Null,
        }
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    pub fn with_retry_limit(mut self, retries: u32) -> Self {
        self.error_retry_limit = Some(retries);
        self
    }

    pub fn with_settings(mut self, settings: JsonValue) -> Self {
        self.settings = settings;
        self
    }
}

/// Cadence of a sync strategy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    Full,
    Incremental,
    RealTime,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Full => "full",
            SyncKind::Incremental => "incremental",
            SyncKind::RealTime => "real-time",
        }
    }
}

impl core::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How disagreeing sources are reconciled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    #[default]
    LastWriteWins,
    Merge,
    Manual,
    MasterWins,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriteWins => "last-write-wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Manual => "manual",
            ResolutionStrategy::MasterWins => "master-wins",
        }
    }
}

impl core::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-write-wins" => Ok(Self::LastWriteWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            "master-wins" => Ok(Self::MasterWins),
            other => Err(ConnectorError::validation(format!(
                "unknown conflict resolution strategy: {other}"
            ))),
        }
    }
}

/// Sync policy attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStrategy {
    pub kind: SyncKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u64>,
    pub entities: Vec<EntityKind>,
    pub conflict_resolution: ResolutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_connection_id: Option<ConnectionId>,
}

impl SyncStrategy {
    pub fn new(kind: SyncKind, entities: Vec<EntityKind>) -> Self {
        Self {
            kind,
            interval_minutes: None,
            entities,
            conflict_resolution: ResolutionStrategy::default(),
            master_connection_id: None,
        }
    }

    pub fn every_minutes(mut self, minutes: u64) -> Self {
        self.interval_minutes = Some(minutes);
        self
    }

    pub fn resolve_with(mut self, strategy: ResolutionStrategy) -> Self {
        self.conflict_resolution = strategy;
        self
    }

    pub fn with_master(mut self, master: impl Into<ConnectionId>) -> Self {
        self.conflict_resolution = ResolutionStrategy::MasterWins;
        self.master_connection_id = Some(master.into());
        self
    }

    /// Whether a recurring timer should drive this strategy.
    pub fn is_scheduled(&self) -> bool {
        self.kind != SyncKind::RealTime && self.interval_minutes.is_some_and(|m| m > 0)
    }

    pub fn covers(&self, kind: EntityKind) -> bool {
        self.entities.contains(&kind)
    }
}

/// Failure of one item in a batch write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemError {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub message: String,
}

/// Summary of a batch write. Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BulkResult {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<BulkItemError>,
    pub duration_ms: u64,
}

impl BulkResult {
    pub fn is_complete_success(&self) -> bool {
        self.failed == 0
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Health snapshot reported by a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectorHealth {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    /// Seconds since the last successful connect.
    pub uptime_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectorHealth {
    pub fn disconnected(last_error: Option<String>) -> Self {
        Self {
            connected: false,
            last_sync: None,
            uptime_secs: 0,
            last_error,
        }
    }
}

/// Kind of change or lifecycle signal a connector emits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorEventKind {
    Created,
    Updated,
    Deleted,
    Disconnected,
    Error,
}

/// Event emitted by a connector (webhook, subscription or lifecycle change).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorEvent {
    pub kind: ConnectorEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_kind: Option<EntityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl ConnectorEvent {
    pub fn change(kind: ConnectorEventKind, entity_kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_kind: Some(entity_kind),
            entity_id: Some(entity_id.into()),
            payload: JsonValue::Null,
            occurred_at: Utc::now(),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            kind: ConnectorEventKind::Disconnected,
            entity_kind: None,
            entity_id: None,
            payload: JsonValue::Null,
            occurred_at: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ConnectorEventKind::Error,
            entity_kind: None,
            entity_id: None,
            payload: JsonValue::String(message.into()),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    /// Created/updated events warrant a re-sync of their entity kind.
    pub fn is_data_change(&self) -> bool {
        matches!(self.kind, ConnectorEventKind::Created | ConnectorEventKind::Updated)
            && self.entity_kind.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_match_wire_format() {
        for s in [
            ResolutionStrategy::LastWriteWins,
            ResolutionStrategy::Merge,
            ResolutionStrategy::Manual,
            ResolutionStrategy::MasterWins,
        ] {
            let json = serde_json::to_value(s).unwrap();
            assert_eq!(json, serde_json::json!(s.as_str()));
            assert_eq!(s.as_str().parse::<ResolutionStrategy>().unwrap(), s);
        }
    }

    #[test]
    fn sync_kind_names_match_wire_format() {
        for k in [SyncKind::Full, SyncKind::Incremental, SyncKind::RealTime] {
            assert_eq!(serde_json::to_value(k).unwrap(), serde_json::json!(k.as_str()));
            assert_eq!(k.to_string(), k.as_str());
        }
        assert_eq!(SyncKind::RealTime.as_str(), "real-time");
    }

    #[test]
    fn real_time_strategies_are_never_scheduled() {
        let rt = SyncStrategy::new(SyncKind::RealTime, vec![EntityKind::Orders]).every_minutes(5);
        assert!(!rt.is_scheduled());
        let inc = SyncStrategy::new(SyncKind::Incremental, vec![EntityKind::Orders]).every_minutes(5);
        assert!(inc.is_scheduled());
        assert!(!SyncStrategy::new(SyncKind::Full, vec![]).is_scheduled());
    }

    #[test]
    fn only_create_and_update_are_data_changes() {
        assert!(ConnectorEvent::change(ConnectorEventKind::Updated, EntityKind::Products, "P1").is_data_change());
        assert!(!ConnectorEvent::change(ConnectorEventKind::Deleted, EntityKind::Products, "P1").is_data_change());
        assert!(!ConnectorEvent::disconnected().is_data_change());
    }
}
