use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use erpbridge_core::{ConnectionId, ConnectorEvent, EntityKind, ErpType, Resolution};

/// An event with a stable wire tag and business time.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event tag (e.g. `"sync-started"`).
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// What a sync run covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SyncScope {
    /// `sync_all` over every (or one) entity kind.
    Full { entity_kinds: Vec<EntityKind> },
    /// Timer-driven sync configured on a connection.
    Scheduled { connection_id: ConnectionId, entity_kinds: Vec<EntityKind> },
    /// Debounced re-sync after connector change events.
    Triggered { entity_kind: EntityKind },
}

/// Outcome of one connection during one entity pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSyncResult {
    pub connection_id: ConnectionId,
    pub entity_kind: EntityKind,
    pub fetched: usize,
    pub written: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BridgeEvent {
    ErpAdded {
        connection_id: ConnectionId,
        erp_type: ErpType,
        priority: i32,
        at: DateTime<Utc>,
    },
    ErpRemoved {
        connection_id: ConnectionId,
        at: DateTime<Utc>,
    },
    SyncStarted {
        scope: SyncScope,
        at: DateTime<Utc>,
    },
    SyncCompleted {
        scope: SyncScope,
        results: Vec<ConnectionSyncResult>,
        conflicts: usize,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    SyncFailed {
        scope: SyncScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<ConnectionId>,
        error: String,
        at: DateTime<Utc>,
    },
    ConflictsResolved {
        entity_kind: EntityKind,
        resolutions: Vec<Resolution>,
        at: DateTime<Utc>,
    },
    Metric {
        name: String,
        value: f64,
        tags: BTreeMap<String, String>,
        at: DateTime<Utc>,
    },
    /// A connector event re-tagged with the connection it came from.
    ErpEvent {
        connection_id: ConnectionId,
        event: ConnectorEvent,
    },
}

impl BridgeEvent {
    pub fn metric(name: impl Into<String>, value: f64, tags: &[(&str, &str)]) -> Self {
        BridgeEvent::Metric {
            name: name.into(),
            value,
            tags: tags
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            at: Utc::now(),
        }
    }
}

impl Event for BridgeEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BridgeEvent::ErpAdded { .. } => "erp-added",
            BridgeEvent::ErpRemoved { .. } => "erp-removed",
            BridgeEvent::SyncStarted { .. } => "sync-started",
            BridgeEvent::SyncCompleted { .. } => "sync-completed",
            BridgeEvent::SyncFailed { .. } => "sync-failed",
            BridgeEvent::ConflictsResolved { .. } => "conflicts-resolved",
            BridgeEvent::Metric { .. } => "metric",
            BridgeEvent::ErpEvent { .. } => "erp-event",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BridgeEvent::ErpAdded { at, .. }
            | BridgeEvent::ErpRemoved { at, .. }
            | BridgeEvent::SyncStarted { at, .. }
            | BridgeEvent::SyncCompleted { at, .. }
            | BridgeEvent::SyncFailed { at, .. }
            | BridgeEvent::ConflictsResolved { at, .. }
            | BridgeEvent::Metric { at, .. } => *at,
            BridgeEvent::ErpEvent { event, .. } => event.occurred_at,
        }
    }
}
