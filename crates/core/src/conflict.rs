//! Conflicts between sources and the resolutions that close them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entity::EntityKind;
use crate::error::ConnectorError;
use crate::id::{ConflictId, ConnectionId, ErpType};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    UpdateConflict,
    Duplicate,
    MissingReference,
    ValidationError,
}

/// Conflict lifecycle. Only `Pending -> Resolved` and `Pending -> Ignored` exist.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

/// One connector's view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSource {
    pub connection_id: ConnectionId,
    /// ERP type of the connection the data came from.
    pub origin: ErpType,
    /// Priority of the originating connection (higher wins collisions).
    pub priority: i32,
    pub data: JsonValue,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// A detected disagreement between two or more sources about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConflict {
    pub id: ConflictId,
    pub kind: ConflictKind,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub sources: Vec<ConflictSource>,
    pub detected_at: DateTime<Utc>,
    status: ConflictStatus,
}

impl DataConflict {
    /// Build a pending conflict. At least two sources are required.
    pub fn new(
        kind: ConflictKind,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        sources: Vec<ConflictSource>,
    ) -> Result<Self, ConnectorError> {
        let entity_id = entity_id.into();
        if sources.len() < 2 {
            return Err(ConnectorError::ConflictDetection(format!(
                "conflict on {entity_kind} '{entity_id}' needs at least two sources, got {}",
                sources.len()
            )));
        }
        Ok(Self {
            id: ConflictId::new(),
            kind,
            entity_kind,
            entity_id,
            sources,
            detected_at: Utc::now(),
            status: ConflictStatus::Pending,
        })
    }

    pub fn status(&self) -> ConflictStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    pub fn mark_resolved(&mut self) -> Result<(), ConnectorError> {
        self.transition(ConflictStatus::Resolved)
    }

    pub fn mark_ignored(&mut self) -> Result<(), ConnectorError> {
        self.transition(ConflictStatus::Ignored)
    }

    fn transition(&mut self, to: ConflictStatus) -> Result<(), ConnectorError> {
        if self.status != ConflictStatus::Pending {
            return Err(ConnectorError::validation(format!(
                "conflict {} is already {:?}; cannot move to {:?}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn source_from(&self, connection_id: &ConnectionId) -> Option<&ConflictSource> {
        self.sources.iter().find(|s| &s.connection_id == connection_id)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Accept,
    Reject,
    Merge,
    ManualReview,
}

/// Decided outcome for exactly one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub conflict_id: ConflictId,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub action: ResolutionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_source: Option<ConflictSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_data: Option<JsonValue>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Resolution {
    /// The data every source should converge on, if the resolution decided one.
    pub fn winning_data(&self) -> Option<&JsonValue> {
        match self.action {
            ResolutionAction::Merge => self.merged_data.as_ref(),
            ResolutionAction::Accept => self.chosen_source.as_ref().map(|s| &s.data),
            ResolutionAction::Reject | ResolutionAction::ManualReview => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(conn: &str, price: f64) -> ConflictSource {
        ConflictSource {
            connection_id: conn.into(),
            origin: "test".into(),
            priority: 0,
            data: json!({ "id": "P1", "price": price }),
            observed_at: Utc::now(),
            version: None,
        }
    }

    #[test]
    fn conflict_needs_two_sources() {
        let err = DataConflict::new(ConflictKind::UpdateConflict, EntityKind::Products, "P1", vec![source("a", 1.0)]);
        assert!(matches!(err, Err(ConnectorError::ConflictDetection(_))));
    }

    #[test]
    fn status_only_leaves_pending_once() {
        let mut c = DataConflict::new(
            ConflictKind::UpdateConflict,
            EntityKind::Products,
            "P1",
            vec![source("a", 1.0), source("b", 2.0)],
        )
        .unwrap();
        assert!(c.is_pending());
        c.mark_resolved().unwrap();
        assert_eq!(c.status(), ConflictStatus::Resolved);
        assert!(c.mark_ignored().is_err());
        assert!(c.mark_resolved().is_err());
    }
}
