//! Rule-based conflict resolution.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use erpbridge_core::{
    ConflictSource, ConnectionId, DataConflict, EntityKind, Resolution, ResolutionAction, ResolutionStrategy,
};

use crate::error::ResolveError;

/// Turns pending conflicts into resolutions.
///
/// The strategy is picked per entity kind: a rule set with [`Self::with_rule`],
/// otherwise the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolver {
    default: ResolutionStrategy,
    master: Option<ConnectionId>,
    rules: HashMap<EntityKind, ResolutionStrategy>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolutionStrategy::LastWriteWins)
    }
}

impl ConflictResolver {
    pub fn new(default: ResolutionStrategy) -> Self {
        Self {
            default,
            master: None,
            rules: HashMap::new(),
        }
    }

    /// Connection whose data wins under `master-wins`.
    pub fn with_master(mut self, master: impl Into<ConnectionId>) -> Self {
        self.master = Some(master.into());
        self
    }

    pub fn with_rule(mut self, kind: EntityKind, strategy: ResolutionStrategy) -> Self {
        self.rules.insert(kind, strategy);
        self
    }

    pub fn strategy_for(&self, kind: EntityKind) -> ResolutionStrategy {
        self.rules.get(&kind).copied().unwrap_or(self.default)
    }

    /// Resolve one conflict, updating its status.
    ///
    /// Every strategy except `manual` closes the conflict; `manual` leaves it pending
    /// with a `manual_review` resolution.
    pub fn resolve(&self, conflict: &mut DataConflict) -> Result<Resolution, ResolveError> {
        if !conflict.is_pending() {
            return Err(ResolveError::NotPending(conflict.id));
        }

        let strategy = self.strategy_for(conflict.entity_kind);
        let resolution = match strategy {
            ResolutionStrategy::LastWriteWins => last_write_wins(conflict, "latest observation wins".to_string()),
            ResolutionStrategy::MasterWins => self.master_wins(conflict),
            ResolutionStrategy::Merge => merge(conflict)?,
            ResolutionStrategy::Manual => {
                debug!(conflict_id = %conflict.id, entity_id = %conflict.entity_id, "conflict queued for manual review");
                return Ok(Resolution {
                    conflict_id: conflict.id,
                    entity_kind: conflict.entity_kind,
                    entity_id: conflict.entity_id.clone(),
                    action: ResolutionAction::ManualReview,
                    chosen_source: None,
                    merged_data: None,
                    reason: "awaiting operator decision".to_string(),
                    resolved_at: None,
                });
            }
        };

        close(conflict)?;
        debug!(
            conflict_id = %conflict.id,
            entity_id = %conflict.entity_id,
            strategy = %strategy,
            action = ?resolution.action,
            "conflict resolved"
        );
        Ok(resolution)
    }

    /// Resolve every conflict; the output is in input order, one per conflict.
    pub fn resolve_all(&self, conflicts: &mut [DataConflict]) -> Result<Vec<Resolution>, ResolveError> {
        conflicts.iter_mut().map(|c| self.resolve(c)).collect()
    }

    /// Operator decision: accept the data from `connection_id`.
    pub fn accept_source(
        conflict: &mut DataConflict,
        connection_id: &ConnectionId,
        reason: impl Into<String>,
    ) -> Result<Resolution, ResolveError> {
        if !conflict.is_pending() {
            return Err(ResolveError::NotPending(conflict.id));
        }
        let source = conflict
            .source_from(connection_id)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownSource {
                conflict_id: conflict.id,
                connection_id: connection_id.clone(),
            })?;
        let resolution = accepted(conflict, source, reason.into());
        close(conflict)?;
        Ok(resolution)
    }

    fn master_wins(&self, conflict: &DataConflict) -> Resolution {
        match &self.master {
            Some(master) => match conflict.source_from(master) {
                Some(source) => accepted(conflict, source.clone(), format!("master connection {master} wins")),
                None => last_write_wins(
                    conflict,
                    format!("master connection {master} did not report this entity; latest observation wins"),
                ),
            },
            None => last_write_wins(
                conflict,
                "no master connection configured; latest observation wins".to_string(),
            ),
        }
    }
}

fn close(conflict: &mut DataConflict) -> Result<(), ResolveError> {
    conflict
        .mark_resolved()
        .map_err(|_| ResolveError::NotPending(conflict.id))
}

fn accepted(conflict: &DataConflict, source: ConflictSource, reason: String) -> Resolution {
    Resolution {
        conflict_id: conflict.id,
        entity_kind: conflict.entity_kind,
        entity_id: conflict.entity_id.clone(),
        action: ResolutionAction::Accept,
        chosen_source: Some(source),
        merged_data: None,
        reason,
        resolved_at: Some(Utc::now()),
    }
}

/// Latest `observed_at` wins; ties go to the higher priority, then the earlier source.
fn last_write_wins(conflict: &DataConflict, reason: String) -> Resolution {
    let winner = conflict
        .sources
        .iter()
        .reduce(|best, s| match newer(s, best) {
            Ordering::Greater => s,
            _ => best,
        })
        .cloned();

    match winner {
        Some(source) => accepted(conflict, source, reason),
        None => Resolution {
            conflict_id: conflict.id,
            entity_kind: conflict.entity_kind,
            entity_id: conflict.entity_id.clone(),
            action: ResolutionAction::Reject,
            chosen_source: None,
            merged_data: None,
            reason: "conflict has no sources".to_string(),
            resolved_at: Some(Utc::now()),
        },
    }
}

fn newer(a: &ConflictSource, b: &ConflictSource) -> Ordering {
    a.observed_at
        .cmp(&b.observed_at)
        .then(a.priority.cmp(&b.priority))
}

/// Shallow field union; on collision the higher-priority source wins, and among
/// equal priorities the later observation.
fn merge(conflict: &DataConflict) -> Result<Resolution, ResolveError> {
    let mut ordered: Vec<&ConflictSource> = conflict.sources.iter().collect();
    ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.observed_at.cmp(&b.observed_at)));

    let mut merged = Map::new();
    for source in ordered {
        let fields = source.data.as_object().ok_or_else(|| ResolveError::NotMergeable {
            conflict_id: conflict.id,
            connection_id: source.connection_id.clone(),
        })?;
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }
    }

    Ok(Resolution {
        conflict_id: conflict.id,
        entity_kind: conflict.entity_kind,
        entity_id: conflict.entity_id.clone(),
        action: ResolutionAction::Merge,
        chosen_source: None,
        merged_data: Some(JsonValue::Object(merged)),
        reason: format!("merged {} sources by priority", conflict.sources.len()),
        resolved_at: Some(Utc::now()),
    })
}
