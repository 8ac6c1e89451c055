//! Grouping fetched records by logical id and spotting disagreements.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use erpbridge_core::{
    ConflictKind, ConflictSource, ConnectionId, ConnectorError, DataConflict, EntityKind, EntityRecord, ErpType,
};

/// Salient fields compared per entity kind.
///
/// Only these top-level fields decide whether two sources disagree; everything else
/// (timestamps, vendor extras) is ignored. Numbers compare by value, so `10` and
/// `10.0` are equal, and an explicit `null` equals an absent field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonPolicy {
    fields: HashMap<EntityKind, Vec<String>>,
}

impl Default for ComparisonPolicy {
    fn default() -> Self {
        let mut fields = HashMap::new();
        fields.insert(EntityKind::Products, strings(&["sku", "name", "price"]));
        fields.insert(EntityKind::Inventory, strings(&["quantity", "location"]));
        fields.insert(EntityKind::Orders, strings(&["status", "total"]));
        fields.insert(EntityKind::Customers, strings(&["name", "email"]));
        Self { fields }
    }
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

impl ComparisonPolicy {
    /// Replace the salient field set for `kind`.
    pub fn with_fields<I, S>(mut self, kind: EntityKind, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.insert(kind, fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn fields_for(&self, kind: EntityKind) -> &[String] {
        self.fields.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether `a` and `b` disagree on any salient field of `kind`.
    pub fn differs(&self, kind: EntityKind, a: &JsonValue, b: &JsonValue) -> Result<bool, ConnectorError> {
        let (Some(a), Some(b)) = (a.as_object(), b.as_object()) else {
            return Err(ConnectorError::ConflictDetection(format!(
                "{kind} data must be an object to compare"
            )));
        };
        Ok(self
            .fields_for(kind)
            .iter()
            .any(|f| !values_equal(a.get(f), b.get(f))))
    }
}

fn values_equal(a: Option<&JsonValue>, b: Option<&JsonValue>) -> bool {
    match (a, b) {
        (None | Some(JsonValue::Null), None | Some(JsonValue::Null)) => true,
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => x.as_f64() == y.as_f64(),
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// One record as fetched from one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub connection_id: ConnectionId,
    pub origin: ErpType,
    pub priority: i32,
    pub record: EntityRecord,
    /// When the record was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl Observation {
    /// Snapshot for a conflict. `observed_at` is the source's own modification time
    /// when it reports one, the fetch time otherwise.
    pub fn to_source(&self) -> ConflictSource {
        ConflictSource {
            connection_id: self.connection_id.clone(),
            origin: self.origin.clone(),
            priority: self.priority,
            data: self.record.data.clone(),
            observed_at: self.record.updated_at.unwrap_or(self.fetched_at),
            version: self.record.version,
        }
    }
}

/// Outcome of a detection pass.
#[derive(Debug, Default)]
pub struct Detection {
    pub conflicts: Vec<DataConflict>,
    /// Entity ids skipped because their data could not be compared.
    pub malformed: Vec<(String, ConnectorError)>,
}

/// Group observations by entity id and build a conflict for each disagreement.
///
/// - Two or more connections with differing salient fields yield one
///   `update_conflict` holding one source per connection.
/// - One connection returning the same id more than once with differing fields
///   yields a `duplicate` conflict holding those copies.
pub fn detect_conflicts(kind: EntityKind, observations: &[Observation], policy: &ComparisonPolicy) -> Detection {
    let mut by_id: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for obs in observations.iter().filter(|o| o.record.kind == kind) {
        by_id.entry(obs.record.id.as_str()).or_default().push(obs);
    }

    let mut detection = Detection::default();
    for (id, group) in by_id {
        match detect_for_entity(kind, id, &group, policy) {
            Ok(found) => detection.conflicts.extend(found),
            Err(e) => detection.malformed.push((id.to_string(), e)),
        }
    }
    detection
}

fn detect_for_entity(
    kind: EntityKind,
    id: &str,
    group: &[&Observation],
    policy: &ComparisonPolicy,
) -> Result<Vec<DataConflict>, ConnectorError> {
    let mut per_connection: BTreeMap<&ConnectionId, Vec<&Observation>> = BTreeMap::new();
    for obs in group {
        per_connection.entry(&obs.connection_id).or_default().push(obs);
    }

    let mut conflicts = Vec::new();

    for copies in per_connection.values() {
        if copies.len() > 1 && any_pair_differs(kind, copies, policy)? {
            conflicts.push(DataConflict::new(
                ConflictKind::Duplicate,
                kind,
                id,
                copies.iter().map(|o| o.to_source()).collect(),
            )?);
        }
    }

    let representatives: Vec<&Observation> = per_connection.values().filter_map(|c| c.first().copied()).collect();
    if representatives.len() > 1 && any_pair_differs(kind, &representatives, policy)? {
        conflicts.push(DataConflict::new(
            ConflictKind::UpdateConflict,
            kind,
            id,
            representatives.iter().map(|o| o.to_source()).collect(),
        )?);
    }

    Ok(conflicts)
}

fn any_pair_differs(kind: EntityKind, group: &[&Observation], policy: &ComparisonPolicy) -> Result<bool, ConnectorError> {
    let Some((first, rest)) = group.split_first() else {
        return Ok(false);
    };
    for other in rest {
        if policy.differs(kind, &first.record.data, &other.record.data)? {
            return Ok(true);
        }
    }
    Ok(false)
}
