//! Unified entities: the vendor-agnostic shapes every connector maps into.
//!
//! The logical `id` of a unified entity is the join key used to line up the same
//! record as seen by different connectors.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ConnectorError;

/// Kinds of entity the bridge synchronises.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Products,
    Inventory,
    Orders,
    Customers,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Products,
        EntityKind::Inventory,
        EntityKind::Orders,
        EntityKind::Customers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Products => "products",
            EntityKind::Inventory => "inventory",
            EntityKind::Orders => "orders",
            EntityKind::Customers => "customers",
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "products" | "product" => Ok(EntityKind::Products),
            "inventory" => Ok(EntityKind::Inventory),
            "orders" | "order" => Ok(EntityKind::Orders),
            "customers" | "customer" => Ok(EntityKind::Customers),
            other => Err(ConnectorError::validation(format!("unknown entity kind: {other}"))),
        }
    }
}

/// A unified entity with a stable logical id.
pub trait UnifiedEntity: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Logical id shared by every source that holds this entity.
    fn entity_id(&self) -> &str;

    /// Last modification time as reported by the source, if it tracks one.
    fn updated_at(&self) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub sku: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Stock level of one product at one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryLevel {
    pub id: String,
    pub sku: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: String,
    pub quantity: i64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub status: String,
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

macro_rules! impl_unified_entity {
    ($t:ty, $kind:expr) => {
        impl UnifiedEntity for $t {
            const KIND: EntityKind = $kind;

            fn entity_id(&self) -> &str {
                &self.id
            }

            fn updated_at(&self) -> Option<DateTime<Utc>> {
                self.updated_at
            }
        }
    };
}

impl_unified_entity!(Product, EntityKind::Products);
impl_unified_entity!(InventoryLevel, EntityKind::Inventory);
impl_unified_entity!(Order, EntityKind::Orders);
impl_unified_entity!(Customer, EntityKind::Customers);

/// Type-erased unified entity, as handled by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: String,
    pub data: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl EntityRecord {
    pub fn from_entity<E: UnifiedEntity>(entity: &E) -> Result<Self, ConnectorError> {
        let data = serde_json::to_value(entity)
            .map_err(|e| ConnectorError::validation(format!("serialize {}: {e}", E::KIND)))?;
        Ok(Self {
            kind: E::KIND,
            id: entity.entity_id().to_string(),
            data,
            updated_at: entity.updated_at(),
            version: None,
        })
    }

    /// Decode the payload back into its typed entity.
    pub fn to_entity<E: UnifiedEntity>(&self) -> Result<E, ConnectorError> {
        if self.kind != E::KIND {
            return Err(ConnectorError::validation(format!(
                "record is {} but {} was requested",
                self.kind,
                E::KIND
            )));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| ConnectorError::validation(format!("decode {} '{}': {e}", self.kind, self.id)))
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

/// Filter passed to the per-kind `get_*` connector operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityQuery {
    /// Restrict to these logical ids (empty = all).
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl EntityQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn updated_since(mut self, since: DateTime<Utc>) -> Self {
        self.updated_since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an entity with this id and modification time passes the filter.
    pub fn matches(&self, id: &str, updated_at: Option<DateTime<Utc>>) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|i| i == id) {
            return false;
        }
        match (self.updated_since, updated_at) {
            (Some(since), Some(at)) => at >= since,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Cache key fragment identifying this query.
    pub fn cache_key(&self) -> String {
        let mut ids = self.ids.clone();
        ids.sort();
        format!(
            "ids={}|since={}|limit={}",
            ids.join(","),
            self.updated_since.map(|t| t.to_rfc3339()).unwrap_or_default(),
            self.limit.map(|l| l.to_string()).unwrap_or_default()
        )
    }
}
