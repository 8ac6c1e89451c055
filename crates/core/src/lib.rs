//! `erpbridge-core`: shared vocabulary of the bridge.
//!
//! Identifiers, unified entities, connection/sync data model, conflicts and the
//! connector error taxonomy. No IO lives here.

pub mod conflict;
pub mod entity;
pub mod error;
pub mod id;
pub mod model;

pub use conflict::{
    ConflictKind, ConflictSource, ConflictStatus, DataConflict, Resolution, ResolutionAction,
};
pub use entity::{
    Customer, EntityKind, EntityQuery, EntityRecord, InventoryLevel, Order, OrderLine, Product,
    UnifiedEntity,
};
pub use error::{ConnectorError, ConnectorResult};
pub use id::{ConflictId, ConnectionId, ErpType};
pub use model::{
    BulkItemError, BulkResult, ConnectorConfig, ConnectorEvent, ConnectorEventKind, ConnectorHealth,
    ResolutionStrategy, SyncKind, SyncStrategy,
};
