//! The uniform connector contract every external-system adapter implements.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use erpbridge_core::{
    BulkResult, ConnectorConfig, ConnectorEvent, ConnectorHealth, ConnectorResult, Customer,
    EntityKind, EntityQuery, EntityRecord, ErpType, InventoryLevel, Order, Product, UnifiedEntity,
};

/// Adapter for one external system type.
///
/// Adapters own their rate limiter, cache and retry policy; callers never wrap calls
/// themselves. Errors leaving an adapter are wrapped with
/// [`ConnectorError::with_context`](erpbridge_core::ConnectorError::with_context).
#[async_trait]
pub trait Connector: Send + Sync {
    fn erp_type(&self) -> &ErpType;

    /// Operator-facing name of this instance.
    fn name(&self) -> &str;

    async fn connect(&self) -> ConnectorResult<()>;
    async fn disconnect(&self) -> ConnectorResult<()>;

    /// Round-trip check against the remote system; `Err` means unusable.
    async fn test_connection(&self) -> ConnectorResult<()>;

    async fn get_products(&self, query: &EntityQuery) -> ConnectorResult<Vec<Product>>;
    async fn upsert_product(&self, product: &Product) -> ConnectorResult<Product>;
    async fn delete_product(&self, id: &str) -> ConnectorResult<()>;

    async fn get_inventory(&self, query: &EntityQuery) -> ConnectorResult<Vec<InventoryLevel>>;
    async fn upsert_inventory(&self, level: &InventoryLevel) -> ConnectorResult<InventoryLevel>;
    async fn delete_inventory(&self, id: &str) -> ConnectorResult<()>;

    async fn get_orders(&self, query: &EntityQuery) -> ConnectorResult<Vec<Order>>;
    async fn upsert_order(&self, order: &Order) -> ConnectorResult<Order>;
    async fn delete_order(&self, id: &str) -> ConnectorResult<()>;

    async fn get_customers(&self, query: &EntityQuery) -> ConnectorResult<Vec<Customer>>;
    async fn upsert_customer(&self, customer: &Customer) -> ConnectorResult<Customer>;
    async fn delete_customer(&self, id: &str) -> ConnectorResult<()>;

    async fn subscribe_to_events(&self, kinds: &[EntityKind]) -> ConnectorResult<()>;
    async fn unsubscribe_from_events(&self, kinds: &[EntityKind]) -> ConnectorResult<()>;

    /// Ingest a push notification from the remote system.
    async fn handle_webhook(&self, payload: JsonValue) -> ConnectorResult<()>;

    /// Batched write; per-item failures land in [`BulkResult::errors`].
    async fn bulk_sync(&self, kind: EntityKind, records: Vec<EntityRecord>) -> ConnectorResult<BulkResult>;

    async fn get_health(&self) -> ConnectorResult<ConnectorHealth>;

    /// New receiver on this connector's event stream.
    fn events(&self) -> broadcast::Receiver<ConnectorEvent>;

    /// Kind-erased read dispatching to the typed `get_*` operation.
    async fn fetch_records(&self, kind: EntityKind, query: &EntityQuery) -> ConnectorResult<Vec<EntityRecord>> {
        match kind {
            EntityKind::Products => to_records(&self.get_products(query).await?),
            EntityKind::Inventory => to_records(&self.get_inventory(query).await?),
            EntityKind::Orders => to_records(&self.get_orders(query).await?),
            EntityKind::Customers => to_records(&self.get_customers(query).await?),
        }
    }

    /// Kind-erased write dispatching to the typed `upsert_*` operation.
    async fn upsert_record(&self, record: &EntityRecord) -> ConnectorResult<EntityRecord> {
        match record.kind {
            EntityKind::Products => EntityRecord::from_entity(&self.upsert_product(&record.to_entity()?).await?),
            EntityKind::Inventory => {
                EntityRecord::from_entity(&self.upsert_inventory(&record.to_entity()?).await?)
            }
            EntityKind::Orders => EntityRecord::from_entity(&self.upsert_order(&record.to_entity()?).await?),
            EntityKind::Customers => {
                EntityRecord::from_entity(&self.upsert_customer(&record.to_entity()?).await?)
            }
        }
    }

    /// Kind-erased delete.
    async fn delete_record(&self, kind: EntityKind, id: &str) -> ConnectorResult<()> {
        match kind {
            EntityKind::Products => self.delete_product(id).await,
            EntityKind::Inventory => self.delete_inventory(id).await,
            EntityKind::Orders => self.delete_order(id).await,
            EntityKind::Customers => self.delete_customer(id).await,
        }
    }
}

fn to_records<E: UnifiedEntity>(items: &[E]) -> ConnectorResult<Vec<EntityRecord>> {
    items.iter().map(EntityRecord::from_entity).collect()
}

/// Builds a connector for a connection config.
pub type ConnectorFactory =
    Arc<dyn Fn(&ConnectorConfig) -> ConnectorResult<Arc<dyn Connector>> + Send + Sync>;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out of one connector's events.
///
/// Lagging receivers lose the oldest events (`RecvError::Lagged`) instead of
/// blocking the adapter.
#[derive(Debug, Clone)]
pub struct ConnectorEventHub {
    tx: broadcast::Sender<ConnectorEvent>,
}

impl ConnectorEventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.tx.subscribe()
    }

    /// Deliver to current receivers; returns how many there were.
    pub fn emit(&self, event: ConnectorEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ConnectorEventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
