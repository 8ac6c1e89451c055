//! In-memory reference adapter.
//!
//! Behaves like a remote system held in maps: every call goes through the
//! adapter's own rate limiter, retry policy and read cache, writes invalidate the
//! cache, and data can be stored in a vendor schema through a [`SchemaMapper`].
//! Faults can be injected for tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, warn};

use erpbridge_core::{
    BulkResult, ConnectorConfig, ConnectorError, ConnectorEvent, ConnectorEventKind, ConnectorHealth,
    ConnectorResult, Customer, EntityKind, EntityQuery, EntityRecord, ErpType, InventoryLevel, Order, Product,
    UnifiedEntity,
};
use erpbridge_infra::{BridgeConfig, RateLimiter, RetryPolicy, TtlCache, execute_with_retry, run_bulk};
use erpbridge_mapping::SchemaMapper;

use crate::connector::{Connector, ConnectorEventHub};

#[derive(Debug, Clone)]
struct StoredRecord {
    /// Payload in the storage schema (vendor schema when a mapper is set).
    data: JsonValue,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    connected_at: Option<Instant>,
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
    subscriptions: HashSet<EntityKind>,
    store: HashMap<EntityKind, BTreeMap<String, StoredRecord>>,
}

#[derive(Debug, Default)]
struct Faults {
    connect: Option<ConnectorError>,
    disconnect: Option<ConnectorError>,
    health: Option<ConnectorError>,
    /// Consumed one per remote attempt, front first.
    next_calls: VecDeque<ConnectorError>,
    latency: Option<Duration>,
    connect_calls: u32,
    disconnect_calls: u32,
    remote_calls: u32,
}

#[derive(Debug, Clone)]
struct VendorSchema {
    mapper: Arc<SchemaMapper>,
    name: String,
}

pub struct InMemoryConnector {
    erp_type: ErpType,
    name: String,
    schema: Option<VendorSchema>,
    retry: RetryPolicy,
    limiter: RateLimiter,
    cache: TtlCache<Vec<EntityRecord>>,
    batch_size: usize,
    hub: ConnectorEventHub,
    state: RwLock<State>,
    faults: StdMutex<Faults>,
}

impl std::fmt::Debug for InMemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnector")
            .field("erp_type", &self.erp_type)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Webhook body accepted by [`InMemoryConnector::handle_webhook`].
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event: ConnectorEventKind,
    entity_kind: EntityKind,
    entity_id: String,
    #[serde(default)]
    data: Option<JsonValue>,
}

impl InMemoryConnector {
    /// Adapter with default execution settings.
    pub fn new(erp_type: impl Into<ErpType>, name: impl Into<String>) -> Self {
        let config = ConnectorConfig::new(erp_type, name);
        Self::from_config(&config, &BridgeConfig::default())
    }

    /// Adapter whose limiter and retry policy honour the connection's overrides.
    pub fn from_config(config: &ConnectorConfig, bridge: &BridgeConfig) -> Self {
        Self {
            erp_type: config.erp_type.clone(),
            name: config.name.clone(),
            schema: None,
            retry: bridge.retry_policy_for(config),
            limiter: bridge.rate_limit_for(config),
            cache: TtlCache::new(bridge.cache_ttl),
            batch_size: bridge.batch_size,
            hub: ConnectorEventHub::default(),
            state: RwLock::new(State::default()),
            faults: StdMutex::new(Faults::default()),
        }
    }

    /// Store data in `schema` using mappings registered on `mapper`.
    pub fn with_schema(mut self, mapper: Arc<SchemaMapper>, schema: impl Into<String>) -> Self {
        self.schema = Some(VendorSchema {
            mapper,
            name: schema.into(),
        });
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load entities directly, bypassing limiter, retry and events.
    pub async fn seed<E: UnifiedEntity>(&self, entities: &[E]) -> ConnectorResult<()> {
        let mut state = self.state.write().await;
        for entity in entities {
            let record = EntityRecord::from_entity(entity)?;
            self.store_record(&mut state, &record)?;
        }
        drop(state);
        self.cache.invalidate(&format!("{}:", E::KIND)).await;
        Ok(())
    }

    /// Raw stored payloads of one kind, in storage schema.
    pub async fn stored(&self, kind: EntityKind) -> BTreeMap<String, JsonValue> {
        self.state
            .read()
            .await
            .store
            .get(&kind)
            .map(|m| m.iter().map(|(id, r)| (id.clone(), r.data.clone())).collect())
            .unwrap_or_default()
    }

    /// Drop the connection as if the remote side closed it.
    pub async fn simulate_drop(&self) {
        {
            let mut state = self.state.write().await;
            state.connected = false;
            state.connected_at = None;
        }
        self.hub.emit(ConnectorEvent::disconnected());
    }

    /// Emit a change event as the remote system would.
    pub fn emit(&self, event: ConnectorEvent) -> usize {
        self.hub.emit(event)
    }

    pub fn fail_connect_with(&self, err: ConnectorError) {
        self.faults().connect = Some(err);
    }

    pub fn fail_disconnect_with(&self, err: ConnectorError) {
        self.faults().disconnect = Some(err);
    }

    pub fn fail_health_with(&self, err: ConnectorError) {
        self.faults().health = Some(err);
    }

    /// Fail the next remote attempts with these errors, in order.
    pub fn fail_next_calls(&self, errors: impl IntoIterator<Item = ConnectorError>) {
        self.faults().next_calls.extend(errors);
    }

    /// Delay every remote attempt.
    pub fn set_latency(&self, latency: Duration) {
        self.faults().latency = Some(latency);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults();
        faults.connect = None;
        faults.disconnect = None;
        faults.health = None;
        faults.next_calls.clear();
        faults.latency = None;
    }

    pub fn connect_calls(&self) -> u32 {
        self.faults().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.faults().disconnect_calls
    }

    /// Remote attempts made so far, retries included; cache hits excluded.
    pub fn remote_calls(&self) -> u32 {
        self.faults().remote_calls
    }

    /// Rate-limit permits this adapter could spend right now.
    pub async fn available_permits(&self) -> usize {
        self.limiter.available().await
    }

    pub async fn is_subscribed(&self, kind: EntityKind) -> bool {
        self.state.read().await.subscriptions.contains(&kind)
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wrap(&self, operation: &str, err: ConnectorError) -> ConnectorError {
        err.with_context(operation, self.erp_type.as_str(), &self.name)
    }

    /// Run `op` against the store as one remote call: limiter, retry, latency and
    /// injected faults all apply.
    async fn call<T, F>(&self, operation: &'static str, op: F) -> ConnectorResult<T>
    where
        F: Fn(&mut State) -> ConnectorResult<T> + Send + Sync,
        T: Send,
    {
        if !self.state.read().await.connected {
            return Err(self.wrap(operation, ConnectorError::NotConnected));
        }

        let op = &op;
        let result = execute_with_retry(move || self.attempt(op), operation, &self.retry, Some(&self.limiter)).await;

        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.state.write().await.last_error = Some(err.to_string());
                Err(self.wrap(operation, err))
            }
        }
    }

    async fn attempt<T, F>(&self, op: &F) -> ConnectorResult<T>
    where
        F: Fn(&mut State) -> ConnectorResult<T> + Send + Sync,
    {
        // The connection can drop while the attempt waits for a permit.
        if !self.state.read().await.connected {
            self.limiter.release(1).await;
            return Err(ConnectorError::NotConnected);
        }

        let (fault, latency) = {
            let mut faults = self.faults();
            faults.remote_calls += 1;
            (faults.next_calls.pop_front(), faults.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = fault {
            return Err(err);
        }

        let mut state = self.state.write().await;
        op(&mut state)
    }

    fn store_record(&self, state: &mut State, record: &EntityRecord) -> ConnectorResult<bool> {
        let data = match &self.schema {
            Some(s) => s.mapper.from_unified(&s.name, record.kind, &record.data)?,
            None => record.data.clone(),
        };
        let bucket = state.store.entry(record.kind).or_default();
        let version = bucket.get(&record.id).map_or(1, |r| r.version + 1);
        let created = version == 1;
        bucket.insert(
            record.id.clone(),
            StoredRecord {
                data,
                updated_at: record.updated_at.or_else(|| Some(Utc::now())),
                version,
            },
        );
        Ok(created)
    }

    fn read_records(&self, state: &mut State, kind: EntityKind, query: &EntityQuery) -> ConnectorResult<Vec<EntityRecord>> {
        let mut out = Vec::new();
        if let Some(bucket) = state.store.get(&kind) {
            for (id, stored) in bucket {
                if query.limit.is_some_and(|l| out.len() >= l) {
                    break;
                }
                if !query.matches(id, stored.updated_at) {
                    continue;
                }
                let data = match &self.schema {
                    Some(s) => s.mapper.to_unified(&s.name, kind, &stored.data)?,
                    None => stored.data.clone(),
                };
                out.push(EntityRecord {
                    kind,
                    id: id.clone(),
                    data,
                    updated_at: stored.updated_at,
                    version: Some(stored.version),
                });
            }
        }
        state.last_sync = Some(Utc::now());
        Ok(out)
    }

    async fn get_entities<E: UnifiedEntity>(&self, query: &EntityQuery) -> ConnectorResult<Vec<E>> {
        let key = format!("{}:{}", E::KIND, query.cache_key());
        let records = self
            .cache
            .get_cached(&key, || self.call("get", |state| self.read_records(state, E::KIND, query)), None)
            .await?;
        records
            .iter()
            .map(|r| r.to_entity().map_err(|e| self.wrap("get", e)))
            .collect()
    }

    async fn upsert_entity<E: UnifiedEntity>(&self, entity: &E) -> ConnectorResult<E> {
        let record = EntityRecord::from_entity(entity).map_err(|e| self.wrap("upsert", e))?;
        let created = self.call("upsert", |state| self.store_record(state, &record)).await?;
        self.after_write(
            E::KIND,
            &record.id,
            if created {
                ConnectorEventKind::Created
            } else {
                ConnectorEventKind::Updated
            },
        )
        .await;
        Ok(entity.clone())
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> ConnectorResult<()> {
        let existed = self
            .call("delete", |state| {
                Ok(state.store.get_mut(&kind).and_then(|b| b.remove(id)).is_some())
            })
            .await?;
        if existed {
            self.after_write(kind, id, ConnectorEventKind::Deleted).await;
        }
        Ok(())
    }

    async fn after_write(&self, kind: EntityKind, id: &str, event: ConnectorEventKind) {
        self.cache.invalidate(&format!("{kind}:")).await;
        if self.state.read().await.subscriptions.contains(&kind) {
            self.hub.emit(ConnectorEvent::change(event, kind, id));
        }
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    fn erp_type(&self) -> &ErpType {
        &self.erp_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> ConnectorResult<()> {
        let fault = {
            let mut faults = self.faults();
            faults.connect_calls += 1;
            faults.connect.clone()
        };
        let mut state = self.state.write().await;
        if let Some(err) = fault {
            state.last_error = Some(err.to_string());
            return Err(self.wrap("connect", err));
        }
        state.connected = true;
        state.connected_at = Some(Instant::now());
        debug!(erp_type = %self.erp_type, name = %self.name, "in-memory connector connected");
        Ok(())
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        let fault = {
            let mut faults = self.faults();
            faults.disconnect_calls += 1;
            faults.disconnect.clone()
        };
        if let Some(err) = fault {
            return Err(self.wrap("disconnect", err));
        }
        {
            let mut state = self.state.write().await;
            state.connected = false;
            state.connected_at = None;
            state.subscriptions.clear();
        }
        self.cache.clear().await;
        self.hub.emit(ConnectorEvent::disconnected());
        Ok(())
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        self.call("test_connection", |_| Ok(())).await
    }

    async fn get_products(&self, query: &EntityQuery) -> ConnectorResult<Vec<Product>> {
        self.get_entities(query).await
    }

    async fn upsert_product(&self, product: &Product) -> ConnectorResult<Product> {
        self.upsert_entity(product).await
    }

    async fn delete_product(&self, id: &str) -> ConnectorResult<()> {
        self.delete_entity(EntityKind::Products, id).await
    }

    async fn get_inventory(&self, query: &EntityQuery) -> ConnectorResult<Vec<InventoryLevel>> {
        self.get_entities(query).await
    }

    async fn upsert_inventory(&self, level: &InventoryLevel) -> ConnectorResult<InventoryLevel> {
        self.upsert_entity(level).await
    }

    async fn delete_inventory(&self, id: &str) -> ConnectorResult<()> {
        self.delete_entity(EntityKind::Inventory, id).await
    }

    async fn get_orders(&self, query: &EntityQuery) -> ConnectorResult<Vec<Order>> {
        self.get_entities(query).await
    }

    async fn upsert_order(&self, order: &Order) -> ConnectorResult<Order> {
        self.upsert_entity(order).await
    }

    async fn delete_order(&self, id: &str) -> ConnectorResult<()> {
        self.delete_entity(EntityKind::Orders, id).await
    }

    async fn get_customers(&self, query: &EntityQuery) -> ConnectorResult<Vec<Customer>> {
        self.get_entities(query).await
    }

    async fn upsert_customer(&self, customer: &Customer) -> ConnectorResult<Customer> {
        self.upsert_entity(customer).await
    }

    async fn delete_customer(&self, id: &str) -> ConnectorResult<()> {
        self.delete_entity(EntityKind::Customers, id).await
    }

    async fn subscribe_to_events(&self, kinds: &[EntityKind]) -> ConnectorResult<()> {
        self.state.write().await.subscriptions.extend(kinds.iter().copied());
        Ok(())
    }

    async fn unsubscribe_from_events(&self, kinds: &[EntityKind]) -> ConnectorResult<()> {
        let mut state = self.state.write().await;
        for kind in kinds {
            state.subscriptions.remove(kind);
        }
        Ok(())
    }

    async fn handle_webhook(&self, payload: JsonValue) -> ConnectorResult<()> {
        let hook: WebhookPayload = serde_json::from_value(payload)
            .map_err(|e| self.wrap("handle_webhook", ConnectorError::validation(format!("bad webhook payload: {e}"))))?;

        {
            let mut state = self.state.write().await;
            match (hook.event, hook.data) {
                (ConnectorEventKind::Deleted, _) => {
                    if let Some(bucket) = state.store.get_mut(&hook.entity_kind) {
                        bucket.remove(&hook.entity_id);
                    }
                }
                (ConnectorEventKind::Created | ConnectorEventKind::Updated, Some(data)) => {
                    let bucket = state.store.entry(hook.entity_kind).or_default();
                    let version = bucket.get(&hook.entity_id).map_or(1, |r| r.version + 1);
                    bucket.insert(
                        hook.entity_id.clone(),
                        StoredRecord {
                            data,
                            updated_at: Some(Utc::now()),
                            version,
                        },
                    );
                }
                (ConnectorEventKind::Created | ConnectorEventKind::Updated, None) => {}
                (other, _) => {
                    return Err(self.wrap(
                        "handle_webhook",
                        ConnectorError::validation(format!("webhook cannot carry {other:?} events")),
                    ));
                }
            }
        }

        self.cache.invalidate(&format!("{}:", hook.entity_kind)).await;
        self.hub
            .emit(ConnectorEvent::change(hook.event, hook.entity_kind, hook.entity_id));
        Ok(())
    }

    async fn bulk_sync(&self, kind: EntityKind, records: Vec<EntityRecord>) -> ConnectorResult<BulkResult> {
        let result = run_bulk(
            records,
            self.batch_size,
            |r| Some(r.id.clone()),
            |record| async move {
                if record.kind != kind {
                    return Err(ConnectorError::validation(format!(
                        "record '{}' is {} but the batch is {kind}",
                        record.id, record.kind
                    )));
                }
                self.upsert_record(&record).await.map(|_| ())
            },
        )
        .await;

        if !result.is_complete_success() {
            warn!(
                erp_type = %self.erp_type,
                entity_kind = %kind,
                failed = result.failed,
                succeeded = result.succeeded,
                "bulk sync finished with failures"
            );
        }
        Ok(result)
    }

    async fn get_health(&self) -> ConnectorResult<ConnectorHealth> {
        let fault = self.faults().health.clone();
        if let Some(err) = fault {
            return Err(self.wrap("get_health", err));
        }
        let state = self.state.read().await;
        Ok(ConnectorHealth {
            connected: state.connected,
            last_sync: state.last_sync,
            uptime_secs: state.connected_at.map_or(0, |t| t.elapsed().as_secs()),
            last_error: state.last_error.clone(),
        })
    }

    fn events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erpbridge_mapping::{FieldMapping, UNIFIED_SCHEMA};
    use serde_json::json;

    fn product(id: &str, price: f64) -> Product {
        Product {
            id: id.to_string(),
            sku: format!("SKU-{id}"),
            name: format!("Product {id}"),
            price: Some(price),
            currency: Some("USD".into()),
            quantity: Some(5),
            updated_at: None,
        }
    }

    async fn connected() -> InMemoryConnector {
        let conn = InMemoryConnector::new("odoo", "Odoo").with_retry_policy(RetryPolicy::exponential(
            2,
            Duration::from_millis(10),
            2.0,
        ));
        conn.connect().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn calls_before_connect_fail_without_retrying() {
        let conn = InMemoryConnector::new("odoo", "Odoo");
        let err = conn.get_products(&EntityQuery::all()).await.unwrap_err();
        assert_eq!(err.root(), &ConnectorError::NotConnected);
        assert_eq!(conn.remote_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permit_is_returned_when_the_connection_drops_while_waiting() {
        let config = ConnectorConfig::new("odoo", "Odoo").with_rate_limit(1);
        let conn = Arc::new(
            InMemoryConnector::from_config(&config, &BridgeConfig::default()).with_retry_policy(RetryPolicy::no_retry()),
        );
        conn.connect().await.unwrap();

        conn.upsert_product(&product("P1", 1.0)).await.unwrap();
        assert_eq!(conn.available_permits().await, 0);

        let waiting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.get_products(&EntityQuery::all()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        conn.simulate_drop().await;

        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.root(), &ConnectorError::NotConnected);
        assert_eq!(conn.remote_calls(), 1);
        assert_eq!(conn.available_permits().await, 1);
    }

    #[tokio::test]
    async fn reads_are_cached_until_a_write() {
        let conn = connected().await;
        conn.seed(&[product("P1", 10.0)]).await.unwrap();

        conn.get_products(&EntityQuery::all()).await.unwrap();
        conn.get_products(&EntityQuery::all()).await.unwrap();
        assert_eq!(conn.remote_calls(), 1);

        conn.upsert_product(&product("P2", 3.0)).await.unwrap();
        let all = conn.get_products(&EntityQuery::all()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(conn.remote_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_faults_are_retried() {
        let conn = connected().await;
        conn.seed(&[product("P1", 10.0)]).await.unwrap();
        conn.fail_next_calls([ConnectorError::connection("reset"), ConnectorError::http(503, "busy")]);

        let products = conn.get_products(&EntityQuery::all()).await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(conn.remote_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_carry_operation_and_connector_context() {
        let conn = connected().await;
        conn.fail_next_calls([ConnectorError::authentication(401, "expired")]);

        let err = conn.upsert_product(&product("P1", 1.0)).await.unwrap_err();
        match err {
            ConnectorError::Context {
                operation,
                connector_type,
                connector_name,
                ..
            } => {
                assert_eq!(operation, "upsert");
                assert_eq!(connector_type, "odoo");
                assert_eq!(connector_name, "Odoo");
            }
            other => panic!("expected context wrapper, got {other:?}"),
        }
        assert_eq!(conn.remote_calls(), 1);
        assert!(conn.get_health().await.unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn subscribed_writes_emit_change_events() {
        let conn = connected().await;
        let mut events = conn.events();
        conn.subscribe_to_events(&[EntityKind::Products]).await.unwrap();

        conn.upsert_product(&product("P1", 1.0)).await.unwrap();
        conn.upsert_product(&product("P1", 2.0)).await.unwrap();

        assert_eq!(events.recv().await.unwrap().kind, ConnectorEventKind::Created);
        assert_eq!(events.recv().await.unwrap().kind, ConnectorEventKind::Updated);

        conn.unsubscribe_from_events(&[EntityKind::Products]).await.unwrap();
        conn.delete_product("P1").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn vendor_schema_round_trips_through_mapper() {
        let mapper = Arc::new(SchemaMapper::new());
        mapper.define_mapping(
            "shop",
            UNIFIED_SCHEMA,
            EntityKind::Products,
            vec![
                FieldMapping::new("item.code", "id").unwrap().required(),
                FieldMapping::new("item.sku", "sku").unwrap(),
                FieldMapping::new("item.title", "name").unwrap(),
                FieldMapping::new("pricing[0].amount", "price").unwrap(),
            ],
        );
        let conn = InMemoryConnector::new("shop", "Shop").with_schema(mapper, "shop");
        conn.connect().await.unwrap();

        conn.upsert_product(&product("P1", 9.5)).await.unwrap();
        let stored = conn.stored(EntityKind::Products).await;
        assert_eq!(stored["P1"]["pricing"][0]["amount"], json!(9.5));
        assert_eq!(stored["P1"]["item"]["title"], json!("Product P1"));

        let back = conn.get_products(&EntityQuery::by_ids(["P1"])).await.unwrap();
        assert_eq!(back[0].price, Some(9.5));
        assert_eq!(back[0].currency, None);
    }

    #[tokio::test]
    async fn bulk_sync_reports_wrong_kind_per_item() {
        let conn = connected().await;
        let good = EntityRecord::from_entity(&product("P1", 1.0)).unwrap();
        let mut bad = EntityRecord::from_entity(&product("P2", 1.0)).unwrap();
        bad.kind = EntityKind::Orders;

        let result = conn.bulk_sync(EntityKind::Products, vec![good, bad]).await.unwrap();
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors[0].entity_id.as_deref(), Some("P2"));
    }

    #[tokio::test]
    async fn webhook_updates_store_and_emits() {
        let conn = connected().await;
        let mut events = conn.events();

        conn.handle_webhook(json!({
            "event": "updated",
            "entity_kind": "products",
            "entity_id": "P9",
            "data": serde_json::to_value(product("P9", 4.0)).unwrap(),
        }))
        .await
        .unwrap();

        let ev = events.recv().await.unwrap();
        assert!(ev.is_data_change());
        assert_eq!(conn.get_products(&EntityQuery::all()).await.unwrap()[0].id, "P9");

        assert!(conn.handle_webhook(json!({"event": "bogus"})).await.is_err());
    }
}
