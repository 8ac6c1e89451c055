//! Connector factories and the lifecycle of live connector instances.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use erpbridge_core::{
    ConnectionId, ConnectorConfig, ConnectorEvent, ConnectorEventKind, ConnectorHealth, ConnectorResult,
    ErpType,
};

use crate::connector::{Connector, ConnectorFactory};
use crate::error::RegistryError;

struct ActiveConnector {
    erp_type: ErpType,
    connector: Arc<dyn Connector>,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryInner {
    factories: RwLock<HashMap<ErpType, ConnectorFactory>>,
    active: RwLock<HashMap<ConnectionId, ActiveConnector>>,
    /// Ids with a `create_and_connect` in flight.
    connecting: StdMutex<HashSet<ConnectionId>>,
}

/// Factory table plus the set of live connectors keyed by connection id.
///
/// Constructed explicitly and shared by handle; cloning is cheap and every clone
/// sees the same state.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry").finish_non_exhaustive()
    }
}

/// Removes an id from the in-flight set when the connect attempt ends.
struct ConnectingGuard<'a> {
    set: &'a StdMutex<HashSet<ConnectionId>>,
    id: ConnectionId,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `erp_type`. Registering a type twice is an error.
    pub async fn register<F>(&self, erp_type: impl Into<ErpType>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&ConnectorConfig) -> ConnectorResult<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        let erp_type = erp_type.into();
        let mut factories = self.inner.factories.write().await;
        if factories.contains_key(&erp_type) {
            return Err(RegistryError::AlreadyRegistered(erp_type));
        }
        debug!(erp_type = %erp_type, "connector factory registered");
        factories.insert(erp_type, Arc::new(factory) as ConnectorFactory);
        Ok(())
    }

    /// Drop the factory and disconnect every live connection of that type.
    ///
    /// Disconnect failures are logged, never returned. Returns whether a factory
    /// was registered.
    pub async fn unregister(&self, erp_type: &ErpType) -> bool {
        let removed = self.inner.factories.write().await.remove(erp_type).is_some();

        let doomed: Vec<(ConnectionId, ActiveConnector)> = {
            let mut active = self.inner.active.write().await;
            let ids: Vec<ConnectionId> = active
                .iter()
                .filter(|(_, a)| &a.erp_type == erp_type)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| active.remove(&id).map(|a| (id, a)))
                .collect()
        };

        if !doomed.is_empty() {
            info!(erp_type = %erp_type, connections = doomed.len(), "disconnecting connections of unregistered type");
        }
        shutdown_all(doomed).await;
        removed
    }

    pub async fn is_registered(&self, erp_type: &ErpType) -> bool {
        self.inner.factories.read().await.contains_key(erp_type)
    }

    pub async fn registered_types(&self) -> Vec<ErpType> {
        let mut types: Vec<ErpType> = self.inner.factories.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build an unconnected connector for `config`.
    pub async fn create(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>, RegistryError> {
        let factory = self
            .inner
            .factories
            .read()
            .await
            .get(&config.erp_type)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(config.erp_type.clone()))?;

        Ok(factory(config)?)
    }

    /// Create, connect and track a connector under `id`.
    ///
    /// Fails before any `connect()` if `id` is already live or mid-connect. The
    /// handle is dropped from the active set automatically when the connector emits
    /// a `disconnected` event.
    pub async fn create_and_connect(
        &self,
        id: impl Into<ConnectionId>,
        config: &ConnectorConfig,
    ) -> Result<Arc<dyn Connector>, RegistryError> {
        let id = id.into();
        let _guard = self.claim(&id).await?;

        let connector = self.create(config).await?;
        let events = connector.events();

        connector.connect().await.map_err(|e| {
            warn!(connection_id = %id, erp_type = %config.erp_type, error = %e, "connect failed");
            e.with_context("connect", config.erp_type.as_str(), connector.name())
        })?;

        let watcher = spawn_disconnect_watcher(Arc::downgrade(&self.inner), id.clone(), connector.clone(), events);
        self.inner.active.write().await.insert(
            id.clone(),
            ActiveConnector {
                erp_type: config.erp_type.clone(),
                connector: connector.clone(),
                watcher,
            },
        );

        info!(connection_id = %id, erp_type = %config.erp_type, "connector connected");
        Ok(connector)
    }

    async fn claim(&self, id: &ConnectionId) -> Result<ConnectingGuard<'_>, RegistryError> {
        let active = self.inner.active.read().await;
        let mut connecting = self
            .inner
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(id) || !connecting.insert(id.clone()) {
            return Err(RegistryError::AlreadyActive(id.clone()));
        }
        Ok(ConnectingGuard {
            set: &self.inner.connecting,
            id: id.clone(),
        })
    }

    /// Stop tracking `id` and disconnect it.
    pub async fn disconnect(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        let entry = self
            .inner
            .active
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        entry.watcher.abort();

        entry.connector.disconnect().await.map_err(|e| {
            RegistryError::from(e.with_context("disconnect", entry.erp_type.as_str(), entry.connector.name()))
        })?;
        info!(connection_id = %id, "connector disconnected");
        Ok(())
    }

    /// Disconnect everything concurrently. Failures are logged; the active set is
    /// always empty afterwards.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(ConnectionId, ActiveConnector)> = self.inner.active.write().await.drain().collect();
        shutdown_all(drained).await;
    }

    /// Health of every live connector, queried concurrently. A failing health check
    /// reports `connected: false` with the error.
    pub async fn get_health_status(&self) -> HashMap<ConnectionId, ConnectorHealth> {
        let handles = self.snapshot().await;
        let checks = handles.into_iter().map(|(id, connector)| async move {
            let health = match connector.get_health().await {
                Ok(h) => h,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "health check failed");
                    ConnectorHealth::disconnected(Some(e.to_string()))
                }
            };
            (id, health)
        });
        join_all(checks).await.into_iter().collect()
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<dyn Connector>> {
        self.inner.active.read().await.get(id).map(|a| a.connector.clone())
    }

    pub async fn erp_type_of(&self, id: &ConnectionId) -> Option<ErpType> {
        self.inner.active.read().await.get(id).map(|a| a.erp_type.clone())
    }

    pub async fn is_active(&self, id: &ConnectionId) -> bool {
        self.inner.active.read().await.contains_key(id)
    }

    /// Live connection ids, sorted.
    pub async fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.inner.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn active_count(&self) -> usize {
        self.inner.active.read().await.len()
    }

    async fn snapshot(&self) -> Vec<(ConnectionId, Arc<dyn Connector>)> {
        self.inner
            .active
            .read()
            .await
            .iter()
            .map(|(id, a)| (id.clone(), a.connector.clone()))
            .collect()
    }
}

async fn shutdown_all(entries: Vec<(ConnectionId, ActiveConnector)>) {
    let disconnects = entries.into_iter().map(|(id, entry)| async move {
        entry.watcher.abort();
        let result = entry.connector.disconnect().await;
        (id, entry.erp_type, result)
    });

    for (id, erp_type, result) in join_all(disconnects).await {
        match result {
            Ok(()) => debug!(connection_id = %id, "connector disconnected"),
            Err(e) => warn!(connection_id = %id, erp_type = %erp_type, error = %e, "disconnect failed; dropping connection anyway"),
        }
    }
}

/// Forget `id` once its connector reports it has disconnected on its own.
fn spawn_disconnect_watcher(
    registry: Weak<RegistryInner>,
    id: ConnectionId,
    connector: Arc<dyn Connector>,
    mut events: broadcast::Receiver<ConnectorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.kind == ConnectorEventKind::Disconnected => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }

        let Some(inner) = registry.upgrade() else {
            return;
        };
        let mut active = inner.active.write().await;
        let same_handle = active
            .get(&id)
            .is_some_and(|a| Arc::ptr_eq(&a.connector, &connector));
        if same_handle {
            active.remove(&id);
            info!(connection_id = %id, "connector reported disconnect; removed from active set");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConnector;
    use erpbridge_core::ConnectorError;

    fn factory_for(
        conn: Arc<InMemoryConnector>,
    ) -> impl Fn(&ConnectorConfig) -> ConnectorResult<Arc<dyn Connector>> + Send + Sync + 'static {
        move |_| Ok(conn.clone() as Arc<dyn Connector>)
    }

    #[tokio::test]
    async fn double_registration_is_rejected() {
        let registry = ConnectorRegistry::new();
        let conn = Arc::new(InMemoryConnector::new("odoo", "Odoo"));

        registry.register("odoo", factory_for(conn.clone())).await.unwrap();
        let err = registry.register("odoo", factory_for(conn)).await.unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("odoo".into()));
    }

    #[tokio::test]
    async fn create_for_unknown_type_names_the_type() {
        let registry = ConnectorRegistry::new();
        let err = registry
            .create(&ConnectorConfig::new("sap", "SAP"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "No connector registered for ERP type: sap");
    }

    #[tokio::test]
    async fn duplicate_id_fails_before_second_connect() {
        let registry = ConnectorRegistry::new();
        let conn = Arc::new(InMemoryConnector::new("odoo", "Odoo"));
        registry.register("odoo", factory_for(conn.clone())).await.unwrap();
        let config = ConnectorConfig::new("odoo", "Odoo");

        registry.create_and_connect("erp-a", &config).await.unwrap();
        let err = registry.create_and_connect("erp-a", &config).await.err().unwrap();

        assert_eq!(err, RegistryError::AlreadyActive("erp-a".into()));
        assert_eq!(conn.connect_calls(), 1);
    }

    #[tokio::test]
    async fn failed_connect_is_not_tracked() {
        let registry = ConnectorRegistry::new();
        let conn = Arc::new(InMemoryConnector::new("odoo", "Odoo"));
        conn.fail_connect_with(ConnectorError::authentication(401, "bad key"));
        registry.register("odoo", factory_for(conn)).await.unwrap();

        let err = registry
            .create_and_connect("erp-a", &ConnectorConfig::new("odoo", "Odoo"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Connector(ConnectorError::Context { .. })));
        assert!(!registry.is_active(&"erp-a".into()).await);

        // The id is free again for a later attempt.
        assert!(registry.claim(&"erp-a".into()).await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_all_is_best_effort() {
        let registry = ConnectorRegistry::new();
        let x = Arc::new(InMemoryConnector::new("x-erp", "X"));
        let y = Arc::new(InMemoryConnector::new("y-erp", "Y"));
        x.fail_disconnect_with(ConnectorError::connection("socket already closed"));
        registry.register("x-erp", factory_for(x.clone())).await.unwrap();
        registry.register("y-erp", factory_for(y.clone())).await.unwrap();

        registry.create_and_connect("x", &ConnectorConfig::new("x-erp", "X")).await.unwrap();
        registry.create_and_connect("y", &ConnectorConfig::new("y-erp", "Y")).await.unwrap();

        registry.disconnect_all().await;

        assert_eq!(registry.active_count().await, 0);
        assert_eq!(x.disconnect_calls(), 1);
        assert_eq!(y.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn failing_health_check_reports_disconnected() {
        let registry = ConnectorRegistry::new();
        let conn = Arc::new(InMemoryConnector::new("odoo", "Odoo"));
        registry.register("odoo", factory_for(conn.clone())).await.unwrap();
        registry.create_and_connect("erp-a", &ConnectorConfig::new("odoo", "Odoo")).await.unwrap();

        conn.fail_health_with(ConnectorError::connection("timeout"));
        let health = registry.get_health_status().await;

        let entry = &health[&ConnectionId::from("erp-a")];
        assert!(!entry.connected);
        assert!(entry.last_error.as_deref().unwrap_or_default().contains("timeout"));
    }

    #[tokio::test]
    async fn self_reported_disconnect_removes_handle() {
        let registry = ConnectorRegistry::new();
        let conn = Arc::new(InMemoryConnector::new("odoo", "Odoo"));
        registry.register("odoo", factory_for(conn.clone())).await.unwrap();
        registry.create_and_connect("erp-a", &ConnectorConfig::new("odoo", "Odoo")).await.unwrap();

        conn.simulate_drop().await;
        for _ in 0..50 {
            if !registry.is_active(&"erp-a".into()).await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!registry.is_active(&"erp-a".into()).await);
    }

    #[tokio::test]
    async fn unregister_disconnects_live_connections_of_that_type() {
        let registry = ConnectorRegistry::new();
        let conn = Arc::new(InMemoryConnector::new("odoo", "Odoo"));
        conn.fail_disconnect_with(ConnectorError::connection("gone"));
        registry.register("odoo", factory_for(conn.clone())).await.unwrap();
        registry.create_and_connect("erp-a", &ConnectorConfig::new("odoo", "Odoo")).await.unwrap();

        assert!(registry.unregister(&"odoo".into()).await);
        assert_eq!(registry.active_count().await, 0);
        assert!(!registry.is_registered(&"odoo".into()).await);
    }
}
