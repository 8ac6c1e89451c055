//! Multi-connection sync orchestration.
//!
//! The orchestrator owns the set of managed connections and runs sync passes:
//! fetch one entity kind from every active connection, detect disagreements,
//! resolve them and write winning data back to the sources that lost.
//!
//! Passes are triggered three ways:
//! - explicitly via [`SyncOrchestrator::sync_all`] / [`SyncOrchestrator::sync_entity`],
//! - by a per-connection interval timer configured with a [`SyncStrategy`],
//! - by connector change events, debounced per entity kind.
//!
//! Work against one connection is serialized by a per-connection lock, so a
//! scheduled pass never interleaves with an explicit one on the same remote.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use erpbridge_connectors::{Connector, ConnectorRegistry, RegistryError};
use erpbridge_core::{
    ConflictId, ConnectionId, ConnectorConfig, ConnectorEvent, ConnectorEventKind, ConnectorHealth,
    DataConflict, EntityKind, EntityQuery, EntityRecord, ErpType, Resolution, ResolutionStrategy, SyncKind,
    SyncStrategy,
};
use erpbridge_events::{BridgeEvent, ConnectionSyncResult, EventBus, InMemoryEventBus, Subscription, SyncScope};
use erpbridge_infra::{ActivityLog, BridgeConfig, Severity, TracingActivityLog};

use crate::detect::{ComparisonPolicy, Observation, detect_conflicts};
use crate::error::SyncError;
use crate::resolver::ConflictResolver;

/// A managed connection as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub erp_type: ErpType,
    pub config: ConnectorConfig,
    /// Higher wins ties and selects the governing sync strategy.
    pub priority: i32,
    pub is_active: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_error_count: u32,
    pub last_error: Option<String>,
    pub strategy: Option<SyncStrategy>,
}

/// Connector health merged with orchestrator bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub connection_id: ConnectionId,
    pub erp_type: ErpType,
    pub priority: i32,
    pub is_active: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_error_count: u32,
    pub last_error: Option<String>,
    pub connector: ConnectorHealth,
}

/// Outcome of one entity pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySyncReport {
    pub entity_kind: EntityKind,
    pub results: Vec<ConnectionSyncResult>,
    pub conflicts: Vec<DataConflict>,
    pub resolutions: Vec<Resolution>,
    pub duration_ms: u64,
}

impl EntitySyncReport {
    fn empty(entity_kind: EntityKind) -> Self {
        Self {
            entity_kind,
            results: Vec::new(),
            conflicts: Vec::new(),
            resolutions: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn result_for(&self, id: &ConnectionId) -> Option<&ConnectionSyncResult> {
        self.results.iter().find(|r| &r.connection_id == id)
    }
}

/// Outcome of a sync run over one or more entity kinds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub entities: Vec<EntitySyncReport>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn results(&self) -> impl Iterator<Item = &ConnectionSyncResult> {
        self.entities.iter().flat_map(|e| e.results.iter())
    }

    pub fn conflict_count(&self) -> usize {
        self.entities.iter().map(|e| e.conflicts.len()).sum()
    }

    pub fn entity(&self, kind: EntityKind) -> Option<&EntitySyncReport> {
        self.entities.iter().find(|e| e.entity_kind == kind)
    }
}

struct ConnectionEntry {
    info: Connection,
    connector: Arc<dyn Connector>,
    lock: Arc<Mutex<()>>,
    timer: Option<JoinHandle<()>>,
    forwarder: JoinHandle<()>,
}

impl ConnectionEntry {
    fn abort_tasks(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.forwarder.abort();
    }
}

/// Snapshot of a connection taken at the start of a pass.
#[derive(Clone)]
struct Participant {
    id: ConnectionId,
    erp_type: ErpType,
    priority: i32,
    strategy: Option<SyncStrategy>,
    connector: Arc<dyn Connector>,
    lock: Arc<Mutex<()>>,
}

/// Clears the in-progress flag when an explicit sync ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    registry: ConnectorRegistry,
    config: BridgeConfig,
    policy: StdRwLock<ComparisonPolicy>,
    bus: InMemoryEventBus<BridgeEvent>,
    activity: Arc<dyn ActivityLog>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    rules: StdMutex<HashMap<EntityKind, ResolutionStrategy>>,
    manual_queue: StdMutex<Vec<DataConflict>>,
    /// Pending change-triggered re-sync per kind: generation and its task.
    resync: StdMutex<HashMap<EntityKind, (u64, JoinHandle<()>)>>,
    syncing: AtomicBool,
    shut_down: AtomicBool,
}

/// Coordinates sync across every managed connection.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(registry: ConnectorRegistry, config: BridgeConfig) -> Self {
        Self::with_activity_log(registry, config, Arc::new(TracingActivityLog))
    }

    pub fn with_activity_log(registry: ConnectorRegistry, config: BridgeConfig, activity: Arc<dyn ActivityLog>) -> Self {
        let bus = InMemoryEventBus::with_capacity(config.event_bus_capacity);
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                policy: StdRwLock::new(ComparisonPolicy::default()),
                bus,
                activity,
                connections: RwLock::new(HashMap::new()),
                rules: StdMutex::new(HashMap::new()),
                manual_queue: StdMutex::new(Vec::new()),
                resync: StdMutex::new(HashMap::new()),
                syncing: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Receive every orchestrator event published from now on.
    pub fn subscribe(&self) -> Subscription<BridgeEvent> {
        self.inner.bus.subscribe()
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Events discarded because a subscriber fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.inner.bus.dropped()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    /// Replace the salient fields used to detect conflicts.
    pub fn set_comparison_policy(&self, policy: ComparisonPolicy) {
        *self.inner.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Force `strategy` for `kind`, overriding connection strategies.
    pub fn set_resolution_rule(&self, kind: EntityKind, strategy: ResolutionStrategy) {
        self.inner.rules().insert(kind, strategy);
    }

    /// Connect a new ERP and start managing it.
    ///
    /// The connection is verified with `test_connection` before it is registered
    /// here; a failing test disconnects it again.
    pub async fn add_erp(
        &self,
        id: impl Into<ConnectionId>,
        config: ConnectorConfig,
        priority: i32,
    ) -> Result<(), SyncError> {
        let id = id.into();
        let inner = &self.inner;

        if inner.shut_down.load(Ordering::Acquire) {
            return Err(SyncError::ShutDown);
        }
        if !config.enabled {
            return Err(SyncError::ConnectionDisabled(id));
        }
        match inner.connections.read().await.get(&id) {
            Some(e) if e.info.is_active => return Err(RegistryError::AlreadyActive(id).into()),
            Some(_) => return Err(SyncError::ConnectionInactive(id)),
            None => {}
        }

        let connector = inner.registry.create_and_connect(id.clone(), &config).await?;

        if let Err(e) = connector.test_connection().await {
            warn!(connection_id = %id, error = %e, "connection test failed; disconnecting");
            if let Err(de) = inner.registry.disconnect(&id).await {
                debug!(connection_id = %id, error = %de, "disconnect after failed test");
            }
            inner.activity.log_activity(
                Some(&id),
                Severity::Error,
                "connection test failed",
                json!({ "error": e.to_string() }),
            );
            return Err(SyncError::ConnectionTest {
                connection_id: id,
                source: e,
            });
        }

        let forwarder = spawn_event_forwarder(Arc::downgrade(inner), id.clone(), connector.events());
        let erp_type = config.erp_type.clone();
        let entry = ConnectionEntry {
            info: Connection {
                id: id.clone(),
                erp_type: erp_type.clone(),
                config,
                priority,
                is_active: true,
                last_sync: None,
                sync_error_count: 0,
                last_error: None,
                strategy: None,
            },
            connector,
            lock: Arc::new(Mutex::new(())),
            timer: None,
            forwarder,
        };
        inner.connections.write().await.insert(id.clone(), entry);

        info!(connection_id = %id, erp_type = %erp_type, priority, "erp connection added");
        inner.activity.log_activity(
            Some(&id),
            Severity::Info,
            "connection added",
            json!({ "erp_type": erp_type.as_str(), "priority": priority }),
        );
        inner.publish(BridgeEvent::ErpAdded {
            connection_id: id,
            erp_type,
            priority,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Stop managing a connection: cancel its timer and event forwarding, then
    /// disconnect it. Disconnect failures are logged, not returned.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn remove_erp(&self, id: &ConnectionId) -> Result<(), SyncError> {
        let inner = &self.inner;
        let mut entry = inner
            .connections
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SyncError::UnknownConnection(id.clone()))?;
        entry.abort_tasks();

        match inner.registry.disconnect(id).await {
            Ok(()) | Err(RegistryError::NotFound(_)) => {}
            Err(e) => {
                warn!(error = %e, "disconnect failed during removal");
                inner.activity.log_activity(
                    Some(id),
                    Severity::Warning,
                    "disconnect failed during removal",
                    json!({ "error": e.to_string() }),
                );
            }
        }

        info!("erp connection removed");
        inner
            .activity
            .log_activity(Some(id), Severity::Info, "connection removed", json!({}));
        inner.publish(BridgeEvent::ErpRemoved {
            connection_id: id.clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Attach a sync strategy to a connection.
    ///
    /// Replaces any previous timer. Interval strategies start a timer whose first
    /// run is one interval from now; real-time strategies subscribe the connector
    /// to change events for the strategy's kinds. Kinds a replaced real-time
    /// strategy subscribed to and the new one does not are unsubscribed.
    #[instrument(skip(self, strategy), fields(connection_id = %id, kind = strategy.kind.as_str()))]
    pub async fn configure_sync_strategy(&self, id: &ConnectionId, strategy: SyncStrategy) -> Result<(), SyncError> {
        let invalid = |reason: &str| SyncError::InvalidStrategy {
            connection_id: id.clone(),
            reason: reason.to_string(),
        };
        if strategy.entities.is_empty() {
            return Err(invalid("no entity kinds selected"));
        }
        if strategy.conflict_resolution == ResolutionStrategy::MasterWins && strategy.master_connection_id.is_none() {
            return Err(invalid("master-wins requires a master connection"));
        }
        if strategy.interval_minutes == Some(0) {
            return Err(invalid("interval must be at least one minute"));
        }

        let (connector, previous) = {
            let mut connections = self.inner.connections.write().await;
            let entry = connections
                .get_mut(id)
                .ok_or_else(|| SyncError::UnknownConnection(id.clone()))?;

            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            if let (true, Some(minutes)) = (strategy.is_scheduled(), strategy.interval_minutes) {
                let every = Duration::from_secs(minutes.saturating_mul(60));
                entry.timer = Some(spawn_scheduled_sync(
                    Arc::downgrade(&self.inner),
                    id.clone(),
                    every,
                    strategy.entities.clone(),
                ));
            }
            let previous = entry.info.strategy.replace(strategy.clone());
            (entry.connector.clone(), previous)
        };

        let live = strategy.kind == SyncKind::RealTime;
        if let Some(previous) = previous.filter(|p| p.kind == SyncKind::RealTime) {
            let stale: Vec<EntityKind> = previous
                .entities
                .into_iter()
                .filter(|k| !(live && strategy.entities.contains(k)))
                .collect();
            if !stale.is_empty() {
                debug!(entities = ?stale, "unsubscribing from change events");
                connector.unsubscribe_from_events(&stale).await?;
            }
        }
        if live {
            connector.subscribe_to_events(&strategy.entities).await?;
        }

        info!(
            entities = ?strategy.entities,
            resolution = %strategy.conflict_resolution,
            interval_minutes = ?strategy.interval_minutes,
            "sync strategy configured"
        );
        Ok(())
    }

    /// Sync one kind, or every kind when `kind` is `None`, across all active
    /// connections. Only one explicit sync may run at a time.
    #[instrument(skip(self))]
    pub async fn sync_all(&self, kind: Option<EntityKind>) -> Result<SyncReport, SyncError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(SyncError::ShutDown);
        }
        let Some(_guard) = SyncGuard::acquire(&self.inner.syncing) else {
            return Err(SyncError::AlreadyInProgress);
        };

        let kinds = kind.map_or_else(|| EntityKind::ALL.to_vec(), |k| vec![k]);
        let scope = SyncScope::Full {
            entity_kinds: kinds.clone(),
        };
        self.inner.run_scoped(scope, &kinds).await
    }

    /// Run a single entity pass outside the `sync_all` exclusivity flag.
    #[instrument(skip(self))]
    pub async fn sync_entity(&self, kind: EntityKind) -> Result<EntitySyncReport, SyncError> {
        let scope = SyncScope::Full {
            entity_kinds: vec![kind],
        };
        let mut report = self.inner.run_scoped(scope, &[kind]).await?;
        Ok(report.entities.pop().unwrap_or_else(|| EntitySyncReport::empty(kind)))
    }

    /// Health of every managed connection, sorted by id.
    ///
    /// Connections the registry no longer holds report as disconnected.
    pub async fn get_health_status(&self) -> Vec<ConnectionHealth> {
        let live = self.inner.registry.get_health_status().await;
        let connections = self.inner.connections.read().await;

        let mut health: Vec<ConnectionHealth> = connections
            .values()
            .map(|e| ConnectionHealth {
                connection_id: e.info.id.clone(),
                erp_type: e.info.erp_type.clone(),
                priority: e.info.priority,
                is_active: e.info.is_active,
                last_sync: e.info.last_sync,
                sync_error_count: e.info.sync_error_count,
                last_error: e.info.last_error.clone(),
                connector: live
                    .get(&e.info.id)
                    .cloned()
                    .unwrap_or_else(|| ConnectorHealth::disconnected(e.info.last_error.clone())),
            })
            .collect();
        health.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        health
    }

    /// Managed connections, sorted by id.
    pub async fn connections(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self
            .inner
            .connections
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.inner.connections.read().await.get(id).map(|e| e.info.clone())
    }

    /// Conflicts waiting for an operator decision, oldest first.
    pub fn pending_conflicts(&self) -> Vec<DataConflict> {
        self.inner.manual_queue().clone()
    }

    /// Operator decision: accept the data `connection_id` reported for a queued
    /// conflict and write it back to the other sources.
    #[instrument(skip(self), fields(conflict_id = %conflict_id, connection_id = %connection_id))]
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        connection_id: &ConnectionId,
    ) -> Result<Resolution, SyncError> {
        let inner = &self.inner;
        let (conflict, resolution) = {
            let mut queue = inner.manual_queue();
            let pos = queue
                .iter()
                .position(|c| c.id == conflict_id)
                .ok_or(SyncError::ConflictNotFound(conflict_id))?;
            let resolution =
                ConflictResolver::accept_source(&mut queue[pos], connection_id, format!("accepted by operator from {connection_id}"))?;
            (queue.remove(pos), resolution)
        };

        let kind = conflict.entity_kind;
        let participants = inner.participants().await;
        let policy = inner.policy();
        let guards = lock_all(&participants).await;
        let written = inner
            .write_back(
                kind,
                std::slice::from_ref(&conflict),
                std::slice::from_ref(&resolution),
                &participants,
                &policy,
            )
            .await;
        drop(guards);

        info!(written = written.values().sum::<usize>(), "manual conflict resolved");
        inner.activity.log_activity(
            Some(connection_id),
            Severity::Info,
            "conflict resolved manually",
            json!({ "conflict_id": conflict_id.to_string(), "entity_id": conflict.entity_id }),
        );
        inner.publish(BridgeEvent::ConflictsResolved {
            entity_kind: kind,
            resolutions: vec![resolution.clone()],
            at: Utc::now(),
        });
        Ok(resolution)
    }

    /// Drop a queued conflict without writing anything.
    pub fn ignore_conflict(&self, conflict_id: ConflictId) -> Result<DataConflict, SyncError> {
        let conflict = {
            let mut queue = self.inner.manual_queue();
            let pos = queue
                .iter()
                .position(|c| c.id == conflict_id)
                .ok_or(SyncError::ConflictNotFound(conflict_id))?;
            queue[pos].mark_ignored()?;
            queue.remove(pos)
        };

        self.inner.activity.log_activity(
            None,
            Severity::Info,
            "conflict ignored",
            json!({ "conflict_id": conflict_id.to_string(), "entity_id": conflict.entity_id }),
        );
        Ok(conflict)
    }

    /// Cancel every timer and pending re-sync, then disconnect all connections.
    /// Later calls are no-ops.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let entries: Vec<ConnectionEntry> = inner.connections.write().await.drain().map(|(_, e)| e).collect();
        for mut entry in entries {
            entry.abort_tasks();
        }
        for (_, (_, task)) in inner.resync_tasks().drain() {
            task.abort();
        }
        inner.registry.disconnect_all().await;

        info!("sync orchestrator shut down");
        inner
            .activity
            .log_activity(None, Severity::Info, "orchestrator shut down", json!({}));
    }
}

impl Inner {
    fn publish(&self, event: BridgeEvent) {
        if let Err(e) = self.bus.publish(event) {
            warn!(error = %e, "failed to publish bridge event");
        }
    }

    fn policy(&self) -> ComparisonPolicy {
        self.policy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn rules(&self) -> MutexGuard<'_, HashMap<EntityKind, ResolutionStrategy>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn manual_queue(&self) -> MutexGuard<'_, Vec<DataConflict>> {
        self.manual_queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resync_tasks(&self) -> MutexGuard<'_, HashMap<EntityKind, (u64, JoinHandle<()>)>> {
        self.resync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active connections sorted by id.
    async fn participants(&self) -> Vec<Participant> {
        let connections = self.connections.read().await;
        let mut participants: Vec<Participant> = connections
            .values()
            .filter(|e| e.info.is_active)
            .map(|e| Participant {
                id: e.info.id.clone(),
                erp_type: e.info.erp_type.clone(),
                priority: e.info.priority,
                strategy: e.info.strategy.clone(),
                connector: e.connector.clone(),
                lock: e.lock.clone(),
            })
            .collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }

    /// Run passes for `kinds` one after another, bracketed by start/complete or
    /// failed events.
    async fn run_scoped(&self, scope: SyncScope, kinds: &[EntityKind]) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        self.publish(BridgeEvent::SyncStarted {
            scope: scope.clone(),
            at: Utc::now(),
        });

        let mut entities = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            match self.run_pass(kind, &scope).await {
                Ok(report) => entities.push(report),
                Err(e) => {
                    warn!(entity_kind = %kind, error = %e, "sync pass failed");
                    self.activity.log_activity(
                        None,
                        Severity::Error,
                        "sync failed",
                        json!({ "entity_kind": kind, "error": e.to_string() }),
                    );
                    self.publish(BridgeEvent::SyncFailed {
                        scope,
                        connection_id: None,
                        error: e.to_string(),
                        at: Utc::now(),
                    });
                    return Err(e);
                }
            }
        }

        let report = SyncReport {
            entities,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            conflicts = report.conflict_count(),
            duration_ms = report.duration_ms,
            "sync completed"
        );
        self.publish(BridgeEvent::SyncCompleted {
            scope,
            results: report.results().cloned().collect(),
            conflicts: report.conflict_count(),
            duration_ms: report.duration_ms,
            at: Utc::now(),
        });
        Ok(report)
    }

    async fn run_pass(&self, kind: EntityKind, scope: &SyncScope) -> Result<EntitySyncReport, SyncError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SyncError::ShutDown);
        }
        let started = Instant::now();
        let participants = self.participants().await;
        let guards = lock_all(&participants).await;

        let outcomes = join_all(participants.iter().map(|p| self.fetch_from(p, kind, scope))).await;
        let mut results = Vec::with_capacity(outcomes.len());
        let mut observations = Vec::new();
        for (result, fetched) in outcomes {
            results.push(result);
            observations.extend(fetched);
        }

        let policy = self.policy();
        let detection = detect_conflicts(kind, &observations, &policy);
        for (entity_id, e) in &detection.malformed {
            warn!(entity_kind = %kind, entity_id = %entity_id, error = %e, "entity skipped during conflict detection");
            self.activity.log_activity(
                None,
                Severity::Warning,
                "entity could not be compared",
                json!({ "entity_kind": kind, "entity_id": entity_id, "error": e.to_string() }),
            );
        }

        let mut conflicts = detection.conflicts;
        let resolver = self.resolver_for(kind, &participants);
        let mut resolutions = resolver.resolve_all(&mut conflicts)?;

        let every_source_read = results.iter().all(|r| r.success);
        let queued = self.requeue_pending(kind, &mut conflicts, &mut resolutions, every_source_read);
        if queued > 0 {
            info!(entity_kind = %kind, count = queued, "conflicts queued for manual review");
            self.activity.log_activity(
                None,
                Severity::Warning,
                "conflicts need manual review",
                json!({ "entity_kind": kind, "count": queued }),
            );
        }

        if !resolutions.is_empty() {
            self.publish(BridgeEvent::ConflictsResolved {
                entity_kind: kind,
                resolutions: resolutions.clone(),
                at: Utc::now(),
            });
        }

        let written = self
            .write_back(kind, &conflicts, &resolutions, &participants, &policy)
            .await;
        drop(guards);

        for result in &mut results {
            result.written = written.get(&result.connection_id).copied().unwrap_or(0);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let fetched: usize = results.iter().map(|r| r.fetched).sum();
        let tags = [("entity_kind", kind.as_str())];
        self.publish(BridgeEvent::metric("sync.records_fetched", fetched as f64, &tags));
        self.publish(BridgeEvent::metric("sync.conflicts_detected", conflicts.len() as f64, &tags));
        self.publish(BridgeEvent::metric("sync.duration_ms", duration_ms as f64, &tags));

        debug!(entity_kind = %kind, fetched, conflicts = conflicts.len(), duration_ms, "entity pass finished");
        Ok(EntitySyncReport {
            entity_kind: kind,
            results,
            conflicts,
            resolutions,
            duration_ms,
        })
    }

    /// Fold a pass's pending conflicts into the review queue, one entry per
    /// entity. A re-detected entity keeps its queued id and takes the fresh
    /// sources. Queued entities that no longer disagree are dropped, but only
    /// when every source was read.
    fn requeue_pending(
        &self,
        kind: EntityKind,
        conflicts: &mut [DataConflict],
        resolutions: &mut [Resolution],
        every_source_read: bool,
    ) -> usize {
        let mut queue = self.manual_queue();
        let mut queued = 0;
        for conflict in conflicts.iter_mut().filter(|c| c.is_pending()) {
            queued += 1;
            let Some(entry) = queue
                .iter_mut()
                .find(|q| q.entity_kind == kind && q.entity_id == conflict.entity_id)
            else {
                queue.push(conflict.clone());
                continue;
            };
            let fresh_id = conflict.id;
            conflict.id = entry.id;
            for r in resolutions.iter_mut().filter(|r| r.conflict_id == fresh_id) {
                r.conflict_id = entry.id;
            }
            entry.kind = conflict.kind;
            entry.sources = conflict.sources.clone();
        }

        if every_source_read {
            let before = queue.len();
            queue.retain(|q| {
                q.entity_kind != kind
                    || conflicts
                        .iter()
                        .any(|c| c.is_pending() && c.entity_id == q.entity_id)
            });
            let settled = before - queue.len();
            if settled > 0 {
                debug!(entity_kind = %kind, settled, "queued conflicts no longer in disagreement");
            }
        }
        queued
    }

    /// Fetch one kind from one connection. Failures are folded into the result
    /// so they never abort the pass for other connections.
    async fn fetch_from(
        &self,
        p: &Participant,
        kind: EntityKind,
        scope: &SyncScope,
    ) -> (ConnectionSyncResult, Vec<Observation>) {
        let started = Instant::now();
        let outcome = p.connector.fetch_records(kind, &EntityQuery::all()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(records) => {
                let fetched_at = Utc::now();
                self.record_success(&p.id, fetched_at).await;
                let observations: Vec<Observation> = records
                    .into_iter()
                    .map(|record| Observation {
                        connection_id: p.id.clone(),
                        origin: p.erp_type.clone(),
                        priority: p.priority,
                        record,
                        fetched_at,
                    })
                    .collect();
                let result = ConnectionSyncResult {
                    connection_id: p.id.clone(),
                    entity_kind: kind,
                    fetched: observations.len(),
                    written: 0,
                    success: true,
                    error: None,
                    duration_ms,
                };
                (result, observations)
            }
            Err(e) => {
                warn!(connection_id = %p.id, entity_kind = %kind, error = %e, "fetch failed");
                self.record_failure(&p.id, &e.to_string()).await;
                self.activity.log_activity(
                    Some(&p.id),
                    Severity::Error,
                    "fetch failed",
                    json!({ "entity_kind": kind, "error": e.to_string() }),
                );
                self.publish(BridgeEvent::SyncFailed {
                    scope: scope.clone(),
                    connection_id: Some(p.id.clone()),
                    error: e.to_string(),
                    at: Utc::now(),
                });
                let result = ConnectionSyncResult {
                    connection_id: p.id.clone(),
                    entity_kind: kind,
                    fetched: 0,
                    written: 0,
                    success: false,
                    error: Some(e.to_string()),
                    duration_ms,
                };
                (result, Vec::new())
            }
        }
    }

    /// Resolver for one pass.
    ///
    /// Orchestrator rules win; otherwise the highest-priority connection whose
    /// strategy covers `kind` decides (lowest id on ties); otherwise the
    /// configured default applies.
    fn resolver_for(&self, kind: EntityKind, participants: &[Participant]) -> ConflictResolver {
        let governing = participants
            .iter()
            .filter_map(|p| p.strategy.as_ref().filter(|s| s.covers(kind)).map(|s| (p, s)))
            .max_by(|(a, _), (b, _)| a.priority.cmp(&b.priority).then_with(|| b.id.cmp(&a.id)))
            .map(|(_, s)| s);

        let mut resolver = match governing {
            Some(strategy) => {
                let resolver = ConflictResolver::new(strategy.conflict_resolution);
                match &strategy.master_connection_id {
                    Some(master) => resolver.with_master(master.clone()),
                    None => resolver,
                }
            }
            None => ConflictResolver::new(self.config.default_resolution),
        };
        if let Some(rule) = self.rules().get(&kind).copied() {
            resolver = resolver.with_rule(kind, rule);
        }
        resolver
    }

    /// Push winning data to every source that disagrees with it, one bulk write
    /// per connection. Returns records written per connection.
    async fn write_back(
        &self,
        kind: EntityKind,
        conflicts: &[DataConflict],
        resolutions: &[Resolution],
        participants: &[Participant],
        policy: &ComparisonPolicy,
    ) -> HashMap<ConnectionId, usize> {
        let mut pending: BTreeMap<ConnectionId, BTreeMap<String, EntityRecord>> = BTreeMap::new();
        for resolution in resolutions {
            let Some(winning) = resolution.winning_data() else {
                continue;
            };
            let Some(conflict) = conflicts.iter().find(|c| c.id == resolution.conflict_id) else {
                continue;
            };
            for source in &conflict.sources {
                if !policy.differs(kind, &source.data, winning).unwrap_or(true) {
                    continue;
                }
                pending.entry(source.connection_id.clone()).or_default().insert(
                    conflict.entity_id.clone(),
                    EntityRecord {
                        kind,
                        id: conflict.entity_id.clone(),
                        data: winning.clone(),
                        updated_at: None,
                        version: None,
                    },
                );
            }
        }

        let writes = pending.into_iter().filter_map(|(id, records)| {
            let participant = participants.iter().find(|p| p.id == id)?;
            let records: Vec<EntityRecord> = records.into_values().collect();
            Some(async move { (participant, participant.connector.bulk_sync(kind, records).await) })
        });

        let mut written = HashMap::new();
        for (p, outcome) in join_all(writes).await {
            match outcome {
                Ok(bulk) => {
                    written.insert(p.id.clone(), bulk.succeeded);
                    if bulk.failed > 0 {
                        let message = format!("{} of {} write-backs failed", bulk.failed, bulk.total());
                        warn!(connection_id = %p.id, entity_kind = %kind, failed = bulk.failed, "write-back partially failed");
                        self.record_failure(&p.id, &message).await;
                        self.activity.log_activity(
                            Some(&p.id),
                            Severity::Warning,
                            "write-back partially failed",
                            json!({ "entity_kind": kind, "errors": bulk.errors }),
                        );
                    }
                }
                Err(e) => {
                    warn!(connection_id = %p.id, entity_kind = %kind, error = %e, "write-back failed");
                    self.record_failure(&p.id, &e.to_string()).await;
                    self.activity.log_activity(
                        Some(&p.id),
                        Severity::Error,
                        "write-back failed",
                        json!({ "entity_kind": kind, "error": e.to_string() }),
                    );
                }
            }
        }
        written
    }

    async fn record_success(&self, id: &ConnectionId, at: DateTime<Utc>) {
        if let Some(entry) = self.connections.write().await.get_mut(id) {
            entry.info.last_sync = Some(at);
        }
    }

    async fn record_failure(&self, id: &ConnectionId, message: &str) {
        if let Some(entry) = self.connections.write().await.get_mut(id) {
            entry.info.sync_error_count += 1;
            entry.info.last_error = Some(message.to_string());
        }
    }

    async fn on_connector_event(self: &Arc<Self>, id: &ConnectionId, event: ConnectorEvent) {
        match event.kind {
            ConnectorEventKind::Disconnected => {
                warn!(connection_id = %id, "connector reported disconnect");
                if let Some(entry) = self.connections.write().await.get_mut(id) {
                    entry.info.is_active = false;
                }
                self.activity
                    .log_activity(Some(id), Severity::Warning, "connector disconnected", json!({}));
            }
            ConnectorEventKind::Error => {
                let message = match &event.payload {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => "connector error".to_string(),
                    other => other.to_string(),
                };
                self.record_failure(id, &message).await;
            }
            _ => {}
        }

        if event.is_data_change() {
            if let Some(kind) = event.entity_kind {
                self.schedule_resync(kind);
            }
        }
        self.publish(BridgeEvent::ErpEvent {
            connection_id: id.clone(),
            event,
        });
    }

    /// (Re)start the quiet period for `kind`. Only the last change within the
    /// window triggers a pass.
    fn schedule_resync(self: &Arc<Self>, kind: EntityKind) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let mut pending = self.resync_tasks();
        let generation = pending.get(&kind).map_or(1, |(g, _)| g + 1);
        let weak = Arc::downgrade(self);
        let delay = self.config.resync_debounce;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.take_resync(kind, generation) {
                return;
            }
            let scope = SyncScope::Triggered { entity_kind: kind };
            if let Err(e) = inner.run_scoped(scope, &[kind]).await {
                debug!(entity_kind = %kind, error = %e, "triggered re-sync failed");
            }
        });
        // Superseded tasks see a newer generation and exit on wake.
        pending.insert(kind, (generation, task));
    }

    fn take_resync(&self, kind: EntityKind, generation: u64) -> bool {
        let mut pending = self.resync_tasks();
        match pending.get(&kind) {
            Some((current, _)) if *current == generation => {
                pending.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

/// Lock participants in id order so concurrent passes never deadlock.
async fn lock_all(participants: &[Participant]) -> Vec<OwnedMutexGuard<()>> {
    let mut guards = Vec::with_capacity(participants.len());
    for p in participants {
        guards.push(p.lock.clone().lock_owned().await);
    }
    guards
}

fn spawn_event_forwarder(
    inner: Weak<Inner>,
    id: ConnectionId,
    mut events: broadcast::Receiver<ConnectorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %id, skipped, "connector events lagged");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.on_connector_event(&id, event).await;
        }
    })
}

fn spawn_scheduled_sync(inner: Weak<Inner>, id: ConnectionId, every: Duration, kinds: Vec<EntityKind>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let scope = SyncScope::Scheduled {
                connection_id: id.clone(),
                entity_kinds: kinds.clone(),
            };
            if let Err(e) = inner.run_scoped(scope, &kinds).await {
                debug!(connection_id = %id, error = %e, "scheduled sync failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use erpbridge_connectors::InMemoryConnector;
    use erpbridge_core::{ConnectorError, Product};
    use erpbridge_infra::InMemoryActivityLog;

    fn product(id: &str, price: f64) -> Product {
        Product {
            id: id.to_string(),
            sku: format!("SKU-{id}"),
            name: "Widget".to_string(),
            price: Some(price),
            currency: None,
            quantity: None,
            updated_at: None,
        }
    }

    async fn registry_with(connectors: Vec<(&'static str, Arc<InMemoryConnector>)>) -> ConnectorRegistry {
        let registry = ConnectorRegistry::new();
        for (erp_type, connector) in connectors {
            registry
                .register(erp_type, move |_cfg: &ConnectorConfig| Ok(connector.clone() as Arc<dyn Connector>))
                .await
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn resolver_prefers_highest_priority_strategy() {
        let a = Arc::new(InMemoryConnector::new("alpha", "A"));
        let b = Arc::new(InMemoryConnector::new("beta", "B"));
        let registry = registry_with(vec![("alpha", a), ("beta", b)]).await;
        let orch = SyncOrchestrator::new(registry, BridgeConfig::default());
        orch.add_erp("a", ConnectorConfig::new("alpha", "A"), 10).await.unwrap();
        orch.add_erp("b", ConnectorConfig::new("beta", "B"), 50).await.unwrap();

        let manual = SyncStrategy::new(SyncKind::Full, vec![EntityKind::Products]).resolve_with(ResolutionStrategy::Manual);
        let merge = SyncStrategy::new(SyncKind::Full, vec![EntityKind::Products]).resolve_with(ResolutionStrategy::Merge);
        orch.configure_sync_strategy(&"a".into(), manual).await.unwrap();
        orch.configure_sync_strategy(&"b".into(), merge).await.unwrap();

        let participants = orch.inner.participants().await;
        let resolver = orch.inner.resolver_for(EntityKind::Products, &participants);
        assert_eq!(resolver.strategy_for(EntityKind::Products), ResolutionStrategy::Merge);
        assert_eq!(
            orch.inner.resolver_for(EntityKind::Orders, &participants).strategy_for(EntityKind::Orders),
            ResolutionStrategy::LastWriteWins
        );

        orch.set_resolution_rule(EntityKind::Products, ResolutionStrategy::Manual);
        let resolver = orch.inner.resolver_for(EntityKind::Products, &participants);
        assert_eq!(resolver.strategy_for(EntityKind::Products), ResolutionStrategy::Manual);
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_and_counted() {
        let a = Arc::new(InMemoryConnector::new("alpha", "A"));
        let b = Arc::new(InMemoryConnector::new("beta", "B"));
        a.seed(&[product("P1", 10.0)]).await.unwrap();
        b.seed(&[product("P1", 12.0)]).await.unwrap();
        let registry = registry_with(vec![("alpha", a.clone()), ("beta", b.clone())]).await;
        let log = Arc::new(InMemoryActivityLog::new());
        let orch = SyncOrchestrator::with_activity_log(registry, BridgeConfig::default(), log.clone());
        orch.add_erp("a", ConnectorConfig::new("alpha", "A"), 10).await.unwrap();
        orch.add_erp("b", ConnectorConfig::new("beta", "B"), 50).await.unwrap();

        a.fail_next_calls([ConnectorError::validation("bad credentials scope")]);
        let report = orch.sync_entity(EntityKind::Products).await.unwrap();

        let failed = report.result_for(&"a".into()).unwrap();
        assert!(!failed.success);
        assert!(report.result_for(&"b".into()).unwrap().success);
        assert!(report.conflicts.is_empty());

        let a_conn = orch.connection(&"a".into()).await.unwrap();
        assert_eq!(a_conn.sync_error_count, 1);
        assert!(a_conn.last_error.is_some());
        assert!(orch.connection(&"b".into()).await.unwrap().last_sync.is_some());
        assert!(!log.with_severity(Severity::Error).is_empty());
    }

    #[tokio::test]
    async fn invalid_strategies_are_rejected() {
        let a = Arc::new(InMemoryConnector::new("alpha", "A"));
        let registry = registry_with(vec![("alpha", a)]).await;
        let orch = SyncOrchestrator::new(registry, BridgeConfig::default());
        orch.add_erp("a", ConnectorConfig::new("alpha", "A"), 10).await.unwrap();

        let no_master =
            SyncStrategy::new(SyncKind::Full, vec![EntityKind::Products]).resolve_with(ResolutionStrategy::MasterWins);
        assert!(matches!(
            orch.configure_sync_strategy(&"a".into(), no_master).await,
            Err(SyncError::InvalidStrategy { .. })
        ));

        let empty = SyncStrategy::new(SyncKind::Full, vec![]);
        assert!(matches!(
            orch.configure_sync_strategy(&"a".into(), empty).await,
            Err(SyncError::InvalidStrategy { .. })
        ));

        let unknown = SyncStrategy::new(SyncKind::Full, vec![EntityKind::Products]);
        assert!(matches!(
            orch.configure_sync_strategy(&"zzz".into(), unknown).await,
            Err(SyncError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn disabled_config_is_refused() {
        let registry = ConnectorRegistry::new();
        let orch = SyncOrchestrator::new(registry, BridgeConfig::default());
        let mut config = ConnectorConfig::new("alpha", "A");
        config.enabled = false;
        assert!(matches!(
            orch.add_erp("a", config, 1).await,
            Err(SyncError::ConnectionDisabled(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_refuses_further_work() {
        let a = Arc::new(InMemoryConnector::new("alpha", "A"));
        let registry = registry_with(vec![("alpha", a.clone())]).await;
        let orch = SyncOrchestrator::new(registry.clone(), BridgeConfig::default());
        orch.add_erp("a", ConnectorConfig::new("alpha", "A"), 10).await.unwrap();

        orch.shutdown().await;
        orch.shutdown().await;

        assert!(orch.connections().await.is_empty());
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(a.disconnect_calls(), 1);
        assert_eq!(orch.sync_all(None).await.unwrap_err(), SyncError::ShutDown);
    }
}
