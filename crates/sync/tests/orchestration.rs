use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use erpbridge_connectors::{Connector, ConnectorRegistry, InMemoryConnector};
use erpbridge_core::{
    ConnectionId, ConnectorConfig, ConnectorError, ConnectorEvent, ConnectorEventKind, EntityKind, Product, ResolutionAction,
    ResolutionStrategy, SyncKind, SyncStrategy,
};
use erpbridge_events::{BridgeEvent, SyncScope};
use erpbridge_infra::BridgeConfig;
use erpbridge_sync::{SyncError, SyncOrchestrator};

fn product(id: &str, price: f64) -> Product {
    Product {
        id: id.to_string(),
        sku: format!("SKU-{id}"),
        name: "Widget".to_string(),
        price: Some(price),
        currency: Some("USD".to_string()),
        quantity: None,
        updated_at: None,
    }
}

/// Two in-memory ERPs wired into one orchestrator: `a` (priority 10) and `b`
/// (priority 50).
struct Bridge {
    orch: SyncOrchestrator,
    a: Arc<InMemoryConnector>,
    b: Arc<InMemoryConnector>,
}

impl Bridge {
    async fn start(config: BridgeConfig) -> Self {
        erpbridge_observability::init_with(erpbridge_observability::LogFormat::Pretty, "erpbridge_sync=debug");

        let a = Arc::new(InMemoryConnector::new("erp-alpha", "Alpha"));
        let b = Arc::new(InMemoryConnector::new("erp-beta", "Beta"));

        let registry = ConnectorRegistry::new();
        for conn in [a.clone(), b.clone()] {
            let erp_type = conn.erp_type().clone();
            registry
                .register(erp_type, move |_: &ConnectorConfig| Ok(conn.clone() as Arc<dyn Connector>))
                .await
                .unwrap();
        }

        let orch = SyncOrchestrator::new(registry, config);
        orch.add_erp("a", ConnectorConfig::new("erp-alpha", "Alpha"), 10)
            .await
            .unwrap();
        orch.add_erp("b", ConnectorConfig::new("erp-beta", "Beta"), 50)
            .await
            .unwrap();

        Self { orch, a, b }
    }

    async fn seed_prices(&self, a_price: f64, b_price: f64) {
        self.a.seed(&[product("P1", a_price)]).await.unwrap();
        self.b.seed(&[product("P1", b_price)]).await.unwrap();
    }
}

fn count_started(events: &[BridgeEvent], pred: impl Fn(&SyncScope) -> bool) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, BridgeEvent::SyncStarted { scope, .. } if pred(scope)))
        .count()
}

#[tokio::test]
async fn master_wins_picks_master_data_and_writes_it_back() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 12.0).await;

    let strategy = SyncStrategy::new(SyncKind::Full, vec![EntityKind::Products])
        .resolve_with(ResolutionStrategy::MasterWins)
        .with_master("b");
    bridge
        .orch
        .configure_sync_strategy(&"b".into(), strategy)
        .await
        .unwrap();

    let events = bridge.orch.subscribe();
    let report = bridge.orch.sync_all(Some(EntityKind::Products)).await.unwrap();

    let products = report.entity(EntityKind::Products).unwrap();
    assert_eq!(products.conflicts.len(), 1);
    assert_eq!(products.conflicts[0].sources.len(), 2);
    assert_eq!(products.resolutions.len(), 1);

    let resolution = &products.resolutions[0];
    assert_eq!(resolution.action, ResolutionAction::Accept);
    let chosen = resolution.chosen_source.as_ref().unwrap();
    assert_eq!(chosen.origin.as_str(), "erp-beta");
    assert_eq!(chosen.data["price"], json!(12.0));

    // The loser now holds the master's price; the master was left alone.
    assert_eq!(bridge.a.stored(EntityKind::Products).await["P1"]["price"], json!(12.0));
    assert_eq!(products.result_for(&"a".into()).unwrap().written, 1);
    assert_eq!(products.result_for(&"b".into()).unwrap().written, 0);

    let published = events.drain();
    assert!(matches!(published.first(), Some(BridgeEvent::SyncStarted { .. })));
    assert!(published.iter().any(|e| matches!(e, BridgeEvent::ConflictsResolved { .. })));
    assert!(published.iter().any(
        |e| matches!(e, BridgeEvent::Metric { name, value, .. } if name == "sync.conflicts_detected" && *value == 1.0)
    ));
    assert!(matches!(
        published.last(),
        Some(BridgeEvent::SyncCompleted { conflicts: 1, .. })
    ));

    // A second pass sees agreement.
    let again = bridge.orch.sync_all(Some(EntityKind::Products)).await.unwrap();
    assert_eq!(again.conflict_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn overlapping_sync_all_is_rejected() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 10.0).await;
    bridge.a.set_latency(Duration::from_secs(2));

    let running = {
        let orch = bridge.orch.clone();
        tokio::spawn(async move { orch.sync_all(None).await })
    };
    while !bridge.orch.is_syncing() {
        tokio::task::yield_now().await;
    }

    let err = bridge.orch.sync_all(None).await.unwrap_err();
    assert_eq!(err, SyncError::AlreadyInProgress);
    assert_eq!(err.to_string(), "Sync already in progress");

    let first = running.await.unwrap().unwrap();
    assert_eq!(first.entities.len(), EntityKind::ALL.len());
    assert!(!bridge.orch.is_syncing());

    bridge.a.clear_faults();
    assert!(bridge.orch.sync_all(Some(EntityKind::Products)).await.is_ok());
}

#[tokio::test]
async fn one_failing_connection_does_not_abort_the_pass() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 12.0).await;
    let events = bridge.orch.subscribe();

    bridge
        .b
        .fail_next_calls([ConnectorError::authentication(401, "token revoked")]);
    let report = bridge.orch.sync_all(Some(EntityKind::Products)).await.unwrap();

    let products = report.entity(EntityKind::Products).unwrap();
    assert!(products.result_for(&"a".into()).unwrap().success);
    let failed = products.result_for(&"b".into()).unwrap();
    assert!(!failed.success);
    assert!(failed.error.as_deref().unwrap().contains("token revoked"));
    assert!(products.conflicts.is_empty());

    let published = events.drain();
    assert!(published.iter().any(|e| matches!(
        e,
        BridgeEvent::SyncFailed { connection_id: Some(id), .. } if id.as_str() == "b"
    )));
    assert!(published.iter().any(|e| matches!(e, BridgeEvent::SyncCompleted { .. })));

    let health = bridge.orch.get_health_status().await;
    let b = health.iter().find(|h| h.connection_id.as_str() == "b").unwrap();
    assert_eq!(b.sync_error_count, 1);
    assert!(b.connector.connected);
}

#[tokio::test]
async fn manual_conflicts_wait_for_an_operator() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 12.0).await;
    bridge
        .orch
        .set_resolution_rule(EntityKind::Products, ResolutionStrategy::Manual);

    let report = bridge.orch.sync_entity(EntityKind::Products).await.unwrap();
    assert_eq!(report.resolutions[0].action, ResolutionAction::ManualReview);
    assert!(report.resolutions[0].resolved_at.is_none());
    assert_eq!(bridge.b.stored(EntityKind::Products).await["P1"]["price"], json!(12.0));

    let pending = bridge.orch.pending_conflicts();
    assert_eq!(pending.len(), 1);
    let conflict_id = pending[0].id;

    let resolution = bridge
        .orch
        .resolve_conflict(conflict_id, &"a".into())
        .await
        .unwrap();
    assert_eq!(resolution.action, ResolutionAction::Accept);
    assert_eq!(bridge.b.stored(EntityKind::Products).await["P1"]["price"], json!(10.0));
    assert!(bridge.orch.pending_conflicts().is_empty());

    assert_eq!(
        bridge.orch.resolve_conflict(conflict_id, &"a".into()).await.unwrap_err(),
        SyncError::ConflictNotFound(conflict_id)
    );
}

#[tokio::test]
async fn ignored_conflicts_leave_sources_untouched() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 12.0).await;
    bridge
        .orch
        .set_resolution_rule(EntityKind::Products, ResolutionStrategy::Manual);
    bridge.orch.sync_entity(EntityKind::Products).await.unwrap();

    let conflict_id = bridge.orch.pending_conflicts()[0].id;
    let ignored = bridge.orch.ignore_conflict(conflict_id).unwrap();
    assert!(!ignored.is_pending());
    assert!(bridge.orch.pending_conflicts().is_empty());
    assert_eq!(bridge.a.stored(EntityKind::Products).await["P1"]["price"], json!(10.0));
    assert_eq!(bridge.b.stored(EntityKind::Products).await["P1"]["price"], json!(12.0));
}

#[tokio::test]
async fn repeated_manual_passes_keep_one_current_conflict_per_entity() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 12.0).await;
    bridge
        .orch
        .set_resolution_rule(EntityKind::Products, ResolutionStrategy::Manual);

    bridge.orch.sync_entity(EntityKind::Products).await.unwrap();
    let first_id = bridge.orch.pending_conflicts()[0].id;

    bridge.b.seed(&[product("P1", 15.0)]).await.unwrap();
    bridge.orch.sync_entity(EntityKind::Products).await.unwrap();
    let report = bridge.orch.sync_entity(EntityKind::Products).await.unwrap();
    assert_eq!(report.conflicts[0].id, first_id);
    assert_eq!(report.resolutions[0].conflict_id, first_id);

    let pending = bridge.orch.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, first_id);
    let b_view = pending[0].source_from(&"b".into()).unwrap();
    assert_eq!(b_view.data["price"], json!(15.0));

    bridge
        .orch
        .resolve_conflict(first_id, &"b".into())
        .await
        .unwrap();
    assert_eq!(bridge.a.stored(EntityKind::Products).await["P1"]["price"], json!(15.0));
    assert_eq!(bridge.b.stored(EntityKind::Products).await["P1"]["price"], json!(15.0));
    assert!(bridge.orch.pending_conflicts().is_empty());
}

#[tokio::test]
async fn queued_conflict_is_dropped_once_sources_agree() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 12.0).await;
    bridge
        .orch
        .set_resolution_rule(EntityKind::Products, ResolutionStrategy::Manual);
    bridge.orch.sync_entity(EntityKind::Products).await.unwrap();
    assert_eq!(bridge.orch.pending_conflicts().len(), 1);

    // A source that cannot be read says nothing about agreement.
    bridge.a.seed(&[product("P1", 12.0)]).await.unwrap();
    bridge
        .b
        .fail_next_calls([ConnectorError::authentication(401, "token revoked")]);
    bridge.orch.sync_entity(EntityKind::Products).await.unwrap();
    assert_eq!(bridge.orch.pending_conflicts().len(), 1);

    let report = bridge.orch.sync_entity(EntityKind::Products).await.unwrap();
    assert!(report.conflicts.is_empty());
    assert!(bridge.orch.pending_conflicts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn change_events_trigger_one_debounced_resync() {
    let config = BridgeConfig {
        resync_debounce: Duration::from_secs(5),
        ..BridgeConfig::default()
    };
    let bridge = Bridge::start(config).await;
    bridge.seed_prices(10.0, 10.0).await;
    let events = bridge.orch.subscribe();

    bridge
        .a
        .emit(ConnectorEvent::change(ConnectorEventKind::Updated, EntityKind::Products, "P1"));
    tokio::time::sleep(Duration::from_secs(2)).await;
    bridge
        .a
        .emit(ConnectorEvent::change(ConnectorEventKind::Updated, EntityKind::Products, "P1"));

    // Still inside the quiet period of the second change.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let early = events.drain();
    assert_eq!(early.iter().filter(|e| matches!(e, BridgeEvent::ErpEvent { .. })).count(), 2);
    assert_eq!(count_started(&early, |_| true), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let later = events.drain();
    assert_eq!(
        count_started(&later, |s| matches!(
            s,
            SyncScope::Triggered {
                entity_kind: EntityKind::Products
            }
        )),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn interval_strategy_runs_until_the_connection_is_removed() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 10.0).await;
    let events = bridge.orch.subscribe();

    let strategy = SyncStrategy::new(SyncKind::Incremental, vec![EntityKind::Products]).every_minutes(1);
    bridge
        .orch
        .configure_sync_strategy(&"a".into(), strategy)
        .await
        .unwrap();

    let scheduled = |s: &SyncScope| matches!(s, SyncScope::Scheduled { connection_id, .. } if connection_id.as_str() == "a");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(count_started(&events.drain(), scheduled), 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(count_started(&events.drain(), scheduled), 1);

    bridge.orch.remove_erp(&"a".into()).await.unwrap();
    assert_eq!(bridge.a.disconnect_calls(), 1);

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    let after = events.drain();
    assert_eq!(count_started(&after, scheduled), 0);
    assert!(bridge.orch.connection(&"a".into()).await.is_none());
}

#[tokio::test]
async fn replacing_a_real_time_strategy_unsubscribes_dropped_kinds() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    let a = ConnectionId::from("a");

    let live = SyncStrategy::new(SyncKind::RealTime, vec![EntityKind::Products, EntityKind::Orders]);
    bridge.orch.configure_sync_strategy(&a, live).await.unwrap();
    assert!(bridge.a.is_subscribed(EntityKind::Products).await);
    assert!(bridge.a.is_subscribed(EntityKind::Orders).await);

    let narrower = SyncStrategy::new(SyncKind::RealTime, vec![EntityKind::Products]);
    bridge.orch.configure_sync_strategy(&a, narrower).await.unwrap();
    assert!(bridge.a.is_subscribed(EntityKind::Products).await);
    assert!(!bridge.a.is_subscribed(EntityKind::Orders).await);

    let scheduled = SyncStrategy::new(SyncKind::Full, vec![EntityKind::Products]).every_minutes(30);
    bridge.orch.configure_sync_strategy(&a, scheduled).await.unwrap();
    assert!(!bridge.a.is_subscribed(EntityKind::Products).await);
    assert!(!bridge.b.is_subscribed(EntityKind::Products).await);
}

#[tokio::test]
async fn dropped_connection_is_excluded_from_later_passes() {
    let bridge = Bridge::start(BridgeConfig::default()).await;
    bridge.seed_prices(10.0, 12.0).await;

    bridge.a.simulate_drop().await;
    for _ in 0..100 {
        if !bridge.orch.connection(&"a".into()).await.unwrap().is_active {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!bridge.orch.connection(&"a".into()).await.unwrap().is_active);

    let report = bridge.orch.sync_entity(EntityKind::Products).await.unwrap();
    assert_eq!(report.results.len(), 1);
    assert!(report.conflicts.is_empty());

    let health = bridge.orch.get_health_status().await;
    let a = health.iter().find(|h| h.connection_id.as_str() == "a").unwrap();
    assert!(!a.is_active);
    assert!(!a.connector.connected);

    let config = ConnectorConfig::new("erp-alpha", "Alpha");
    let err = bridge.orch.add_erp("a", config.clone(), 10).await.unwrap_err();
    assert_eq!(err, SyncError::ConnectionInactive("a".into()));
    assert!(err.to_string().contains("remove_erp"));

    bridge.orch.remove_erp(&"a".into()).await.unwrap();
    bridge.orch.add_erp("a", config, 10).await.unwrap();
    assert!(bridge.orch.connection(&"a".into()).await.unwrap().is_active);
}

#[tokio::test]
async fn failed_connection_test_leaves_nothing_behind() {
    let c = Arc::new(InMemoryConnector::new("erp-gamma", "Gamma"));
    let registry = ConnectorRegistry::new();
    let factory_conn = c.clone();
    registry
        .register("erp-gamma", move |_: &ConnectorConfig| {
            Ok(factory_conn.clone() as Arc<dyn Connector>)
        })
        .await
        .unwrap();
    let orch = SyncOrchestrator::new(registry.clone(), BridgeConfig::default());

    c.fail_next_calls([ConnectorError::authentication(403, "forbidden")]);
    let err = orch
        .add_erp("c", ConnectorConfig::new("erp-gamma", "Gamma"), 1)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::ConnectionTest { .. }));
    assert!(orch.connections().await.is_empty());
    assert!(!registry.is_active(&"c".into()).await);
    assert_eq!(c.disconnect_calls(), 1);
}

#[tokio::test]
async fn vendor_schema_connections_compare_in_unified_form() {
    use erpbridge_mapping::{FieldMapping, SchemaMapper, UNIFIED_SCHEMA};

    let mapper = Arc::new(SchemaMapper::new());
    mapper.define_mapping(
        "storefront",
        UNIFIED_SCHEMA,
        EntityKind::Products,
        vec![
            FieldMapping::new("product_id", "id").unwrap().required(),
            FieldMapping::new("handle", "sku").unwrap().required(),
            FieldMapping::new("title", "name").unwrap(),
            FieldMapping::new("variant.price", "price").unwrap(),
        ],
    );

    let plain = Arc::new(InMemoryConnector::new("erp-alpha", "Alpha"));
    let shop = Arc::new(InMemoryConnector::new("storefront", "Shop").with_schema(mapper, "storefront"));
    plain.seed(&[product("P1", 10.0)]).await.unwrap();
    shop.seed(&[product("P1", 12.0)]).await.unwrap();
    assert_eq!(shop.stored(EntityKind::Products).await["P1"]["variant"]["price"], json!(12.0));

    let registry = ConnectorRegistry::new();
    for conn in [plain.clone(), shop.clone()] {
        let erp_type = conn.erp_type().clone();
        registry
            .register(erp_type, move |_: &ConnectorConfig| Ok(conn.clone() as Arc<dyn Connector>))
            .await
            .unwrap();
    }
    let orch = SyncOrchestrator::new(registry, BridgeConfig::default());
    orch.add_erp("plain", ConnectorConfig::new("erp-alpha", "Alpha"), 1)
        .await
        .unwrap();
    orch.add_erp("shop", ConnectorConfig::new("storefront", "Shop"), 1)
        .await
        .unwrap();
    let strategy = SyncStrategy::new(SyncKind::Full, vec![EntityKind::Products])
        .resolve_with(ResolutionStrategy::MasterWins)
        .with_master("plain");
    orch.configure_sync_strategy(&"plain".into(), strategy)
        .await
        .unwrap();

    let report = orch.sync_entity(EntityKind::Products).await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.result_for(&"shop".into()).unwrap().written, 1);

    let stored = shop.stored(EntityKind::Products).await;
    assert_eq!(stored["P1"]["variant"]["price"], json!(10.0));
    assert_eq!(stored["P1"]["handle"], json!("SKU-P1"));
}
