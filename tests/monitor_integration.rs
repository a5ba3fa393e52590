//! End-to-end flows across the store, metrics engine, time series and
//! supervision loop, driven through the public API only.

use std::sync::Arc;
use std::time::Duration;

use bookpulse_backend::{
    bus::{BusEvent, EventBus},
    exchange::ExchangeClient,
    metrics::{calc, MetricsEngine},
    models::{Config, PairKey, Segment},
    orderbook::{ApplyOutcome, DepthDiff, DepthSnapshot, OrderBookStore},
    storage::{MetricsWriter, TimeSeriesStore},
    stream::{
        drain_buffer,
        supervisor::{HealthSupervisor, SubscriberControl},
        reason, StreamSubscriber, SubscriptionRegistry,
    },
};

/// Dead endpoints: every REST and websocket attempt fails fast.
fn dead_exchange() -> Arc<ExchangeClient> {
    Arc::new(ExchangeClient::with_bases("http://127.0.0.1:9", "http://127.0.0.1:9").unwrap())
}

#[tokio::test]
async fn spot_updates_flow_into_metrics() {
    let store = Arc::new(OrderBookStore::new());
    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    let key = PairKey::spot("SOLUSDT");

    store.initialize(
        &key,
        &DepthSnapshot::new(
            100,
            vec![(100.0, 2_000.0), (99.9, 2_000.0)],
            vec![(100.1, 2_000.0), (100.2, 2_000.0)],
        ),
    );
    assert_eq!(
        store.apply_diff(
            &key,
            &DepthDiff::new(101, 105, None, vec![(99.95, 1_000.0)], vec![(100.15, 500.0)]),
        ),
        ApplyOutcome::Applied
    );

    let engine = MetricsEngine::new(Arc::clone(&store), bus.clone(), None, 30_000, 30_000);
    let snapshot = engine.compute_now(&key).expect("metrics for fresh replica");

    assert_eq!(snapshot.best_bid, 100.0);
    assert_eq!(snapshot.best_ask, 100.1);
    assert!(snapshot.spread_percent > 0.0);
    assert!(snapshot.bid_depth > 0.0);
    assert!(snapshot.liquidity_score > 0);
    assert_eq!(engine.latest(&key).unwrap().timestamp_ms, snapshot.timestamp_ms);

    // The computation is announced on the bus.
    let mut saw_metrics = false;
    while let Ok(event) = events.try_recv() {
        if let BusEvent::MetricsComputed { key: k, .. } = event {
            assert_eq!(k, key);
            saw_metrics = true;
        }
    }
    assert!(saw_metrics);
}

#[tokio::test]
async fn cadence_limits_time_series_writes() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("metrics.db");
    let ts_store = Arc::new(TimeSeriesStore::open(db_path.to_str().unwrap()).unwrap());
    let writer = MetricsWriter::spawn(Arc::clone(&ts_store));

    let store = Arc::new(OrderBookStore::new());
    let key = PairKey::spot("SOLUSDT");
    store.initialize(
        &key,
        &DepthSnapshot::new(100, vec![(100.0, 50.0)], vec![(100.1, 50.0)]),
    );

    let engine = MetricsEngine::new(
        Arc::clone(&store),
        EventBus::new(16),
        Some(writer.clone()),
        30_000,
        30_000,
    );

    let replica = store.get(&key).unwrap();
    let t0 = 1_700_000_000_000;
    let snap = calc::compute(&key, &replica, t0).unwrap();

    // Three computations inside one interval, one past it.
    assert_eq!(engine.persist_if_due(&snap, t0), (true, true));
    assert_eq!(engine.persist_if_due(&snap, t0 + 5_000), (false, false));
    assert_eq!(engine.persist_if_due(&snap, t0 + 29_999), (false, false));
    assert_eq!(engine.persist_if_due(&snap, t0 + 30_000), (true, true));
    writer.sync().await;

    let core = ts_store.range_core(&key, None, None, 100).unwrap();
    assert_eq!(core.len(), 2);
    let advanced = ts_store.range_advanced(&key, None, None, 100).unwrap();
    assert_eq!(advanced.len(), 2);

    // Written payloads restore canonical records.
    assert_eq!(core[0].best_bid, 100.0);
    assert_eq!(advanced[0].deviation_label, "1.00%");

    let stats = ts_store.stats(&key).unwrap();
    assert_eq!(stats.core_count, 2);
    assert_eq!(stats.advanced_count, 2);
}

#[tokio::test]
async fn buffered_init_protocol_marks_subscription_alive() {
    let store = OrderBookStore::new();
    let registry = SubscriptionRegistry::new();
    let bus = EventBus::new(16);
    let key = PairKey::spot("ADAUSDT");

    // Stream opened before the snapshot: two diffs buffered, then the
    // snapshot lands between them.
    let buffered = vec![
        DepthDiff::new(45, 50, None, vec![(10.0, 2.0)], vec![]),
        DepthDiff::new(56, 60, None, vec![(10.0, 4.0)], vec![]),
    ];
    store.initialize(
        &key,
        &DepthSnapshot::new(55, vec![(10.0, 1.0)], vec![(11.0, 1.0)]),
    );
    registry.set_subscribed(&key, 0);
    registry.enqueue_failure(&key, reason::STREAM_CLOSED);

    let applied = drain_buffer(&store, &registry, &bus, &key, 55, buffered);

    assert_eq!(applied, 1);
    assert_eq!(store.get(&key).unwrap().last_update_id, 60);
    assert!(registry.status(&key).unwrap().is_alive);
    assert!(registry.failed_entry(&key).is_none());
}

#[tokio::test]
async fn failed_subscription_converges_through_supervision() {
    let mut config = Config::default();
    config.init_wait_secs = 0;
    config.reconnect_delay_ms = 0;

    let store = Arc::new(OrderBookStore::new());
    let registry = Arc::new(SubscriptionRegistry::new());
    let subscriber = StreamSubscriber::with_ws_bases(
        config,
        Arc::clone(&store),
        dead_exchange(),
        EventBus::new(16),
        Arc::clone(&registry),
        "ws://127.0.0.1:9",
        "ws://127.0.0.1:9",
    );

    // Initial subscribe fails against the dead endpoint and queues itself.
    let key = PairKey::spot("BTCUSDT");
    assert!(!subscriber.subscribe("BTCUSDT", Segment::Spot).await);
    assert!(registry.failed_entry(&key).is_some());

    let supervisor = HealthSupervisor::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        dead_exchange(),
        Arc::clone(&subscriber) as Arc<dyn SubscriberControl>,
        vec!["BTCUSDT".to_string()],
        0,
    );

    supervisor.tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    supervisor.tick().await;

    // Still down, but supervised: the entry records at least one retry.
    let entry = registry.failed_entry(&key).expect("entry survives retries");
    assert!(entry.retry_count >= 1);
    assert!(!entry.reason.is_empty());

    let status = subscriber.overall_status();
    assert!(status.failed_count >= 1);
    assert!(status.recent_connection_attempts >= 2);
}

#[tokio::test]
async fn futures_gap_is_resynced_by_supervisor_flow() {
    let store = Arc::new(OrderBookStore::new());
    let key = PairKey::futures("ADAUSDT");

    store.initialize(
        &key,
        &DepthSnapshot::new(1_000, vec![(9.0, 1.0)], vec![(10.0, 1.0)]),
    );
    assert!(store
        .apply_diff(&key, &DepthDiff::new(900, 1_010, Some(750), vec![(9.0, 2.0)], vec![]))
        .is_applied());

    // Three continuity misses exhaust the window.
    for expected in [
        ApplyOutcome::NotReady,
        ApplyOutcome::NotReady,
        ApplyOutcome::Gap,
    ] {
        let outcome = store.apply_diff(
            &key,
            &DepthDiff::new(2_000, 2_001, Some(9_999), vec![], vec![]),
        );
        assert_eq!(outcome, expected);
    }
    assert!(store.get(&key).is_none());
    assert_eq!(store.needs_resync_keys(), vec![key.clone()]);

    // The resync path replaces the replica with a fresh snapshot.
    assert!(store.begin_resync(&key));
    store.initialize(
        &key,
        &DepthSnapshot::new(3_000, vec![(9.1, 1.0)], vec![(9.9, 1.0)]),
    );
    store.finish_resync(&key);

    assert!(store.needs_resync_keys().is_empty());
    let replica = store.get(&key).unwrap();
    assert_eq!(replica.last_update_id, 3_000);

    // Post-resync the first-event tolerance applies again.
    assert!(store
        .apply_diff(&key, &DepthDiff::new(2_900, 3_005, Some(2_800), vec![], vec![]))
        .is_applied());
}
