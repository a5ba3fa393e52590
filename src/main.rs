//! bookpulse - live order-book liquidity monitor.
//!
//! Boot order matters: storage first (best-effort), then the metrics
//! engine on the bus, then one spot stream per pair with 1s spacing, then
//! the combined futures stream, and finally the health supervisor that
//! keeps all of it alive.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bookpulse_backend::{
    bus::EventBus,
    exchange::ExchangeClient,
    metrics::MetricsEngine,
    models::{Config, Segment},
    orderbook::OrderBookStore,
    storage::{MetricsWriter, TimeSeriesStore},
    stream::{
        supervisor::{HealthSupervisor, SubscriberControl},
        StreamSubscriber, SubscriptionRegistry,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 bookpulse starting");
    let config = Config::from_env();

    // Time-series storage is best-effort; the monitor runs without it.
    let writer = match TimeSeriesStore::open(&config.db_path) {
        Ok(store) => Some(MetricsWriter::spawn(Arc::new(store))),
        Err(e) => {
            warn!(error = %e, "time-series store unavailable, metrics will not persist");
            None
        }
    };

    let store = Arc::new(OrderBookStore::new());
    let bus = EventBus::default();
    let exchange = Arc::new(ExchangeClient::new()?);
    let registry = Arc::new(SubscriptionRegistry::new());

    let subscriber = StreamSubscriber::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&exchange),
        bus.clone(),
        Arc::clone(&registry),
    );

    let metrics_engine = MetricsEngine::new(
        Arc::clone(&store),
        bus.clone(),
        writer.clone(),
        config.core_save_interval_ms,
        config.advanced_save_interval_ms,
    );
    metrics_engine.start();

    let pairs = resolve_pairs(&config, &exchange).await;
    info!(?pairs, "tracking pairs");

    for symbol in &pairs {
        if !subscriber.subscribe(symbol, Segment::Spot).await {
            warn!(symbol = %symbol, "spot subscription not ready, queued for retry");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    if !subscriber.subscribe_futures_combined(pairs.clone()).await {
        warn!("combined futures stream not ready, queued for retry");
    }

    let supervisor = HealthSupervisor::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&exchange),
        Arc::clone(&subscriber) as Arc<dyn SubscriberControl>,
        pairs,
        config.reconnect_delay_ms,
    );
    let supervisor_task = supervisor.spawn();

    info!("✅ bookpulse running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    supervisor_task.abort();
    subscriber.shutdown().await;
    if let Some(writer) = writer {
        writer.sync().await;
    }
    info!("👋 bookpulse stopped");
    Ok(())
}

/// Fixed pair list, or the top-N USDT pairs by 24h volume when configured.
async fn resolve_pairs(config: &Config, exchange: &Arc<ExchangeClient>) -> Vec<String> {
    let Some(n) = config.top_pairs else {
        return config.pairs.clone();
    };

    match exchange.fetch_top_volumes().await {
        Ok(rows) => {
            let top: Vec<String> = rows
                .into_iter()
                .filter(|r| r.symbol.ends_with("USDT"))
                .take(n)
                .map(|r| r.symbol)
                .collect();
            if top.is_empty() {
                warn!("volume ranking came back empty, using configured pairs");
                config.pairs.clone()
            } else {
                top
            }
        }
        Err(e) => {
            warn!(error = %e, "volume ranking unavailable, using configured pairs");
            config.pairs.clone()
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookpulse_backend=info,bookpulse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
