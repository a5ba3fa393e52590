//! Subscription health supervisor.
//!
//! A 15s tick that repairs whatever the stream tasks surfaced since the
//! last one. Each tick performs at most one remediation per class, in a
//! fixed order: retry queue, never-alive subscriptions, stalled
//! subscriptions, replicas flagged for resync. Remediations go through the
//! [`SubscriberControl`] seam so the loop is testable against a mock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::exchange::ExchangeClient;
use crate::models::{now_ms, PairKey, Segment};
use crate::orderbook::OrderBookStore;
use crate::stream::SubscriptionRegistry;

/// Supervisor cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(15);

/// A subscription that has not produced (or never produced) an update for
/// this long gets torn down and reopened.
const REMEDIATION_AGE_MS: i64 = 60_000;

/// Subscription actions the supervisor can request.
#[async_trait]
pub trait SubscriberControl: Send + Sync {
    async fn subscribe(&self, symbol: &str, segment: Segment) -> bool;
    async fn subscribe_futures_combined(&self, symbols: Vec<String>) -> bool;
    async fn unsubscribe(&self, key: &PairKey);
}

pub struct HealthSupervisor {
    registry: Arc<SubscriptionRegistry>,
    store: Arc<OrderBookStore>,
    exchange: Arc<ExchangeClient>,
    control: Arc<dyn SubscriberControl>,
    /// Full symbol set, re-sent on every combined-stream retry.
    symbols: Vec<String>,
    retry_delay_ms: i64,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        store: Arc<OrderBookStore>,
        exchange: Arc<ExchangeClient>,
        control: Arc<dyn SubscriberControl>,
        symbols: Vec<String>,
        retry_delay_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            exchange,
            control,
            symbols,
            retry_delay_ms: retry_delay_ms as i64,
        })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // consume the immediate first tick
            loop {
                tick.tick().await;
                self.tick().await;
            }
        })
    }

    /// One supervision pass.
    pub async fn tick(&self) {
        let now = now_ms();
        self.drain_retry_queue(now).await;
        self.remediate_never_alive(now).await;
        self.remediate_stalled(now).await;
        self.run_resync().await;
    }

    /// Retry the oldest failed subscription that is past the backoff delay.
    async fn drain_retry_queue(&self, now: i64) {
        let Some(key) = self.registry.oldest_ready_retry(now, self.retry_delay_ms) else {
            return;
        };
        self.registry.mark_retry(&key, now);

        let entry = self.registry.failed_entry(&key);
        info!(
            pair = %key,
            attempt = entry.as_ref().map(|e| e.retry_count).unwrap_or(0),
            reason = entry.as_ref().map(|e| e.reason.as_str()).unwrap_or(""),
            "retrying failed subscription"
        );

        if key.is_combined() {
            self.control
                .subscribe_futures_combined(self.symbols.clone())
                .await;
        } else {
            self.control.subscribe(&key.symbol, key.segment).await;
        }
    }

    /// Tear down and reopen one subscription that never came alive.
    async fn remediate_never_alive(&self, now: i64) {
        let candidate = self
            .registry
            .statuses()
            .into_iter()
            .find(|(_, s)| !s.is_alive && now - s.subscribed_ms > REMEDIATION_AGE_MS);
        if let Some((key, status)) = candidate {
            warn!(
                pair = %key,
                subscribed_age_s = (now - status.subscribed_ms) / 1000,
                "subscription never came alive, resubscribing"
            );
            self.control.unsubscribe(&key).await;
            self.control.subscribe(&key.symbol, key.segment).await;
        }
    }

    /// Tear down and reopen one alive subscription that stopped updating.
    async fn remediate_stalled(&self, now: i64) {
        let candidate = self
            .registry
            .statuses()
            .into_iter()
            .find(|(_, s)| s.is_alive && now - s.last_update_ms > REMEDIATION_AGE_MS);
        if let Some((key, status)) = candidate {
            warn!(
                pair = %key,
                update_age_s = (now - status.last_update_ms) / 1000,
                "subscription stalled, resubscribing"
            );
            self.control.unsubscribe(&key).await;
            self.control.subscribe(&key.symbol, key.segment).await;
        }
    }

    /// Re-initialize one replica flagged after a gap. The fresh snapshot
    /// replaces the flagged replica wholesale; on fetch failure the flag
    /// stays set and the next tick tries again.
    async fn run_resync(&self) {
        for key in self.store.needs_resync_keys() {
            if !self.store.begin_resync(&key) {
                continue;
            }

            match self.exchange.fetch_depth(&key).await {
                Ok(Some(snapshot)) => {
                    self.store.initialize(&key, &snapshot);
                    info!(
                        pair = %key,
                        last_update_id = snapshot.last_update_id,
                        "replica re-initialized after gap"
                    );
                }
                Ok(None) => {
                    warn!(pair = %key, "no instrument for flagged replica, dropping it");
                    self.store.clear(&key);
                }
                Err(e) => {
                    warn!(pair = %key, error = %e, "resync snapshot fetch failed");
                }
            }

            self.store.finish_resync(&key);
            break; // one resync per tick
        }
    }
}
