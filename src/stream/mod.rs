//! Depth-stream subscription engine.
//!
//! One WebSocket per spot pair, one combined stream for the whole futures
//! set. Each connection task owns the exchange's initialization protocol:
//! open the stream, buffer diffs while the REST snapshot is in flight,
//! initialize the replica, replay the buffer gap-safe, then apply live.
//! A subscription is "alive" once its first diff lands; it stops being
//! alive on close, and recovery is the supervisor's job, never an inline
//! reconnect.
//!
//! Shared bookkeeping (retry queue, per-pair status) lives in
//! [`SubscriptionRegistry`], a pair of mutex-guarded tables read by the
//! supervisor and the status surface.

pub mod supervisor;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventBus};
use crate::exchange::{ExchangeClient, ExchangeError};
use crate::models::{now_ms, Config, PairKey, Segment};
use crate::orderbook::{ApplyOutcome, DepthDiff, OrderBookStore};
use crate::stream::supervisor::SubscriberControl;

pub const SPOT_WS_BASE: &str = "wss://stream.binance.com:9443";
pub const FUTURES_WS_BASE: &str = "wss://fstream.binance.com";

/// Exchange cap on substreams per combined connection.
const MAX_COMBINED_STREAMS: usize = 1024;

/// Spacing between sequential snapshot fetches during combined init.
const COMBINED_SNAPSHOT_SPACING: Duration = Duration::from_millis(500);

/// Poll cadence while waiting for a subscription to become readable.
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Admission-control window for new connection attempts.
const ADMISSION_WINDOW_MS: i64 = 60_000;

/// Retry-queue reasons, shared with the supervisor and status surface.
pub mod reason {
    pub const CONNECTION_RATE_LIMIT: &str = "connection rate limit";
    pub const RATE_LIMITED_SNAPSHOT: &str = "rate-limited snapshot";
    pub const SNAPSHOT_HTTP_ERROR: &str = "snapshot http error";
    pub const WS_TRANSPORT_ERROR: &str = "ws transport error";
    pub const INIT_TIMEOUT: &str = "init timeout";
    pub const STREAM_CLOSED: &str = "stream closed";
}

/// Build the depth stream name for a symbol at the configured cadence.
/// The exchange's default cadence carries no suffix; 500ms only exists on
/// futures. Unknown intervals fall back to the default with a warning.
pub fn stream_name(symbol: &str, segment: Segment, update_interval: &str) -> String {
    let sym = symbol.to_lowercase();
    match (update_interval, segment) {
        ("1000ms", _) => format!("{sym}@depth"),
        ("100ms", _) => format!("{sym}@depth@100ms"),
        ("500ms", Segment::Futures) => format!("{sym}@depth@500ms"),
        _ => {
            warn!(
                symbol,
                update_interval, "unsupported depth interval, using default cadence"
            );
            format!("{sym}@depth")
        }
    }
}

// ============================================================================
// Registry tables
// ============================================================================

/// Retry-queue entry for a failed subscription (or the combined stream).
#[derive(Debug, Clone, Serialize)]
pub struct FailedEntry {
    pub retry_count: u32,
    pub first_failed_ms: i64,
    pub last_retry_ms: i64,
    pub reason: String,
}

/// Liveness record for one subscription.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubscriptionStatus {
    pub is_alive: bool,
    pub last_update_ms: i64,
    pub subscribed_ms: i64,
}

/// Status row shaped for the external facade.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub key: PairKey,
    pub is_alive: bool,
    pub age_seconds: i64,
    pub subscription_age_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallStatus {
    pub active_connections: usize,
    pub recent_connection_attempts: usize,
    pub connection_limit: usize,
    pub failed_count: usize,
    pub failed: Vec<(PairKey, FailedEntry)>,
    pub resyncs_in_progress: Vec<PairKey>,
}

/// Retry queue and subscription-status map, shared between the stream tasks
/// and the supervisor.
#[derive(Default)]
pub struct SubscriptionRegistry {
    retry: Mutex<HashMap<PairKey, FailedEntry>>,
    statuses: Mutex<HashMap<PairKey, SubscriptionStatus>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or refresh) a retry-queue entry. A fresh entry is immediately
    /// eligible for the supervisor's next tick.
    pub fn enqueue_failure(&self, key: &PairKey, why: &str) {
        let now = now_ms();
        let mut retry = self.retry.lock();
        retry
            .entry(key.clone())
            .and_modify(|e| e.reason = why.to_string())
            .or_insert(FailedEntry {
                retry_count: 0,
                first_failed_ms: now,
                last_retry_ms: 0,
                reason: why.to_string(),
            });
    }

    pub fn remove_failed(&self, key: &PairKey) -> bool {
        self.retry.lock().remove(key).is_some()
    }

    /// Record a retry attempt issued by the supervisor.
    pub fn mark_retry(&self, key: &PairKey, now: i64) {
        if let Some(entry) = self.retry.lock().get_mut(key) {
            entry.retry_count += 1;
            entry.last_retry_ms = now;
        }
    }

    /// Oldest entry whose last retry is at least `min_delay_ms` ago.
    pub fn oldest_ready_retry(&self, now: i64, min_delay_ms: i64) -> Option<PairKey> {
        let retry = self.retry.lock();
        retry
            .iter()
            .filter(|(_, e)| now - e.last_retry_ms >= min_delay_ms)
            .min_by(|(ka, ea), (kb, eb)| {
                (ea.last_retry_ms, ea.first_failed_ms, &ka.symbol)
                    .cmp(&(eb.last_retry_ms, eb.first_failed_ms, &kb.symbol))
            })
            .map(|(key, _)| key.clone())
    }

    pub fn failed(&self) -> Vec<(PairKey, FailedEntry)> {
        let mut entries: Vec<_> = self
            .retry
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| {
            (a.segment.as_str(), &a.symbol).cmp(&(b.segment.as_str(), &b.symbol))
        });
        entries
    }

    pub fn failed_entry(&self, key: &PairKey) -> Option<FailedEntry> {
        self.retry.lock().get(key).cloned()
    }

    /// Fresh status record for a just-initialized subscription.
    pub fn set_subscribed(&self, key: &PairKey, now: i64) {
        self.statuses.lock().insert(
            key.clone(),
            SubscriptionStatus {
                is_alive: false,
                last_update_ms: now,
                subscribed_ms: now,
            },
        );
    }

    /// First applied diff on the current connection.
    pub fn mark_alive(&self, key: &PairKey, now: i64) {
        let mut statuses = self.statuses.lock();
        let entry = statuses.entry(key.clone()).or_insert(SubscriptionStatus {
            is_alive: false,
            last_update_ms: now,
            subscribed_ms: now,
        });
        entry.is_alive = true;
        entry.last_update_ms = now;
    }

    pub fn touch_update(&self, key: &PairKey, now: i64) {
        if let Some(entry) = self.statuses.lock().get_mut(key) {
            entry.last_update_ms = now;
        }
    }

    pub fn mark_closed(&self, key: &PairKey) {
        if let Some(entry) = self.statuses.lock().get_mut(key) {
            entry.is_alive = false;
        }
    }

    pub fn remove_status(&self, key: &PairKey) {
        self.statuses.lock().remove(key);
    }

    pub fn status(&self, key: &PairKey) -> Option<SubscriptionStatus> {
        self.statuses.lock().get(key).copied()
    }

    pub fn statuses(&self) -> Vec<(PairKey, SubscriptionStatus)> {
        let mut entries: Vec<_> = self
            .statuses
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), *s))
            .collect();
        entries.sort_by(|(a, _), (b, _)| {
            (a.segment.as_str(), &a.symbol).cmp(&(b.segment.as_str(), &b.symbol))
        });
        entries
    }
}

// ============================================================================
// Diff application shared by live and buffered paths
// ============================================================================

/// Apply one streamed diff and maintain liveness bookkeeping. `alive` is the
/// connection-local flag; the first Applied flips it, marks the status row
/// alive and clears any retry entry for the key.
fn apply_stream_diff(
    store: &OrderBookStore,
    registry: &SubscriptionRegistry,
    bus: &EventBus,
    key: &PairKey,
    diff: &DepthDiff,
    alive: &mut bool,
) -> ApplyOutcome {
    let outcome = store.apply_diff(key, diff);
    match outcome {
        ApplyOutcome::Applied => {
            let now = now_ms();
            if !*alive {
                *alive = true;
                registry.mark_alive(key, now);
                registry.remove_failed(key);
            } else {
                registry.touch_update(key, now);
            }
            bus.publish(BusEvent::ReplicaUpdated { key: key.clone() });
        }
        ApplyOutcome::Gap => {
            debug!(pair = %key, "gap during stream apply, replica flagged for resync");
        }
        ApplyOutcome::Stale | ApplyOutcome::NotReady | ApplyOutcome::MissingReplica => {}
    }
    outcome
}

/// Replay diffs buffered while the snapshot was in flight. Anything the
/// snapshot already covers is discarded; the rest goes through the normal
/// apply path, so the first survivor flips the subscription alive.
/// Returns how many diffs were applied.
pub fn drain_buffer(
    store: &OrderBookStore,
    registry: &SubscriptionRegistry,
    bus: &EventBus,
    key: &PairKey,
    snapshot_last_id: u64,
    buffered: Vec<DepthDiff>,
) -> usize {
    let mut alive = registry.status(key).map(|s| s.is_alive).unwrap_or(false);
    let mut applied = 0;
    for diff in buffered {
        if diff.last_update_id <= snapshot_last_id {
            continue;
        }
        if apply_stream_diff(store, registry, bus, key, &diff, &mut alive).is_applied() {
            applied += 1;
        }
    }
    applied
}

// ============================================================================
// Subscriber
// ============================================================================

struct ConnCtx {
    key: PairKey,
    url: String,
    ping_interval: Duration,
    store: Arc<OrderBookStore>,
    exchange: Arc<ExchangeClient>,
    bus: EventBus,
    registry: Arc<SubscriptionRegistry>,
}

struct CombinedCtx {
    combined_key: PairKey,
    symbols: Vec<String>,
    url: String,
    ping_interval: Duration,
    initialized: Arc<Mutex<HashSet<String>>>,
    store: Arc<OrderBookStore>,
    exchange: Arc<ExchangeClient>,
    bus: EventBus,
    registry: Arc<SubscriptionRegistry>,
}

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
struct CombinedEnvelope {
    stream: String,
    data: DepthDiff,
}

pub struct StreamSubscriber {
    config: Config,
    spot_ws_base: String,
    futures_ws_base: String,
    store: Arc<OrderBookStore>,
    exchange: Arc<ExchangeClient>,
    bus: EventBus,
    registry: Arc<SubscriptionRegistry>,
    connections: Mutex<HashMap<PairKey, JoinHandle<()>>>,
    /// Connection-attempt timestamps inside the admission window.
    attempts: Mutex<VecDeque<i64>>,
}

impl StreamSubscriber {
    pub fn new(
        config: Config,
        store: Arc<OrderBookStore>,
        exchange: Arc<ExchangeClient>,
        bus: EventBus,
        registry: Arc<SubscriptionRegistry>,
    ) -> Arc<Self> {
        Self::with_ws_bases(config, store, exchange, bus, registry, SPOT_WS_BASE, FUTURES_WS_BASE)
    }

    pub fn with_ws_bases(
        config: Config,
        store: Arc<OrderBookStore>,
        exchange: Arc<ExchangeClient>,
        bus: EventBus,
        registry: Arc<SubscriptionRegistry>,
        spot_ws_base: impl Into<String>,
        futures_ws_base: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            spot_ws_base: spot_ws_base.into(),
            futures_ws_base: futures_ws_base.into(),
            store,
            exchange,
            bus,
            registry,
            connections: Mutex::new(HashMap::new()),
            attempts: Mutex::new(VecDeque::with_capacity(64)),
        })
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Open one depth stream for a pair and wait for its replica to become
    /// readable. Failures land in the retry queue; the caller gets a bool.
    pub async fn subscribe(&self, symbol: &str, segment: Segment) -> bool {
        let key = PairKey::new(symbol, segment);

        if !self.admission_allows() {
            warn!(pair = %key, "connection attempts exhausted for this window");
            self.registry
                .enqueue_failure(&key, reason::CONNECTION_RATE_LIMIT);
            return false;
        }

        self.close_connection(&key);

        let name = stream_name(&key.symbol, segment, &self.config.update_interval);
        let url = format!("{}/ws/{}", self.ws_base(segment), name);
        let ctx = ConnCtx {
            key: key.clone(),
            url,
            ping_interval: Duration::from_millis(self.config.ping_interval_ms),
            store: Arc::clone(&self.store),
            exchange: Arc::clone(&self.exchange),
            bus: self.bus.clone(),
            registry: Arc::clone(&self.registry),
        };
        let task = tokio::spawn(run_single_pair(ctx));
        self.connections.lock().insert(key.clone(), task);

        self.wait_until_readable(std::slice::from_ref(&key), &key).await
    }

    /// Open the combined futures stream covering every symbol, initializing
    /// each replica sequentially. Ready once any symbol is readable.
    pub async fn subscribe_futures_combined(&self, symbols: Vec<String>) -> bool {
        let combined_key = PairKey::combined_futures();

        if !self.admission_allows() {
            warn!("connection attempts exhausted for this window (combined stream)");
            self.registry
                .enqueue_failure(&combined_key, reason::CONNECTION_RATE_LIMIT);
            return false;
        }

        self.close_connection(&combined_key);

        let mut symbols: Vec<String> = symbols.into_iter().map(|s| s.to_uppercase()).collect();
        if symbols.len() > MAX_COMBINED_STREAMS {
            warn!(
                requested = symbols.len(),
                cap = MAX_COMBINED_STREAMS,
                "combined stream capped at exchange limit"
            );
            symbols.truncate(MAX_COMBINED_STREAMS);
        }
        if symbols.is_empty() {
            return false;
        }

        let names: Vec<String> = symbols
            .iter()
            .map(|s| stream_name(s, Segment::Futures, &self.config.update_interval))
            .collect();
        let url = format!("{}/stream?streams={}", self.futures_ws_base, names.join("/"));

        let ctx = CombinedCtx {
            combined_key: combined_key.clone(),
            symbols: symbols.clone(),
            url,
            ping_interval: Duration::from_millis(self.config.ping_interval_ms),
            initialized: Arc::new(Mutex::new(HashSet::new())),
            store: Arc::clone(&self.store),
            exchange: Arc::clone(&self.exchange),
            bus: self.bus.clone(),
            registry: Arc::clone(&self.registry),
        };
        let task = tokio::spawn(run_combined(ctx));
        self.connections.lock().insert(combined_key.clone(), task);

        let keys: Vec<PairKey> = symbols.iter().map(PairKey::futures).collect();
        self.wait_until_readable(&keys, &combined_key).await
    }

    /// Tear down the connection for a key. Buffered diffs die with the task.
    pub fn close_connection(&self, key: &PairKey) {
        if let Some(task) = self.connections.lock().remove(key) {
            task.abort();
        }
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<(PairKey, JoinHandle<()>)> = self.connections.lock().drain().collect();
        for (key, task) in tasks {
            task.abort();
            self.registry.mark_closed(&key);
        }
        info!("all depth streams closed");
    }

    pub fn failed_subscriptions(&self) -> Vec<(PairKey, FailedEntry)> {
        self.registry.failed()
    }

    pub fn subscription_statuses(&self) -> Vec<StatusRow> {
        let now = now_ms();
        self.registry
            .statuses()
            .into_iter()
            .map(|(key, s)| StatusRow {
                key,
                is_alive: s.is_alive,
                age_seconds: (now - s.last_update_ms).max(0) / 1000,
                subscription_age_seconds: (now - s.subscribed_ms).max(0) / 1000,
            })
            .collect()
    }

    pub fn overall_status(&self) -> OverallStatus {
        let failed = self.registry.failed();
        OverallStatus {
            active_connections: self
                .connections
                .lock()
                .values()
                .filter(|t| !t.is_finished())
                .count(),
            recent_connection_attempts: self.recent_attempts(),
            connection_limit: self.config.max_connections_per_minute,
            failed_count: failed.len(),
            failed,
            resyncs_in_progress: self.store.resyncs_in_flight(),
        }
    }

    pub fn recent_attempts(&self) -> usize {
        let now = now_ms();
        let mut attempts = self.attempts.lock();
        while attempts
            .front()
            .is_some_and(|&at| at < now - ADMISSION_WINDOW_MS)
        {
            attempts.pop_front();
        }
        attempts.len()
    }

    /// Sliding-window admission check; records the attempt when allowed.
    fn admission_allows(&self) -> bool {
        let now = now_ms();
        let mut attempts = self.attempts.lock();
        while attempts
            .front()
            .is_some_and(|&at| at < now - ADMISSION_WINDOW_MS)
        {
            attempts.pop_front();
        }
        if attempts.len() >= self.config.max_connections_per_minute {
            return false;
        }
        attempts.push_back(now);
        true
    }

    fn ws_base(&self, segment: Segment) -> &str {
        match segment {
            Segment::Spot => &self.spot_ws_base,
            Segment::Futures => &self.futures_ws_base,
        }
    }

    /// Poll until any of `keys` has a readable replica, up to the init
    /// deadline. On timeout the retry entry goes in under `enqueue_key`.
    async fn wait_until_readable(&self, keys: &[PairKey], enqueue_key: &PairKey) -> bool {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.init_wait_secs);
        loop {
            if keys.iter().any(|k| self.store.get(k).is_some()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pair = %enqueue_key, "no readable replica before init deadline");
                self.registry
                    .enqueue_failure(enqueue_key, reason::INIT_TIMEOUT);
                return false;
            }
            sleep(INIT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl SubscriberControl for StreamSubscriber {
    async fn subscribe(&self, symbol: &str, segment: Segment) -> bool {
        StreamSubscriber::subscribe(self, symbol, segment).await
    }

    async fn subscribe_futures_combined(&self, symbols: Vec<String>) -> bool {
        StreamSubscriber::subscribe_futures_combined(self, symbols).await
    }

    async fn unsubscribe(&self, key: &PairKey) {
        self.close_connection(key);
        self.registry.mark_closed(key);
        self.registry.remove_status(key);
    }
}

// ============================================================================
// Connection tasks
// ============================================================================

/// Classify a snapshot failure into a retry-queue reason.
fn snapshot_failure_reason(err: &ExchangeError) -> &'static str {
    match err {
        ExchangeError::Banned | ExchangeError::RateLimited { .. } => {
            reason::RATE_LIMITED_SNAPSHOT
        }
        _ => reason::SNAPSHOT_HTTP_ERROR,
    }
}

async fn run_single_pair(ctx: ConnCtx) {
    info!(pair = %ctx.key, url = %ctx.url, "opening depth stream");

    let (ws, _) = match connect_async(&ctx.url).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(pair = %ctx.key, error = %e, "depth stream failed to open");
            ctx.registry
                .enqueue_failure(&ctx.key, reason::WS_TRANSPORT_ERROR);
            ctx.bus.publish(BusEvent::SubscriberError {
                key: ctx.key.clone(),
                reason: reason::WS_TRANSPORT_ERROR.to_string(),
            });
            return;
        }
    };

    let (mut write, mut read) = ws.split();
    let mut ping = interval(ctx.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut buffer: Vec<DepthDiff> = Vec::new();
    let mut snapshot_ready = false;
    let mut alive = false;

    let snap_key = ctx.key.clone();
    let snap_exchange = Arc::clone(&ctx.exchange);
    let mut snapshot_task =
        tokio::spawn(async move { snap_exchange.fetch_depth(&snap_key).await });

    loop {
        tokio::select! {
            res = &mut snapshot_task, if !snapshot_ready => {
                match res {
                    Ok(Ok(Some(snapshot))) => {
                        let last_id = snapshot.last_update_id;
                        ctx.store.initialize(&ctx.key, &snapshot);
                        ctx.registry.set_subscribed(&ctx.key, now_ms());
                        let buffered = std::mem::take(&mut buffer);
                        let replayed = buffered.len();
                        let applied = drain_buffer(
                            &ctx.store,
                            &ctx.registry,
                            &ctx.bus,
                            &ctx.key,
                            last_id,
                            buffered,
                        );
                        alive = ctx
                            .registry
                            .status(&ctx.key)
                            .map(|s| s.is_alive)
                            .unwrap_or(false);
                        snapshot_ready = true;
                        info!(
                            pair = %ctx.key,
                            last_update_id = last_id,
                            buffered = replayed,
                            applied,
                            "replica initialized from snapshot"
                        );
                    }
                    Ok(Ok(None)) => {
                        warn!(pair = %ctx.key, "no instrument for subscribed symbol, closing stream");
                        ctx.registry
                            .enqueue_failure(&ctx.key, reason::SNAPSHOT_HTTP_ERROR);
                        return;
                    }
                    Ok(Err(e)) => {
                        let why = snapshot_failure_reason(&e);
                        warn!(pair = %ctx.key, error = %e, "snapshot fetch failed, closing stream");
                        ctx.registry.enqueue_failure(&ctx.key, why);
                        ctx.bus.publish(BusEvent::SubscriberError {
                            key: ctx.key.clone(),
                            reason: why.to_string(),
                        });
                        return;
                    }
                    Err(e) => {
                        warn!(pair = %ctx.key, error = %e, "snapshot task aborted");
                        ctx.registry
                            .enqueue_failure(&ctx.key, reason::SNAPSHOT_HTTP_ERROR);
                        return;
                    }
                }
            }

            _ = ping.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DepthDiff>(&text) {
                            Ok(diff) => {
                                if !snapshot_ready {
                                    buffer.push(diff);
                                } else {
                                    apply_stream_diff(
                                        &ctx.store,
                                        &ctx.registry,
                                        &ctx.bus,
                                        &ctx.key,
                                        &diff,
                                        &mut alive,
                                    );
                                }
                            }
                            Err(e) => debug!(pair = %ctx.key, error = %e, "unparseable stream payload"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(pair = %ctx.key, ?frame, "depth stream closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(pair = %ctx.key, error = %e, "depth stream transport error");
                        ctx.registry.mark_closed(&ctx.key);
                        ctx.registry
                            .enqueue_failure(&ctx.key, reason::WS_TRANSPORT_ERROR);
                        ctx.bus.publish(BusEvent::SubscriberError {
                            key: ctx.key.clone(),
                            reason: reason::WS_TRANSPORT_ERROR.to_string(),
                        });
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    // Normal close: surface it and let the supervisor reconnect.
    ctx.registry.mark_closed(&ctx.key);
    ctx.registry
        .enqueue_failure(&ctx.key, reason::STREAM_CLOSED);
    ctx.bus.publish(BusEvent::SubscriberError {
        key: ctx.key.clone(),
        reason: reason::STREAM_CLOSED.to_string(),
    });
}

async fn run_combined(ctx: CombinedCtx) {
    info!(
        symbols = ctx.symbols.len(),
        url = %ctx.url,
        "opening combined futures stream"
    );

    let (ws, _) = match connect_async(&ctx.url).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(error = %e, "combined futures stream failed to open");
            ctx.registry
                .enqueue_failure(&ctx.combined_key, reason::WS_TRANSPORT_ERROR);
            ctx.bus.publish(BusEvent::SubscriberError {
                key: ctx.combined_key.clone(),
                reason: reason::WS_TRANSPORT_ERROR.to_string(),
            });
            return;
        }
    };

    let (mut write, mut read) = ws.split();
    let mut ping = interval(ctx.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Snapshots are fetched one by one while the socket keeps draining, so
    // early symbols go live while later ones are still initializing.
    let init_symbols = ctx.symbols.clone();
    let init_store = Arc::clone(&ctx.store);
    let init_exchange = Arc::clone(&ctx.exchange);
    let init_registry = Arc::clone(&ctx.registry);
    let init_set = Arc::clone(&ctx.initialized);
    let mut init_task = tokio::spawn(async move {
        for symbol in init_symbols {
            let key = PairKey::futures(&symbol);
            match init_exchange.fetch_futures_depth(&symbol).await {
                Ok(Some(snapshot)) => {
                    init_store.initialize(&key, &snapshot);
                    init_registry.set_subscribed(&key, now_ms());
                    init_set.lock().insert(symbol.clone());
                    debug!(pair = %key, last_update_id = snapshot.last_update_id, "futures replica initialized");
                }
                Ok(None) => {
                    warn!(symbol = %symbol, "skipping symbol with no futures instrument");
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "futures snapshot fetch failed");
                }
            }
            sleep(COMBINED_SNAPSHOT_SPACING).await;
        }
    });
    let mut init_done = false;

    // Per-symbol liveness for first-Applied bookkeeping.
    let mut alive: HashMap<String, bool> = HashMap::new();
    let mut any_alive = false;

    loop {
        tokio::select! {
            _ = &mut init_task, if !init_done => {
                init_done = true;
            }

            _ = ping.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = match serde_json::from_str::<CombinedEnvelope>(&text) {
                            Ok(env) => env,
                            Err(e) => {
                                debug!(error = %e, "unparseable combined payload");
                                continue;
                            }
                        };
                        let symbol = envelope
                            .data
                            .symbol
                            .clone()
                            .unwrap_or_else(|| {
                                envelope
                                    .stream
                                    .split('@')
                                    .next()
                                    .unwrap_or_default()
                                    .to_uppercase()
                            })
                            .to_uppercase();

                        if !ctx.initialized.lock().contains(&symbol) {
                            continue;
                        }

                        let key = PairKey::futures(&symbol);
                        let flag = alive.entry(symbol).or_insert(false);
                        let outcome = apply_stream_diff(
                            &ctx.store,
                            &ctx.registry,
                            &ctx.bus,
                            &key,
                            &envelope.data,
                            flag,
                        );
                        if outcome.is_applied() && !any_alive {
                            any_alive = true;
                            ctx.registry.remove_failed(&ctx.combined_key);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "combined futures stream closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "combined futures stream transport error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    init_task.abort();
    for symbol in &ctx.symbols {
        ctx.registry.mark_closed(&PairKey::futures(symbol));
    }
    ctx.registry
        .enqueue_failure(&ctx.combined_key, reason::STREAM_CLOSED);
    ctx.bus.publish(BusEvent::SubscriberError {
        key: ctx.combined_key.clone(),
        reason: reason::STREAM_CLOSED.to_string(),
    });
}

// ============================================================================
// Tests
// ============================================================================
