//! Metrics engine: recompute liquidity on every replica update, coalesced
//! per pair, and persist to the time series at a bounded cadence.
//!
//! The engine never touches the stream reader's path. Updates land as dirty
//! keys; a short-interval drain task recomputes each dirty pair at most once
//! per tick. Persistence goes through the async writer and is fire-and-forget.

pub mod calc;

pub use calc::{
    AdvancedMetricsRecord, CoreMetricsRecord, DeviationDepth, LiquiditySnapshot, SlippageLadder,
    SLIPPAGE_NOTIONALS, SLIPPAGE_SENTINEL,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::bus::{BusEvent, EventBus};
use crate::models::{now_ms, PairKey};
use crate::orderbook::OrderBookStore;
use crate::storage::MetricsWriter;

/// Burst coalescing window per pair.
const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(100);

pub struct MetricsEngine {
    store: Arc<OrderBookStore>,
    bus: EventBus,
    writer: Option<MetricsWriter>,
    dirty: Mutex<HashSet<PairKey>>,
    last_core_write: Mutex<HashMap<PairKey, i64>>,
    last_advanced_write: Mutex<HashMap<PairKey, i64>>,
    latest: RwLock<HashMap<PairKey, Arc<LiquiditySnapshot>>>,
    core_interval_ms: i64,
    advanced_interval_ms: i64,
}

impl MetricsEngine {
    pub fn new(
        store: Arc<OrderBookStore>,
        bus: EventBus,
        writer: Option<MetricsWriter>,
        core_interval_ms: u64,
        advanced_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            writer,
            dirty: Mutex::new(HashSet::new()),
            last_core_write: Mutex::new(HashMap::new()),
            last_advanced_write: Mutex::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            core_interval_ms: core_interval_ms as i64,
            advanced_interval_ms: advanced_interval_ms as i64,
        })
    }

    /// Spawn the bus listener and the debounce drain task.
    pub fn start(self: &Arc<Self>) {
        let listener = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BusEvent::ReplicaUpdated { key }) => listener.mark_dirty(key),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        // Dirty keys coalesce, so lag only costs latency.
                        debug!(skipped, "metrics listener lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let drainer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEBOUNCE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                for key in drainer.take_dirty() {
                    drainer.compute_now(&key);
                }
            }
        });
    }

    /// Queue a pair for recomputation on the next drain tick. Repeated marks
    /// within one tick collapse into a single computation.
    pub fn mark_dirty(&self, key: PairKey) {
        self.dirty.lock().insert(key);
    }

    pub fn take_dirty(&self) -> Vec<PairKey> {
        self.dirty.lock().drain().collect()
    }

    /// Compute, publish and (cadence permitting) persist metrics for a pair.
    /// Skips silently when the replica is unreadable.
    pub fn compute_now(&self, key: &PairKey) -> Option<Arc<LiquiditySnapshot>> {
        let replica = self.store.get(key)?;
        let now = now_ms();
        let snapshot = Arc::new(calc::compute(key, &replica, now)?);

        self.latest
            .write()
            .insert(key.clone(), Arc::clone(&snapshot));
        self.bus.publish(BusEvent::MetricsComputed {
            key: key.clone(),
            snapshot: Arc::clone(&snapshot),
        });

        self.persist_if_due(&snapshot, now);
        Some(snapshot)
    }

    /// Write core/advanced records when their per-pair interval has elapsed.
    /// Returns which classes were written, which keeps the cadence testable.
    pub fn persist_if_due(&self, snapshot: &LiquiditySnapshot, now: i64) -> (bool, bool) {
        let key = &snapshot.key;

        let core_due = {
            let mut last = self.last_core_write.lock();
            match last.get(key) {
                Some(&at) if now - at < self.core_interval_ms => false,
                _ => {
                    last.insert(key.clone(), now);
                    true
                }
            }
        };
        let advanced_due = {
            let mut last = self.last_advanced_write.lock();
            match last.get(key) {
                Some(&at) if now - at < self.advanced_interval_ms => false,
                _ => {
                    last.insert(key.clone(), now);
                    true
                }
            }
        };

        if let Some(writer) = &self.writer {
            if core_due {
                writer.record_core(key.clone(), snapshot.core_record());
            }
            if advanced_due {
                writer.record_advanced(key.clone(), snapshot.advanced_record());
            }
        } else if core_due || advanced_due {
            warn!(pair = %key, "metrics write skipped, time-series store offline");
        }

        (core_due, advanced_due)
    }

    /// Most recent snapshot for a pair, for the status surface.
    pub fn latest(&self, key: &PairKey) -> Option<Arc<LiquiditySnapshot>> {
        self.latest.read().get(key).cloned()
    }
}
