//! Local order-book replicas and validated diff application.
//!
//! One replica per (symbol, segment) pair, owned by the stream task feeding
//! it. Replicas are stored behind `ArcSwap` so readers (metrics, status API)
//! get a consistent snapshot without ever blocking the reader task; every
//! applied diff clones the affected sides, mutates the clone and swaps it in.
//!
//! Sequencing follows the exchange's published bookkeeping rules, which
//! differ by segment:
//! - Spot: a diff is stale when `u <= L`, a gap when `U > L + 1`.
//! - Futures: a diff is stale when `u < L`; the first event after a snapshot
//!   only needs to cover `L + 1`, afterwards each event's `pu` must equal the
//!   previous event's `u`. Isolated continuity misses are absorbed by a small
//!   window before the replica is flagged for resync.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::models::{now_ms, PairKey, Segment};

/// Prices are f64; level lookup treats prices within this distance as equal.
pub const PRICE_EPSILON: f64 = 1e-10;

/// Replicas older than this are unreadable and must not be persisted.
pub const MAX_REPLICA_AGE_MS: i64 = 120_000;

/// Consecutive futures continuity misses tolerated before forcing a resync.
const FUTURES_CONTINUITY_WINDOW: u32 = 3;

/// Updates further than this fraction away from the side's best price are
/// treated as corrupt ticks and dropped.
const MAX_LEVEL_DEVIATION: f64 = 0.50;

#[inline]
pub fn price_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= PRICE_EPSILON
}

// ============================================================================
// Wire types
// ============================================================================

/// Single price level. The exchange sends levels as `["price", "qty"]`
/// string pairs; unparsable values become NaN and are dropped by the
/// sanity filter on application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

impl PriceLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }

    /// Quoted value (price x quantity) at this level.
    #[inline]
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

impl<'de> Deserialize<'de> for PriceLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (price, quantity): (String, String) = Deserialize::deserialize(deserializer)?;
        Ok(PriceLevel {
            price: price.parse().unwrap_or(f64::NAN),
            quantity: quantity.parse().unwrap_or(f64::NAN),
        })
    }
}

impl Serialize for PriceLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&self.price)?;
        tup.serialize_element(&self.quantity)?;
        tup.end()
    }
}

/// REST depth snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    #[serde(alias = "lastUpdateId")]
    pub last_update_id: u64,
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
}

impl DepthSnapshot {
    pub fn new(last_update_id: u64, bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) -> Self {
        Self {
            last_update_id,
            bids: bids.into_iter().map(|(p, q)| PriceLevel::new(p, q)).collect(),
            asks: asks.into_iter().map(|(p, q)| PriceLevel::new(p, q)).collect(),
        }
    }
}

/// Streaming depth diff. `U`/`u` bound the update-id range; futures events
/// additionally carry `pu`, the previous event's `u`.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthDiff {
    #[serde(alias = "s", default)]
    pub symbol: Option<String>,
    #[serde(alias = "U")]
    pub first_update_id: u64,
    #[serde(alias = "u")]
    pub last_update_id: u64,
    #[serde(alias = "pu", default)]
    pub prev_last_update_id: Option<u64>,
    #[serde(alias = "b", default)]
    pub bids: Vec<PriceLevel>,
    #[serde(alias = "a", default)]
    pub asks: Vec<PriceLevel>,
}

impl DepthDiff {
    pub fn new(
        first_update_id: u64,
        last_update_id: u64,
        prev_last_update_id: Option<u64>,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
    ) -> Self {
        Self {
            symbol: None,
            first_update_id,
            last_update_id,
            prev_last_update_id,
            bids: bids.into_iter().map(|(p, q)| PriceLevel::new(p, q)).collect(),
            asks: asks.into_iter().map(|(p, q)| PriceLevel::new(p, q)).collect(),
        }
    }
}

// ============================================================================
// Replica
// ============================================================================

/// Immutable snapshot of one pair's book, swapped atomically on every apply.
#[derive(Debug, Clone, Serialize)]
pub struct BookReplica {
    /// Bids sorted by price descending (best bid first), quantities > 0.
    pub bids: Vec<PriceLevel>,
    /// Asks sorted by price ascending (best ask first), quantities > 0.
    pub asks: Vec<PriceLevel>,
    /// Snapshot id at init, then the `u` of the last applied diff.
    pub last_update_id: u64,
    /// Wall-clock time of the last successful apply (or init).
    pub applied_at_ms: i64,
}

impl BookReplica {
    #[inline]
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    #[inline]
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// Crossed books are invalid and force a resync.
    #[inline]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    #[inline]
    pub fn age_ms(&self, now: i64) -> i64 {
        (now - self.applied_at_ms).max(0)
    }
}

/// Outcome of a diff application attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Diff passed sequencing and was merged into the replica.
    Applied,
    /// Diff predates the replica; dropped without side effects.
    Stale,
    /// Lost updates detected; replica flagged for resync.
    Gap,
    /// No replica has been initialized for this key.
    MissingReplica,
    /// Diff discarded without touching the replica (futures tolerance
    /// window, or first event not yet covering the snapshot).
    NotReady,
}

impl ApplyOutcome {
    #[inline]
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

// ============================================================================
// Per-pair state
// ============================================================================

#[derive(Debug)]
struct PairBook {
    replica: ArcSwap<BookReplica>,
    /// False until the first diff is merged after an initialize.
    first_event_seen: AtomicBool,
    /// Set on gap detection; readers see nothing until re-initialized.
    needs_resync: AtomicBool,
    /// Futures continuity misses since the last applied event.
    continuity_misses: AtomicU32,
    max_levels: usize,
}

impl PairBook {
    fn new(replica: BookReplica, max_levels: usize) -> Self {
        Self {
            replica: ArcSwap::new(Arc::new(replica)),
            first_event_seen: AtomicBool::new(false),
            needs_resync: AtomicBool::new(false),
            continuity_misses: AtomicU32::new(0),
            max_levels,
        }
    }
}

/// Store-level counters, surfaced in the status API.
#[derive(Debug, Default)]
pub struct StoreCounters {
    pub applies: AtomicU64,
    pub stale_drops: AtomicU64,
    pub gaps: AtomicU64,
    pub filtered_levels: AtomicU64,
}

/// Read-only view of one pair's bookkeeping flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairFlags {
    pub first_event_seen: bool,
    pub needs_resync: bool,
}

/// Truncated replica snapshot shaped for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaView {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_update_id: u64,
    pub timestamp_ms: i64,
    pub age_seconds: i64,
}

// ============================================================================
// Store
// ============================================================================

/// Owns every replica, partitioned by pair. Each pair is mutated only by its
/// stream task (or by the resync path, which holds the per-key guard).
pub struct OrderBookStore {
    books: RwLock<HashMap<PairKey, Arc<PairBook>>>,
    /// Pairs with a resync currently in flight, so the supervisor never runs
    /// two initializations for the same key.
    resyncs: Mutex<HashSet<PairKey>>,
    counters: StoreCounters,
}

impl Default for OrderBookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBookStore {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::with_capacity(64)),
            resyncs: Mutex::new(HashSet::new()),
            counters: StoreCounters::default(),
        }
    }

    /// Create (or replace) the replica for `key` from a REST snapshot.
    /// Levels are sanitized and sorted; sequencing state starts fresh.
    pub fn initialize(&self, key: &PairKey, snapshot: &DepthSnapshot) {
        let max_levels = key.max_levels();

        let mut bids: Vec<PriceLevel> = snapshot
            .bids
            .iter()
            .copied()
            .filter(|l| l.price.is_finite() && l.price > 0.0 && l.quantity > 0.0)
            .collect();
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        bids.truncate(max_levels);

        let mut asks: Vec<PriceLevel> = snapshot
            .asks
            .iter()
            .copied()
            .filter(|l| l.price.is_finite() && l.price > 0.0 && l.quantity > 0.0)
            .collect();
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.truncate(max_levels);

        let replica = BookReplica {
            bids,
            asks,
            last_update_id: snapshot.last_update_id,
            applied_at_ms: now_ms(),
        };

        let mut books = self.books.write();
        books.insert(key.clone(), Arc::new(PairBook::new(replica, max_levels)));
    }

    /// Apply a streaming diff, dispatching on the segment's sequencing rules.
    pub fn apply_diff(&self, key: &PairKey, diff: &DepthDiff) -> ApplyOutcome {
        let Some(pair) = self.pair(key) else {
            return ApplyOutcome::MissingReplica;
        };

        // A flagged replica stays frozen until the resync re-initializes it.
        if pair.needs_resync.load(Ordering::Acquire) {
            return ApplyOutcome::Gap;
        }

        match key.segment {
            Segment::Spot => self.apply_spot(key, &pair, diff),
            Segment::Futures => self.apply_futures(key, &pair, diff),
        }
    }

    fn apply_spot(&self, key: &PairKey, pair: &PairBook, diff: &DepthDiff) -> ApplyOutcome {
        let current = pair.replica.load_full();
        let last = current.last_update_id;

        if diff.last_update_id <= last {
            self.counters.stale_drops.fetch_add(1, Ordering::Relaxed);
            return ApplyOutcome::Stale;
        }

        if diff.first_update_id > last + 1 {
            warn!(
                pair = %key,
                last_update_id = last,
                first_update_id = diff.first_update_id,
                "update gap detected, flagging for resync"
            );
            pair.needs_resync.store(true, Ordering::Release);
            self.counters.gaps.fetch_add(1, Ordering::Relaxed);
            return ApplyOutcome::Gap;
        }

        self.merge(key, pair, &current, diff)
    }

    fn apply_futures(&self, key: &PairKey, pair: &PairBook, diff: &DepthDiff) -> ApplyOutcome {
        let current = pair.replica.load_full();
        let last = current.last_update_id;

        if diff.last_update_id < last {
            self.counters.stale_drops.fetch_add(1, Ordering::Relaxed);
            return ApplyOutcome::Stale;
        }

        if !pair.first_event_seen.load(Ordering::Acquire) {
            // The first event after a snapshot may overlap it by any amount;
            // it only has to cover the next expected id.
            let covers = diff.first_update_id <= last + 1 && last + 1 <= diff.last_update_id;
            if !covers {
                pair.continuity_misses.store(0, Ordering::Release);
                return ApplyOutcome::NotReady;
            }
        } else if diff.prev_last_update_id != Some(last) {
            let misses = pair.continuity_misses.fetch_add(1, Ordering::AcqRel) + 1;
            if misses >= FUTURES_CONTINUITY_WINDOW {
                warn!(
                    pair = %key,
                    last_update_id = last,
                    prev_last_update_id = ?diff.prev_last_update_id,
                    misses,
                    "continuity window exhausted, flagging for resync"
                );
                pair.continuity_misses.store(0, Ordering::Release);
                pair.needs_resync.store(true, Ordering::Release);
                self.counters.gaps.fetch_add(1, Ordering::Relaxed);
                return ApplyOutcome::Gap;
            }
            return ApplyOutcome::NotReady;
        }

        self.merge(key, pair, &current, diff)
    }

    /// Merge validated diff levels into a cloned replica and swap it in.
    fn merge(
        &self,
        key: &PairKey,
        pair: &PairBook,
        current: &BookReplica,
        diff: &DepthDiff,
    ) -> ApplyOutcome {
        let mut bids = current.bids.clone();
        let mut asks = current.asks.clone();

        self.apply_side(key, &mut bids, &diff.bids, true);
        self.apply_side(key, &mut asks, &diff.asks, false);

        bids.truncate(pair.max_levels);
        asks.truncate(pair.max_levels);

        let next = BookReplica {
            bids,
            asks,
            last_update_id: diff.last_update_id,
            applied_at_ms: now_ms(),
        };

        if next.is_crossed() {
            warn!(
                pair = %key,
                best_bid = ?next.best_bid(),
                best_ask = ?next.best_ask(),
                "diff produced a crossed book, flagging for resync"
            );
            pair.needs_resync.store(true, Ordering::Release);
            self.counters.gaps.fetch_add(1, Ordering::Relaxed);
            return ApplyOutcome::Gap;
        }

        pair.replica.store(Arc::new(next));
        pair.first_event_seen.store(true, Ordering::Release);
        pair.continuity_misses.store(0, Ordering::Release);
        self.counters.applies.fetch_add(1, Ordering::Relaxed);
        ApplyOutcome::Applied
    }

    /// Apply one side's updates to a sorted level vector.
    fn apply_side(
        &self,
        key: &PairKey,
        levels: &mut Vec<PriceLevel>,
        updates: &[PriceLevel],
        is_bid: bool,
    ) {
        // Anchor for the corrupt-tick guard is the side's best price before
        // this batch; normal volatility stays well inside the band.
        let anchor = levels.first().map(|l| l.price);

        for upd in updates {
            if !upd.price.is_finite()
                || upd.price <= 0.0
                || !upd.quantity.is_finite()
                || upd.quantity < 0.0
            {
                self.counters.filtered_levels.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if let Some(p0) = anchor {
                if (upd.price - p0).abs() / p0 > MAX_LEVEL_DEVIATION {
                    warn!(
                        pair = %key,
                        price = upd.price,
                        best = p0,
                        side = if is_bid { "bid" } else { "ask" },
                        "dropping level far outside the book"
                    );
                    self.counters.filtered_levels.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            apply_level(levels, upd.price, upd.quantity, is_bid);
        }
    }

    /// Fresh replica read. Returns None when the pair is unknown, flagged
    /// for resync, or stale past the zombie threshold.
    pub fn get(&self, key: &PairKey) -> Option<Arc<BookReplica>> {
        let pair = self.pair(key)?;
        if pair.needs_resync.load(Ordering::Acquire) {
            return None;
        }
        let replica = pair.replica.load_full();
        if replica.age_ms(now_ms()) > MAX_REPLICA_AGE_MS {
            return None;
        }
        Some(replica)
    }

    /// Raw replica read for the status surface, ignoring freshness.
    pub fn get_any(&self, key: &PairKey) -> Option<Arc<BookReplica>> {
        Some(self.pair(key)?.replica.load_full())
    }

    /// Top-`depth` levels of a replica, shaped for the status surface.
    pub fn replica_view(&self, key: &PairKey, depth: usize) -> Option<ReplicaView> {
        let replica = self.get_any(key)?;
        let now = now_ms();
        Some(ReplicaView {
            bids: replica.bids.iter().take(depth).copied().collect(),
            asks: replica.asks.iter().take(depth).copied().collect(),
            last_update_id: replica.last_update_id,
            timestamp_ms: replica.applied_at_ms,
            age_seconds: replica.age_ms(now) / 1000,
        })
    }

    pub fn flags(&self, key: &PairKey) -> Option<PairFlags> {
        let pair = self.pair(key)?;
        Some(PairFlags {
            first_event_seen: pair.first_event_seen.load(Ordering::Acquire),
            needs_resync: pair.needs_resync.load(Ordering::Acquire),
        })
    }

    pub fn mark_needs_resync(&self, key: &PairKey) {
        if let Some(pair) = self.pair(key) {
            pair.needs_resync.store(true, Ordering::Release);
        }
    }

    /// Drop the replica entirely. The next `initialize` starts clean.
    pub fn clear(&self, key: &PairKey) {
        self.books.write().remove(key);
    }

    /// Pairs currently flagged for resync, in deterministic order.
    pub fn needs_resync_keys(&self) -> Vec<PairKey> {
        let books = self.books.read();
        let mut keys: Vec<PairKey> = books
            .iter()
            .filter(|(_, pair)| pair.needs_resync.load(Ordering::Acquire))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by(|a, b| (a.segment.as_str(), &a.symbol).cmp(&(b.segment.as_str(), &b.symbol)));
        keys
    }

    /// Claim the resync guard for `key`. Returns false when one is already
    /// in flight.
    pub fn begin_resync(&self, key: &PairKey) -> bool {
        self.resyncs.lock().insert(key.clone())
    }

    pub fn finish_resync(&self, key: &PairKey) {
        self.resyncs.lock().remove(key);
    }

    pub fn resyncs_in_flight(&self) -> Vec<PairKey> {
        let mut keys: Vec<PairKey> = self.resyncs.lock().iter().cloned().collect();
        keys.sort_by(|a, b| (a.segment.as_str(), &a.symbol).cmp(&(b.segment.as_str(), &b.symbol)));
        keys
    }

    pub fn tracked_keys(&self) -> Vec<PairKey> {
        self.books.read().keys().cloned().collect()
    }

    pub fn counters(&self) -> &StoreCounters {
        &self.counters
    }

    fn pair(&self, key: &PairKey) -> Option<Arc<PairBook>> {
        self.books.read().get(key).cloned()
    }

    /// Test hook: rewind a replica's applied-at timestamp.
    #[cfg(test)]
    pub(crate) fn force_applied_at(&self, key: &PairKey, applied_at_ms: i64) {
        if let Some(pair) = self.pair(key) {
            let mut replica = (*pair.replica.load_full()).clone();
            replica.applied_at_ms = applied_at_ms;
            pair.replica.store(Arc::new(replica));
        }
    }
}

/// Set, remove or insert a single level, keeping the side sorted.
fn apply_level(levels: &mut Vec<PriceLevel>, price: f64, quantity: f64, is_bid: bool) {
    let pos = if is_bid {
        // Bids sorted descending
        levels.iter().position(|l| l.price <= price + PRICE_EPSILON)
    } else {
        // Asks sorted ascending
        levels.iter().position(|l| l.price >= price - PRICE_EPSILON)
    };

    match pos {
        Some(i) if price_eq(levels[i].price, price) => {
            if quantity <= 0.0 {
                levels.remove(i);
            } else {
                levels[i].quantity = quantity;
            }
        }
        Some(i) if quantity > 0.0 => {
            levels.insert(i, PriceLevel::new(price, quantity));
        }
        None if quantity > 0.0 => {
            levels.push(PriceLevel::new(price, quantity));
        }
        _ => {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spot_key() -> PairKey {
        PairKey::spot("ADAUSDT")
    }

    fn futures_key() -> PairKey {
        PairKey::futures("ADAUSDT")
    }

    fn levels(side: &[PriceLevel]) -> Vec<(f64, f64)> {
        side.iter().map(|l| (l.price, l.quantity)).collect()
    }

    #[test]
    fn initialize_sorts_and_filters_snapshot() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(
                100,
                vec![(9.0, 1.0), (10.0, 1.0), (9.5, 0.0)],
                vec![(12.0, 2.0), (11.0, 1.0)],
            ),
        );

        let replica = store.get(&key).unwrap();
        assert_eq!(replica.last_update_id, 100);
        assert_eq!(levels(&replica.bids), vec![(10.0, 1.0), (9.0, 1.0)]);
        assert_eq!(levels(&replica.asks), vec![(11.0, 1.0), (12.0, 2.0)]);
    }

    #[test]
    fn spot_happy_path_applies_in_window() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(100, vec![(10.0, 1.0)], vec![(11.0, 1.0)]),
        );

        let outcome = store.apply_diff(
            &key,
            &DepthDiff::new(101, 105, None, vec![(10.0, 2.0)], vec![]),
        );
        assert_eq!(outcome, ApplyOutcome::Applied);

        let replica = store.get(&key).unwrap();
        assert_eq!(replica.last_update_id, 105);
        assert_eq!(levels(&replica.bids), vec![(10.0, 2.0)]);
    }

    #[test]
    fn spot_stale_diff_leaves_replica_untouched() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(100, vec![(10.0, 1.0)], vec![(11.0, 1.0)]),
        );
        store.apply_diff(
            &key,
            &DepthDiff::new(101, 105, None, vec![(10.0, 2.0)], vec![]),
        );

        let before = store.get(&key).unwrap();
        let outcome = store.apply_diff(
            &key,
            &DepthDiff::new(50, 100, None, vec![(10.0, 9.0)], vec![]),
        );
        assert_eq!(outcome, ApplyOutcome::Stale);

        let after = store.get(&key).unwrap();
        assert_eq!(after.last_update_id, 105);
        assert_eq!(levels(&after.bids), levels(&before.bids));
        assert_eq!(levels(&after.asks), levels(&before.asks));
    }

    #[test]
    fn spot_gap_flags_resync_without_applying() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(100, vec![(10.0, 1.0)], vec![(11.0, 1.0)]),
        );
        store.apply_diff(
            &key,
            &DepthDiff::new(101, 105, None, vec![(10.0, 2.0)], vec![]),
        );

        let outcome = store.apply_diff(&key, &DepthDiff::new(200, 210, None, vec![], vec![]));
        assert_eq!(outcome, ApplyOutcome::Gap);
        assert!(store.flags(&key).unwrap().needs_resync);

        // Flagged replicas are unreadable, but the data is intact underneath.
        assert!(store.get(&key).is_none());
        let raw = store.get_any(&key).unwrap();
        assert_eq!(levels(&raw.bids), vec![(10.0, 2.0)]);
        assert_eq!(raw.last_update_id, 105);
    }

    #[test]
    fn futures_first_event_tolerates_overlap() {
        let store = OrderBookStore::new();
        let key = futures_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(1000, vec![(9.0, 1.0)], vec![(10.0, 1.0)]),
        );

        let outcome = store.apply_diff(
            &key,
            &DepthDiff::new(900, 1010, Some(750), vec![(9.0, 2.0)], vec![]),
        );
        assert_eq!(outcome, ApplyOutcome::Applied);

        let replica = store.get(&key).unwrap();
        assert_eq!(replica.last_update_id, 1010);
        assert_eq!(levels(&replica.bids), vec![(9.0, 2.0)]);
    }

    #[test]
    fn futures_first_event_without_coverage_is_discarded() {
        let store = OrderBookStore::new();
        let key = futures_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(1000, vec![(9.0, 1.0)], vec![(10.0, 1.0)]),
        );

        // Covers nothing past the snapshot; dropped without resync.
        let outcome = store.apply_diff(
            &key,
            &DepthDiff::new(1005, 1010, Some(999), vec![(9.0, 5.0)], vec![]),
        );
        assert_eq!(outcome, ApplyOutcome::NotReady);
        assert!(!store.flags(&key).unwrap().needs_resync);
        assert_eq!(store.get(&key).unwrap().last_update_id, 1000);
    }

    #[test]
    fn futures_continuity_window_absorbs_two_misses() {
        let store = OrderBookStore::new();
        let key = futures_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(1000, vec![(9.0, 1.0)], vec![(10.0, 1.0)]),
        );
        assert!(store
            .apply_diff(&key, &DepthDiff::new(900, 1010, Some(750), vec![(9.0, 2.0)], vec![]))
            .is_applied());
        assert!(store
            .apply_diff(&key, &DepthDiff::new(1011, 1012, Some(1010), vec![], vec![]))
            .is_applied());

        let broken = |u: u64| DepthDiff::new(u, u + 1, Some(9999), vec![], vec![]);
        assert_eq!(store.apply_diff(&key, &broken(1013)), ApplyOutcome::NotReady);
        assert_eq!(store.apply_diff(&key, &broken(1015)), ApplyOutcome::NotReady);
        assert!(!store.flags(&key).unwrap().needs_resync);

        assert_eq!(store.apply_diff(&key, &broken(1017)), ApplyOutcome::Gap);
        assert!(store.flags(&key).unwrap().needs_resync);
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn futures_continuity_counter_resets_on_success() {
        let store = OrderBookStore::new();
        let key = futures_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(1000, vec![(9.0, 1.0)], vec![(10.0, 1.0)]),
        );
        assert!(store
            .apply_diff(&key, &DepthDiff::new(900, 1010, Some(750), vec![], vec![]))
            .is_applied());

        let broken = |u: u64| DepthDiff::new(u, u + 1, Some(9999), vec![], vec![]);
        assert_eq!(store.apply_diff(&key, &broken(1013)), ApplyOutcome::NotReady);
        assert_eq!(store.apply_diff(&key, &broken(1015)), ApplyOutcome::NotReady);

        // A continuous event clears the window.
        assert!(store
            .apply_diff(&key, &DepthDiff::new(1011, 1020, Some(1010), vec![], vec![]))
            .is_applied());
        assert_eq!(store.apply_diff(&key, &broken(1021)), ApplyOutcome::NotReady);
        assert!(!store.flags(&key).unwrap().needs_resync);
    }

    #[test]
    fn futures_older_diff_is_dropped_silently() {
        let store = OrderBookStore::new();
        let key = futures_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(1000, vec![(9.0, 1.0)], vec![(10.0, 1.0)]),
        );

        let outcome = store.apply_diff(&key, &DepthDiff::new(500, 600, Some(499), vec![], vec![]));
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(!store.flags(&key).unwrap().needs_resync);
    }

    #[test]
    fn update_ids_only_move_forward() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(&key, &DepthSnapshot::new(10, vec![(10.0, 1.0)], vec![(11.0, 1.0)]));

        let mut last = 10;
        let updates = [(11, 15), (5, 9), (16, 16), (12, 14), (17, 30)];
        for (first, u) in updates {
            store.apply_diff(&key, &DepthDiff::new(first, u, None, vec![], vec![]));
            let replica = store.get(&key).unwrap();
            assert!(replica.last_update_id >= last);
            last = replica.last_update_id;
        }
        assert_eq!(last, 30);
    }

    #[test]
    fn insert_then_remove_restores_level_state() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(100, vec![(10.0, 1.0)], vec![(11.0, 1.0)]),
        );
        let before = levels(&store.get(&key).unwrap().bids);

        assert!(store
            .apply_diff(&key, &DepthDiff::new(101, 101, None, vec![(9.5, 3.0)], vec![]))
            .is_applied());
        assert_eq!(
            levels(&store.get(&key).unwrap().bids),
            vec![(10.0, 1.0), (9.5, 3.0)]
        );

        assert!(store
            .apply_diff(&key, &DepthDiff::new(102, 102, None, vec![(9.5, 0.0)], vec![]))
            .is_applied());
        assert_eq!(levels(&store.get(&key).unwrap().bids), before);
    }

    #[test]
    fn sides_stay_sorted_and_unique() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(
                100,
                vec![(10.0, 1.0), (9.0, 1.0)],
                vec![(11.0, 1.0), (12.0, 1.0)],
            ),
        );
        store.apply_diff(
            &key,
            &DepthDiff::new(
                101,
                110,
                None,
                vec![(9.5, 2.0), (10.0, 3.0), (8.0, 1.0)],
                vec![(11.5, 1.0), (11.0, 0.0), (13.0, 2.0)],
            ),
        );

        let replica = store.get(&key).unwrap();
        for pair in replica.bids.windows(2) {
            assert!(pair[0].price > pair[1].price);
        }
        for pair in replica.asks.windows(2) {
            assert!(pair[0].price < pair[1].price);
        }
        assert!(replica.best_bid().unwrap() < replica.best_ask().unwrap());
        assert!(replica.bids.iter().all(|l| l.quantity > 0.0));
        assert!(replica.asks.iter().all(|l| l.quantity > 0.0));
    }

    #[test]
    fn sides_truncate_to_max_levels() {
        let store = OrderBookStore::new();
        let key = spot_key();
        let bids: Vec<(f64, f64)> = (0..350).map(|i| (1000.0 - i as f64, 1.0)).collect();
        store.initialize(&key, &DepthSnapshot::new(100, bids, vec![(2000.0, 1.0)]));

        let replica = store.get(&key).unwrap();
        assert_eq!(replica.bids.len(), 300);

        // Inserting above the current best keeps the cap.
        store.apply_diff(
            &key,
            &DepthDiff::new(101, 101, None, vec![(1000.5, 1.0)], vec![]),
        );
        let replica = store.get(&key).unwrap();
        assert_eq!(replica.bids.len(), 300);
        assert_eq!(replica.best_bid(), Some(1000.5));
    }

    #[test]
    fn corrupt_levels_are_filtered() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(100, vec![(10.0, 1.0)], vec![(11.0, 1.0)]),
        );

        store.apply_diff(
            &key,
            &DepthDiff::new(
                101,
                110,
                None,
                vec![(f64::NAN, 1.0), (-5.0, 1.0), (2.0, 1.0), (9.9, 1.0)],
                vec![(40.0, 1.0)],
            ),
        );

        let replica = store.get(&key).unwrap();
        // 2.0 is 80% away from best bid 10.0, 40.0 is far above best ask 11.0.
        assert_eq!(levels(&replica.bids), vec![(10.0, 1.0), (9.9, 1.0)]);
        assert_eq!(levels(&replica.asks), vec![(11.0, 1.0)]);
        assert!(store.counters().filtered_levels.load(Ordering::Relaxed) >= 3);
    }

    #[test]
    fn zombie_replica_is_unreadable() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(
            &key,
            &DepthSnapshot::new(100, vec![(10.0, 1.0)], vec![(11.0, 1.0)]),
        );
        assert!(store.get(&key).is_some());

        store.force_applied_at(&key, now_ms() - MAX_REPLICA_AGE_MS - 1_000);
        assert!(store.get(&key).is_none());
        assert!(store.get_any(&key).is_some());
    }

    #[test]
    fn replica_view_truncates_depth() {
        let store = OrderBookStore::new();
        let key = spot_key();
        let bids: Vec<(f64, f64)> = (0..20).map(|i| (100.0 - i as f64, 1.0)).collect();
        let asks: Vec<(f64, f64)> = (0..20).map(|i| (101.0 + i as f64, 1.0)).collect();
        store.initialize(&key, &DepthSnapshot::new(7, bids, asks));

        let view = store.replica_view(&key, 5).unwrap();
        assert_eq!(view.bids.len(), 5);
        assert_eq!(view.asks.len(), 5);
        assert_eq!(view.last_update_id, 7);
        assert_eq!(view.age_seconds, 0);
        assert!(store.replica_view(&PairKey::spot("NOPEUSDT"), 5).is_none());
    }

    #[test]
    fn missing_replica_is_reported() {
        let store = OrderBookStore::new();
        let outcome = store.apply_diff(
            &spot_key(),
            &DepthDiff::new(1, 2, None, vec![], vec![]),
        );
        assert_eq!(outcome, ApplyOutcome::MissingReplica);
    }

    #[test]
    fn resync_guard_is_exclusive() {
        let store = OrderBookStore::new();
        let key = spot_key();
        assert!(store.begin_resync(&key));
        assert!(!store.begin_resync(&key));
        assert_eq!(store.resyncs_in_flight(), vec![key.clone()]);
        store.finish_resync(&key);
        assert!(store.begin_resync(&key));
    }

    #[test]
    fn reinitialize_clears_resync_flag() {
        let store = OrderBookStore::new();
        let key = spot_key();
        store.initialize(&key, &DepthSnapshot::new(100, vec![(10.0, 1.0)], vec![(11.0, 1.0)]));
        store.mark_needs_resync(&key);
        assert!(store.get(&key).is_none());
        assert_eq!(store.needs_resync_keys(), vec![key.clone()]);

        store.initialize(&key, &DepthSnapshot::new(200, vec![(10.0, 1.0)], vec![(11.0, 1.0)]));
        assert!(store.get(&key).is_some());
        assert!(store.needs_resync_keys().is_empty());
    }

    #[test]
    fn diff_parses_exchange_payload() {
        let input = r#"{
            "e": "depthUpdate",
            "E": 1571889248277,
            "s": "BTCUSDT",
            "U": 157,
            "u": 160,
            "pu": 149,
            "b": [["0.0024", "10"]],
            "a": [["0.0026", "100"]]
        }"#;

        let diff: DepthDiff = serde_json::from_str(input).unwrap();
        assert_eq!(diff.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(diff.first_update_id, 157);
        assert_eq!(diff.last_update_id, 160);
        assert_eq!(diff.prev_last_update_id, Some(149));
        assert_eq!(diff.bids, vec![PriceLevel::new(0.0024, 10.0)]);
        assert_eq!(diff.asks, vec![PriceLevel::new(0.0026, 100.0)]);
    }

    #[test]
    fn snapshot_parses_exchange_payload() {
        let input = r#"{
            "lastUpdateId": 1027024,
            "bids": [["4.00000000", "431.00000000"]],
            "asks": [["4.00000200", "12.00000000"]]
        }"#;

        let snap: DepthSnapshot = serde_json::from_str(input).unwrap();
        assert_eq!(snap.last_update_id, 1027024);
        assert_eq!(snap.bids, vec![PriceLevel::new(4.0, 431.0)]);
    }
}
