//! Time-series persistence for computed liquidity metrics.
//!
//! Append-only SQLite store keyed by `class:segment:symbol`. Records are
//! stored as JSON payloads under short field aliases; the read path hands
//! back typed records with canonical names. Rows age out after 30 days and
//! a series that stops writing for 31 days is dropped wholesale.
//!
//! Writes from the hot path go through [`MetricsWriter`], a bounded queue
//! drained by a dedicated task, so a slow disk can never stall a stream
//! reader. Overflow drops the write, not the stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::metrics::{AdvancedMetricsRecord, CoreMetricsRecord};
use crate::models::{now_ms, PairKey};

/// Rows older than this are pruned.
pub const RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Idle series older than this are dropped entirely.
pub const SERIES_TTL_MS: i64 = 31 * 24 * 60 * 60 * 1000;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const WRITER_QUEUE_DEPTH: usize = 1024;

const SCHEMA_SQL: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA temp_store=MEMORY;

CREATE TABLE IF NOT EXISTS metric_points (
    series  TEXT NOT NULL,
    ts      INTEGER NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metric_points_series_ts
    ON metric_points(series, ts);

CREATE TABLE IF NOT EXISTS series_activity (
    series        TEXT PRIMARY KEY,
    last_write_ms INTEGER NOT NULL
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricClass {
    Core,
    Advanced,
}

impl MetricClass {
    fn as_str(&self) -> &'static str {
        match self {
            MetricClass::Core => "core",
            MetricClass::Advanced => "advanced",
        }
    }
}

fn series_id(class: MetricClass, key: &PairKey) -> String {
    format!("{}:{}:{}", class.as_str(), key.segment, key.symbol)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesStats {
    pub core_count: u64,
    pub advanced_count: u64,
    /// (first, last) timestamp across both classes, None when empty.
    pub time_range: Option<(i64, i64)>,
}

#[derive(Debug, Clone)]
pub struct RecentMetrics {
    pub core: Vec<CoreMetricsRecord>,
    pub advanced: Option<Vec<AdvancedMetricsRecord>>,
}

/// SQLite-backed metrics time series.
pub struct TimeSeriesStore {
    conn: Arc<Mutex<Connection>>,
}

impl TimeSeriesStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open metrics database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize metrics schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let points: i64 = conn
            .query_row("SELECT COUNT(*) FROM metric_points", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, points, "metrics time series opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn append_core(&self, key: &PairKey, record: &CoreMetricsRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.append(series_id(MetricClass::Core, key), record.timestamp_ms, payload)
    }

    pub fn append_advanced(&self, key: &PairKey, record: &AdvancedMetricsRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.append(
            series_id(MetricClass::Advanced, key),
            record.timestamp_ms,
            payload,
        )
    }

    fn append(&self, series: String, ts: i64, payload: String) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("INSERT INTO metric_points (series, ts, payload) VALUES (?1, ?2, ?3)")?
            .execute(params![series, ts, payload])?;
        conn.prepare_cached(
            "INSERT INTO series_activity (series, last_write_ms) VALUES (?1, ?2)
             ON CONFLICT(series) DO UPDATE SET last_write_ms = excluded.last_write_ms",
        )?
        .execute(params![series, now_ms()])?;
        Ok(())
    }

    /// Core records in `[start, end]`, time ascending, at most `limit`.
    pub fn range_core(
        &self,
        key: &PairKey,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<CoreMetricsRecord>> {
        self.range(series_id(MetricClass::Core, key), start_ms, end_ms, limit)
    }

    pub fn range_advanced(
        &self,
        key: &PairKey,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<AdvancedMetricsRecord>> {
        self.range(series_id(MetricClass::Advanced, key), start_ms, end_ms, limit)
    }

    fn range<T: serde::de::DeserializeOwned>(
        &self,
        series: String,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM metric_points
             WHERE series = ?1 AND ts >= ?2 AND ts <= ?3
             ORDER BY ts ASC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                series,
                start_ms.unwrap_or(i64::MIN),
                end_ms.unwrap_or(i64::MAX),
                limit as i64
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut records = Vec::new();
        for payload in rows {
            match serde_json::from_str(&payload?) {
                Ok(record) => records.push(record),
                Err(e) => warn!(series = %series, error = %e, "dropping unreadable metric row"),
            }
        }
        Ok(records)
    }

    /// Latest `count` records, time ascending. Advanced records ride along
    /// when asked for.
    pub fn recent(
        &self,
        key: &PairKey,
        count: usize,
        include_advanced: bool,
    ) -> Result<RecentMetrics> {
        let core = self.recent_class(series_id(MetricClass::Core, key), count)?;
        let advanced = if include_advanced {
            Some(self.recent_class(series_id(MetricClass::Advanced, key), count)?)
        } else {
            None
        };
        Ok(RecentMetrics { core, advanced })
    }

    fn recent_class<T: serde::de::DeserializeOwned>(
        &self,
        series: String,
        count: usize,
    ) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM metric_points
             WHERE series = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![series, count as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for payload in rows {
            match serde_json::from_str(&payload?) {
                Ok(record) => records.push(record),
                Err(e) => warn!(series = %series, error = %e, "dropping unreadable metric row"),
            }
        }
        records.reverse();
        Ok(records)
    }

    pub fn stats(&self, key: &PairKey) -> Result<SeriesStats> {
        let conn = self.conn.lock();
        let count_for = |series: String| -> Result<u64> {
            let n: i64 = conn
                .prepare_cached("SELECT COUNT(*) FROM metric_points WHERE series = ?1")?
                .query_row(params![series], |row| row.get(0))?;
            Ok(n as u64)
        };

        let core_series = series_id(MetricClass::Core, key);
        let advanced_series = series_id(MetricClass::Advanced, key);
        let core_count = count_for(core_series.clone())?;
        let advanced_count = count_for(advanced_series.clone())?;

        let time_range: Option<(i64, i64)> = conn
            .prepare_cached(
                "SELECT MIN(ts), MAX(ts) FROM metric_points WHERE series IN (?1, ?2)",
            )?
            .query_row(params![core_series, advanced_series], |row| {
                let min: Option<i64> = row.get(0)?;
                let max: Option<i64> = row.get(1)?;
                Ok(min.zip(max))
            })?;

        Ok(SeriesStats {
            core_count,
            advanced_count,
            time_range,
        })
    }

    /// Enforce retention: drop rows past the 30-day horizon and series idle
    /// past the 31-day TTL. Returns (rows pruned, series expired).
    pub fn prune(&self, now: i64) -> Result<(usize, usize)> {
        let conn = self.conn.lock();

        let rows = conn
            .prepare_cached("DELETE FROM metric_points WHERE ts < ?1")?
            .execute(params![now - RETENTION_MS])?;

        let expired: Vec<String> = {
            let mut stmt = conn
                .prepare_cached("SELECT series FROM series_activity WHERE last_write_ms < ?1")?;
            let found = stmt
                .query_map(params![now - SERIES_TTL_MS], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            found
        };

        for series in &expired {
            conn.prepare_cached("DELETE FROM metric_points WHERE series = ?1")?
                .execute(params![series])?;
            conn.prepare_cached("DELETE FROM series_activity WHERE series = ?1")?
                .execute(params![series])?;
        }

        if rows > 0 || !expired.is_empty() {
            debug!(rows, expired = expired.len(), "pruned metrics time series");
        }
        Ok((rows, expired.len()))
    }
}

// ============================================================================
// Async writer
// ============================================================================

enum WriteJob {
    Core(PairKey, CoreMetricsRecord),
    Advanced(PairKey, AdvancedMetricsRecord),
    Sync(oneshot::Sender<()>),
}

/// Fire-and-forget handle feeding the writer task.
#[derive(Clone)]
pub struct MetricsWriter {
    tx: mpsc::Sender<WriteJob>,
}

impl MetricsWriter {
    pub fn spawn(store: Arc<TimeSeriesStore>) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        tokio::spawn(run_writer(store, rx));
        Self { tx }
    }

    /// Non-blocking; drops the record when the queue is full.
    pub fn record_core(&self, key: PairKey, record: CoreMetricsRecord) {
        if self.tx.try_send(WriteJob::Core(key, record)).is_err() {
            debug!("metrics writer queue full, dropping core record");
        }
    }

    pub fn record_advanced(&self, key: PairKey, record: AdvancedMetricsRecord) {
        if self.tx.try_send(WriteJob::Advanced(key, record)).is_err() {
            debug!("metrics writer queue full, dropping advanced record");
        }
    }

    /// Wait until every previously queued write has been applied.
    pub async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriteJob::Sync(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

async fn run_writer(store: Arc<TimeSeriesStore>, mut rx: mpsc::Receiver<WriteJob>) {
    let mut prune_tick = tokio::time::interval(PRUNE_INTERVAL);
    prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            job = rx.recv() => {
                match job {
                    Some(WriteJob::Core(key, record)) => {
                        if let Err(e) = store.append_core(&key, &record) {
                            warn!(pair = %key, error = %e, "failed to persist core metrics");
                        }
                    }
                    Some(WriteJob::Advanced(key, record)) => {
                        if let Err(e) = store.append_advanced(&key, &record) {
                            warn!(pair = %key, error = %e, "failed to persist advanced metrics");
                        }
                    }
                    Some(WriteJob::Sync(ack)) => {
                        let _ = ack.send(());
                    }
                    None => break,
                }
            }
            _ = prune_tick.tick() => {
                if let Err(e) = store.prune(now_ms()) {
                    warn!(error = %e, "metrics prune failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, TimeSeriesStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let store = TimeSeriesStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn core_record(ts: i64) -> CoreMetricsRecord {
        CoreMetricsRecord {
            timestamp_ms: ts,
            spread_percent: 0.01,
            total_depth: 2_000_000.0,
            bid_depth: 1_000_000.0,
            ask_depth: 1_000_000.0,
            slippage_100k: 0.002,
            slippage_1m: 0.02,
            liquidity_score: 94,
            imbalance: 0.0,
            mid_price: 100.05,
            best_bid: 100.0,
            best_ask: 100.1,
        }
    }

    fn advanced_record(ts: i64) -> AdvancedMetricsRecord {
        AdvancedMetricsRecord {
            timestamp_ms: ts,
            bid_depth: 1_000_000.0,
            ask_depth: 1_000_000.0,
            impact_cost_avg: 0.0001,
            depth_deviation_bid: 1_500_000.0,
            depth_deviation_ask: 1_400_000.0,
            best_bid: 100.0,
            best_ask: 100.1,
            deviation_label: "0.10%".to_string(),
        }
    }

    #[test]
    fn appends_round_trip_in_time_order() {
        let (_dir, store) = temp_store();
        let key = PairKey::spot("BTCUSDT");

        for ts in [3_000, 1_000, 2_000] {
            store.append_core(&key, &core_record(ts)).unwrap();
        }

        let records = store.range_core(&key, None, None, 100).unwrap();
        let times: Vec<i64> = records.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(times, vec![1_000, 2_000, 3_000]);
        assert_eq!(records[0], core_record(1_000));
    }

    #[test]
    fn ranges_respect_bounds_and_limit() {
        let (_dir, store) = temp_store();
        let key = PairKey::futures("ETHUSDT");

        for ts in (0..10).map(|i| i * 1_000) {
            store.append_core(&key, &core_record(ts)).unwrap();
        }

        let mid = store.range_core(&key, Some(2_000), Some(6_000), 100).unwrap();
        assert_eq!(mid.len(), 5);
        assert_eq!(mid.first().unwrap().timestamp_ms, 2_000);
        assert_eq!(mid.last().unwrap().timestamp_ms, 6_000);

        let capped = store.range_core(&key, None, None, 3).unwrap();
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[0].timestamp_ms, 0);
    }

    #[test]
    fn series_are_isolated_by_key_and_class() {
        let (_dir, store) = temp_store();
        let spot = PairKey::spot("BTCUSDT");
        let futures = PairKey::futures("BTCUSDT");

        store.append_core(&spot, &core_record(1_000)).unwrap();
        store.append_advanced(&spot, &advanced_record(1_000)).unwrap();

        assert_eq!(store.range_core(&spot, None, None, 10).unwrap().len(), 1);
        assert!(store.range_core(&futures, None, None, 10).unwrap().is_empty());
        assert_eq!(store.range_advanced(&spot, None, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn recent_returns_latest_ascending() {
        let (_dir, store) = temp_store();
        let key = PairKey::spot("SOLUSDT");

        for ts in (0..10).map(|i| i * 1_000) {
            store.append_core(&key, &core_record(ts)).unwrap();
            store.append_advanced(&key, &advanced_record(ts)).unwrap();
        }

        let recent = store.recent(&key, 3, true).unwrap();
        let times: Vec<i64> = recent.core.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(times, vec![7_000, 8_000, 9_000]);
        assert_eq!(recent.advanced.unwrap().len(), 3);

        let core_only = store.recent(&key, 3, false).unwrap();
        assert!(core_only.advanced.is_none());
    }

    #[test]
    fn stats_count_both_classes() {
        let (_dir, store) = temp_store();
        let key = PairKey::spot("SOLUSDT");

        store.append_core(&key, &core_record(1_000)).unwrap();
        store.append_core(&key, &core_record(5_000)).unwrap();
        store.append_advanced(&key, &advanced_record(3_000)).unwrap();

        let stats = store.stats(&key).unwrap();
        assert_eq!(stats.core_count, 2);
        assert_eq!(stats.advanced_count, 1);
        assert_eq!(stats.time_range, Some((1_000, 5_000)));

        let empty = store.stats(&PairKey::spot("ADAUSDT")).unwrap();
        assert_eq!(empty.time_range, None);
    }

    #[test]
    fn prune_drops_old_rows_and_idle_series() {
        let (_dir, store) = temp_store();
        let key = PairKey::spot("BTCUSDT");
        let now = now_ms();

        store.append_core(&key, &core_record(now - RETENTION_MS - 1_000)).unwrap();
        store.append_core(&key, &core_record(now)).unwrap();

        let (rows, expired) = store.prune(now).unwrap();
        assert_eq!(rows, 1);
        assert_eq!(expired, 0);
        assert_eq!(store.range_core(&key, None, None, 10).unwrap().len(), 1);

        // Push the series' last activity past the TTL: everything goes.
        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE series_activity SET last_write_ms = ?1",
                params![now - SERIES_TTL_MS - 1_000],
            )
            .unwrap();
        }
        let (_, expired) = store.prune(now).unwrap();
        assert_eq!(expired, 1);
        assert!(store.range_core(&key, None, None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn writer_applies_queued_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let store = Arc::new(TimeSeriesStore::open(path.to_str().unwrap()).unwrap());
        let writer = MetricsWriter::spawn(Arc::clone(&store));
        let key = PairKey::spot("BTCUSDT");

        writer.record_core(key.clone(), core_record(1_000));
        writer.record_advanced(key.clone(), advanced_record(1_000));
        writer.sync().await;

        assert_eq!(store.range_core(&key, None, None, 10).unwrap().len(), 1);
        assert_eq!(store.range_advanced(&key, None, None, 10).unwrap().len(), 1);
    }
}
