//! Shared domain types and runtime configuration.

use std::env;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Pairs tracked at 500 book levels instead of 300. These also use the tight
/// deviation ladder for depth-at-deviation metrics.
pub const MAJOR_PAIRS: [&str; 2] = ["BTCUSDT", "ETHUSDT"];

/// Symbol used for the synthetic retry-queue key covering the combined
/// futures stream as a whole.
pub const COMBINED_SYMBOL: &str = "combined";

/// Wall-clock milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Exchange market segment. Spot and linear perpetual futures use different
/// REST paths, stream endpoints and diff-continuity rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    Spot,
    Futures,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Spot => "spot",
            Segment::Futures => "futures",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one tracked order book: upper-case symbol plus segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub symbol: String,
    pub segment: Segment,
}

impl PairKey {
    pub fn new(symbol: impl Into<String>, segment: Segment) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            segment,
        }
    }

    pub fn spot(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Segment::Spot)
    }

    pub fn futures(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Segment::Futures)
    }

    /// Synthetic key representing the combined futures stream in the retry
    /// queue. It never has a replica of its own.
    pub fn combined_futures() -> Self {
        Self {
            symbol: COMBINED_SYMBOL.to_string(),
            segment: Segment::Futures,
        }
    }

    pub fn is_combined(&self) -> bool {
        self.symbol == COMBINED_SYMBOL && self.segment == Segment::Futures
    }

    pub fn is_major(&self) -> bool {
        MAJOR_PAIRS.contains(&self.symbol.as_str())
    }

    /// Book depth retained per side for this pair.
    pub fn max_levels(&self) -> usize {
        if self.is_major() {
            500
        } else {
            300
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.symbol)
    }
}

/// Runtime configuration, read from the environment with sane defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed symbol list (upper-case). Ignored when `top_pairs` is set.
    pub pairs: Vec<String>,
    /// Select the top-N pairs by 24h volume at boot instead of `pairs`.
    pub top_pairs: Option<usize>,
    /// Depth stream cadence: "100ms", "500ms" (futures only) or "1000ms".
    pub update_interval: String,
    /// Minimum wait between retry-queue attempts for the same key.
    pub reconnect_delay_ms: u64,
    /// Client-initiated keep-alive ping cadence.
    pub ping_interval_ms: u64,
    /// Sliding-window admission threshold for new stream connections.
    pub max_connections_per_minute: usize,
    /// Minimum interval between core time-series writes per pair.
    pub core_save_interval_ms: u64,
    /// Minimum interval between advanced time-series writes per pair.
    pub advanced_save_interval_ms: u64,
    /// SQLite path for the metrics time series.
    pub db_path: String,
    /// How long `subscribe` waits for a readable replica before giving up.
    pub init_wait_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pairs: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
                "XRPUSDT".to_string(),
            ],
            top_pairs: None,
            update_interval: "1000ms".to_string(),
            reconnect_delay_ms: 5_000,
            ping_interval_ms: 30_000,
            max_connections_per_minute: 50,
            core_save_interval_ms: 30_000,
            advanced_save_interval_ms: 30_000,
            db_path: "bookpulse_metrics.db".to_string(),
            init_wait_secs: 30,
        }
    }
}

impl Config {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("BOOKPULSE_PAIRS") {
            let pairs: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !pairs.is_empty() {
                cfg.pairs = pairs;
            }
        }
        if let Ok(v) = env::var("BOOKPULSE_TOP_PAIRS") {
            cfg.top_pairs = v.parse().ok().filter(|&n| n > 0);
        }
        if let Ok(v) = env::var("BOOKPULSE_UPDATE_INTERVAL") {
            cfg.update_interval = v;
        }
        if let Ok(v) = env::var("BOOKPULSE_RECONNECT_DELAY_MS") {
            cfg.reconnect_delay_ms = v.parse().unwrap_or(cfg.reconnect_delay_ms);
        }
        if let Ok(v) = env::var("BOOKPULSE_PING_INTERVAL_MS") {
            cfg.ping_interval_ms = v.parse().unwrap_or(cfg.ping_interval_ms);
        }
        if let Ok(v) = env::var("BOOKPULSE_MAX_CONNECTIONS_PER_MINUTE") {
            cfg.max_connections_per_minute =
                v.parse().unwrap_or(cfg.max_connections_per_minute);
        }
        if let Ok(v) = env::var("BOOKPULSE_CORE_SAVE_INTERVAL_MS") {
            cfg.core_save_interval_ms = v.parse().unwrap_or(cfg.core_save_interval_ms);
        }
        if let Ok(v) = env::var("BOOKPULSE_ADVANCED_SAVE_INTERVAL_MS") {
            cfg.advanced_save_interval_ms =
                v.parse().unwrap_or(cfg.advanced_save_interval_ms);
        }
        if let Ok(v) = env::var("BOOKPULSE_DB_PATH") {
            cfg.db_path = v;
        }
        if let Ok(v) = env::var("BOOKPULSE_INIT_WAIT_SECS") {
            cfg.init_wait_secs = v.parse().unwrap_or(cfg.init_wait_secs);
        }

        cfg
    }
}
