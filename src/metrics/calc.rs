//! Pure liquidity computations over a book replica.
//!
//! Everything here is side-effect free; the engine decides when to run it
//! and what to do with the result.

use serde::{Deserialize, Serialize};

use crate::models::PairKey;
use crate::orderbook::{BookReplica, PriceLevel};

/// Returned when the book cannot absorb the requested notional.
pub const SLIPPAGE_SENTINEL: f64 = 999.0;

/// Notionals (USDT) the slippage ladder is evaluated at.
pub const SLIPPAGE_NOTIONALS: [f64; 5] =
    [100_000.0, 300_000.0, 500_000.0, 1_000_000.0, 5_000_000.0];

/// Band around the touch used for the headline bid/ask depth figures.
const DEPTH_WINDOW: f64 = 0.001;

/// Deviation ladders for depth-at-deviation, as fractions of mid.
const MAJOR_DEVIATIONS: [f64; 3] = [0.0003, 0.0005, 0.0010];
const MINOR_DEVIATIONS: [f64; 3] = [0.0030, 0.0050, 0.0100];

const MAJOR_DEVIATION_LABEL: &str = "0.10%";
const MINOR_DEVIATION_LABEL: &str = "1.00%";

/// Slippage (percent of touch) for the standard notional ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlippageLadder {
    pub n100k: f64,
    pub n300k: f64,
    pub n500k: f64,
    pub n1m: f64,
    pub n5m: f64,
}

/// Cumulative quoted value within one deviation of mid, both sides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviationDepth {
    pub deviation: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
}

/// Full result of one metrics computation.
#[derive(Debug, Clone, Serialize)]
pub struct LiquiditySnapshot {
    pub key: PairKey,
    pub timestamp_ms: i64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid_price: f64,
    pub spread_percent: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub buy_slippage: SlippageLadder,
    pub sell_slippage: SlippageLadder,
    pub deviation_depths: Vec<DeviationDepth>,
    pub deviation_label: &'static str,
    pub impact_cost_100k: f64,
    pub imbalance: f64,
    pub liquidity_score: u32,
}

/// Core record persisted to the time series. Field names are shortened on
/// disk; deserializing restores the canonical names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreMetricsRecord {
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "sp")]
    pub spread_percent: f64,
    #[serde(rename = "td")]
    pub total_depth: f64,
    #[serde(rename = "bd")]
    pub bid_depth: f64,
    #[serde(rename = "ad")]
    pub ask_depth: f64,
    #[serde(rename = "s1")]
    pub slippage_100k: f64,
    #[serde(rename = "s10")]
    pub slippage_1m: f64,
    #[serde(rename = "ls")]
    pub liquidity_score: u32,
    #[serde(rename = "im")]
    pub imbalance: f64,
    #[serde(rename = "mp")]
    pub mid_price: f64,
    #[serde(rename = "bb")]
    pub best_bid: f64,
    #[serde(rename = "ba")]
    pub best_ask: f64,
}

/// Advanced record persisted to the time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedMetricsRecord {
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "bd")]
    pub bid_depth: f64,
    #[serde(rename = "ad")]
    pub ask_depth: f64,
    #[serde(rename = "ic")]
    pub impact_cost_avg: f64,
    #[serde(rename = "dvb")]
    pub depth_deviation_bid: f64,
    #[serde(rename = "dva")]
    pub depth_deviation_ask: f64,
    #[serde(rename = "bb")]
    pub best_bid: f64,
    #[serde(rename = "ba")]
    pub best_ask: f64,
    #[serde(rename = "dl")]
    pub deviation_label: String,
}

impl LiquiditySnapshot {
    pub fn core_record(&self) -> CoreMetricsRecord {
        CoreMetricsRecord {
            timestamp_ms: self.timestamp_ms,
            spread_percent: self.spread_percent,
            total_depth: self.bid_depth + self.ask_depth,
            bid_depth: self.bid_depth,
            ask_depth: self.ask_depth,
            slippage_100k: self.buy_slippage.n100k,
            slippage_1m: self.buy_slippage.n1m,
            liquidity_score: self.liquidity_score,
            imbalance: self.imbalance,
            mid_price: self.mid_price,
            best_bid: self.best_bid,
            best_ask: self.best_ask,
        }
    }

    pub fn advanced_record(&self) -> AdvancedMetricsRecord {
        // The labeled deviation is the widest rung of the active ladder.
        let labeled = self.deviation_depths.last().copied().unwrap_or(DeviationDepth {
            deviation: 0.0,
            bid_depth: 0.0,
            ask_depth: 0.0,
        });
        AdvancedMetricsRecord {
            timestamp_ms: self.timestamp_ms,
            bid_depth: self.bid_depth,
            ask_depth: self.ask_depth,
            impact_cost_avg: self.impact_cost_100k,
            depth_deviation_bid: labeled.bid_depth,
            depth_deviation_ask: labeled.ask_depth,
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            deviation_label: self.deviation_label.to_string(),
        }
    }
}

/// Compute the full metric set for one replica. None when either side of
/// the book is empty.
pub fn compute(key: &PairKey, replica: &BookReplica, timestamp_ms: i64) -> Option<LiquiditySnapshot> {
    let best_bid = replica.best_bid()?;
    let best_ask = replica.best_ask()?;
    let mid_price = (best_bid + best_ask) / 2.0;
    let spread_percent = (best_ask - best_bid) / best_bid * 100.0;

    let bid_depth = depth_to_price(&replica.bids, true, best_bid * (1.0 - DEPTH_WINDOW));
    let ask_depth = depth_to_price(&replica.asks, false, best_ask * (1.0 + DEPTH_WINDOW));

    let buy_slippage = slippage_ladder(&replica.asks);
    let sell_slippage = slippage_ladder(&replica.bids);

    let deviations: &[f64] = if key.is_major() {
        &MAJOR_DEVIATIONS
    } else {
        &MINOR_DEVIATIONS
    };
    let deviation_depths = deviations
        .iter()
        .map(|&d| DeviationDepth {
            deviation: d,
            bid_depth: depth_to_price(&replica.bids, true, mid_price * (1.0 - d)),
            ask_depth: depth_to_price(&replica.asks, false, mid_price * (1.0 + d)),
        })
        .collect();

    let impact_cost_100k =
        (buy_slippage.n100k + sell_slippage.n100k.abs()) / 2.0 / 100.0;
    let imbalance = imbalance(bid_depth, ask_depth);
    let liquidity_score = liquidity_score(bid_depth + ask_depth, spread_percent);

    Some(LiquiditySnapshot {
        key: key.clone(),
        timestamp_ms,
        best_bid,
        best_ask,
        mid_price,
        spread_percent,
        bid_depth,
        ask_depth,
        buy_slippage,
        sell_slippage,
        deviation_depths,
        deviation_label: if key.is_major() {
            MAJOR_DEVIATION_LABEL
        } else {
            MINOR_DEVIATION_LABEL
        },
        impact_cost_100k,
        imbalance,
        liquidity_score,
    })
}

/// Cumulative quoted value from the touch to `limit_price` inclusive.
pub fn depth_to_price(levels: &[PriceLevel], is_bid: bool, limit_price: f64) -> f64 {
    let mut total = 0.0;
    for level in levels {
        let inside = if is_bid {
            level.price >= limit_price
        } else {
            level.price <= limit_price
        };
        if !inside {
            break;
        }
        total += level.notional();
    }
    total
}

/// Walk one side of the book consuming `notional` USDT of quoted value.
/// Returns the percentage move of the volume-weighted fill price versus the
/// touch, or the sentinel when the book is too thin.
pub fn slippage_for_notional(levels: &[PriceLevel], notional: f64) -> f64 {
    let Some(best) = levels.first().map(|l| l.price) else {
        return SLIPPAGE_SENTINEL;
    };

    let mut remaining = notional;
    let mut filled_value = 0.0;
    let mut filled_qty = 0.0;

    for level in levels {
        let take = remaining.min(level.notional());
        filled_value += take;
        filled_qty += take / level.price;
        remaining -= take;
        if remaining <= 0.0 {
            break;
        }
    }

    if remaining > 0.0 || filled_qty <= 0.0 {
        return SLIPPAGE_SENTINEL;
    }

    let avg_price = filled_value / filled_qty;
    (avg_price - best) / best * 100.0
}

fn slippage_ladder(levels: &[PriceLevel]) -> SlippageLadder {
    SlippageLadder {
        n100k: slippage_for_notional(levels, SLIPPAGE_NOTIONALS[0]),
        n300k: slippage_for_notional(levels, SLIPPAGE_NOTIONALS[1]),
        n500k: slippage_for_notional(levels, SLIPPAGE_NOTIONALS[2]),
        n1m: slippage_for_notional(levels, SLIPPAGE_NOTIONALS[3]),
        n5m: slippage_for_notional(levels, SLIPPAGE_NOTIONALS[4]),
    }
}

/// Depth-minus-spread composite clamped to 0..=100.
pub fn liquidity_score(total_depth: f64, spread_percent: f64) -> u32 {
    let depth_term = 70.0 * (total_depth / 1_000_000.0).min(1.0);
    let spread_term = 30.0 * (1.0 - spread_percent / 0.05).max(0.0);
    (depth_term + spread_term).round().min(100.0).max(0.0) as u32
}

/// Signed bid/ask depth imbalance in [-1, 1].
pub fn imbalance(bid_depth: f64, ask_depth: f64) -> f64 {
    let total = bid_depth + ask_depth;
    if total <= 0.0 {
        0.0
    } else {
        (bid_depth - ask_depth) / total
    }
}
