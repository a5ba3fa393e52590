//! Exchange REST client.
//!
//! Depth snapshots and 24h ticker volumes, with process-wide request-weight
//! accounting and the exchange's ban/rate-limit signaling:
//! - HTTP 418 latches a banned flag; every call fails fast until an explicit
//!   operator reset. Streams are unaffected.
//! - HTTP 429 sets a paused-until instant from the `Retry-After` header;
//!   calls fail fast until it elapses.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{now_ms, PairKey, Segment};
use crate::orderbook::DepthSnapshot;

pub const SPOT_REST_BASE: &str = "https://api.binance.com";
pub const FUTURES_REST_BASE: &str = "https://fapi.binance.com";

/// Server-reported weight consumed in the current minute.
const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";

/// Request weights: a 500-level depth costs 10, a 100-level depth costs 5,
/// a full 24h ticker costs 40.
const DEPTH_WEIGHT_DEEP: u32 = 10;
const DEPTH_WEIGHT_SHALLOW: u32 = 5;
const TICKER_WEIGHT: u32 = 40;

/// Published per-minute weight ceiling; we only warn as we approach it, the
/// hard stop comes from the server's 429.
const WEIGHT_LIMIT_1M: u32 = 6_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RATE_LIMIT_PAUSE_MS: i64 = 60_000;

/// Error code the futures API returns for symbols with no instrument.
const CODE_INVALID_SYMBOL: &str = "-1121";

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("banned by exchange (HTTP 418), operator reset required")]
    Banned,
    #[error("rate limited, paused until {until_ms}")]
    RateLimited { until_ms: i64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Merged 24h volume row used for top-N pair selection.
#[derive(Debug, Clone)]
pub struct TickerVolume {
    pub symbol: String,
    pub spot_volume: f64,
    pub futures_volume: f64,
    pub price_change_percent: f64,
}

#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
    #[serde(alias = "quoteVolume", default)]
    quote_volume: String,
    #[serde(alias = "priceChangePercent", default)]
    price_change_percent: String,
}

#[derive(Debug)]
struct ClientState {
    banned: bool,
    paused_until_ms: i64,
    /// Minute bucket the weight counter belongs to (epoch minutes).
    weight_minute: i64,
    used_weight_1m: u32,
}

/// Process-wide REST client. Cheap to clone callers share it via `Arc`.
pub struct ExchangeClient {
    http: reqwest::Client,
    spot_base: String,
    futures_base: String,
    state: Mutex<ClientState>,
}

impl ExchangeClient {
    pub fn new() -> Result<Self, ExchangeError> {
        Self::with_bases(SPOT_REST_BASE, FUTURES_REST_BASE)
    }

    /// Construct against alternate base URLs (mirror hosts, tests).
    pub fn with_bases(
        spot_base: impl Into<String>,
        futures_base: impl Into<String>,
    ) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ExchangeError::Transport(format!("failed to build client: {e}")))?;

        Ok(Self {
            http,
            spot_base: spot_base.into(),
            futures_base: futures_base.into(),
            state: Mutex::new(ClientState {
                banned: false,
                paused_until_ms: 0,
                weight_minute: 0,
                used_weight_1m: 0,
            }),
        })
    }

    /// Snapshot for a spot symbol. Major pairs pull the 500-level book.
    pub async fn fetch_spot_depth(&self, symbol: &str) -> Result<DepthSnapshot, ExchangeError> {
        let (limit, weight) = depth_limit_for(symbol);
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.spot_base,
            symbol.to_uppercase(),
            limit
        );
        let body = self.get_checked(&url, weight).await?;
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Decode(format!("spot depth for {symbol}: {e}")))
    }

    /// Snapshot for a futures symbol, or None when the instrument does not
    /// exist on the futures segment.
    pub async fn fetch_futures_depth(
        &self,
        symbol: &str,
    ) -> Result<Option<DepthSnapshot>, ExchangeError> {
        let (limit, weight) = depth_limit_for(symbol);
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.futures_base,
            symbol.to_uppercase(),
            limit
        );
        match self.get_checked(&url, weight).await {
            Ok(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| ExchangeError::Decode(format!("futures depth for {symbol}: {e}"))),
            Err(ExchangeError::Transport(msg)) if msg.contains(CODE_INVALID_SYMBOL) => {
                debug!(symbol, "no futures instrument for symbol");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Depth snapshot routed by segment. The futures miss case surfaces as
    /// None either way.
    pub async fn fetch_depth(
        &self,
        key: &PairKey,
    ) -> Result<Option<DepthSnapshot>, ExchangeError> {
        match key.segment {
            Segment::Spot => self.fetch_spot_depth(&key.symbol).await.map(Some),
            Segment::Futures => self.fetch_futures_depth(&key.symbol).await,
        }
    }

    /// 24h quote volumes from both segments, merged per symbol and sorted
    /// by spot volume descending.
    pub async fn fetch_top_volumes(&self) -> Result<Vec<TickerVolume>, ExchangeError> {
        let spot_url = format!("{}/api/v3/ticker/24hr", self.spot_base);
        let spot_body = self.get_checked(&spot_url, TICKER_WEIGHT).await?;
        let spot: Vec<Ticker24h> = serde_json::from_str(&spot_body)
            .map_err(|e| ExchangeError::Decode(format!("spot 24h tickers: {e}")))?;

        let fut_url = format!("{}/fapi/v1/ticker/24hr", self.futures_base);
        let fut_body = self.get_checked(&fut_url, TICKER_WEIGHT).await?;
        let futures: Vec<Ticker24h> = serde_json::from_str(&fut_body)
            .map_err(|e| ExchangeError::Decode(format!("futures 24h tickers: {e}")))?;

        let mut merged: Vec<TickerVolume> = spot
            .into_iter()
            .map(|t| TickerVolume {
                symbol: t.symbol,
                spot_volume: t.quote_volume.parse().unwrap_or(0.0),
                futures_volume: 0.0,
                price_change_percent: t.price_change_percent.parse().unwrap_or(0.0),
            })
            .collect();

        for t in futures {
            let vol: f64 = t.quote_volume.parse().unwrap_or(0.0);
            if let Some(row) = merged.iter_mut().find(|r| r.symbol == t.symbol) {
                row.futures_volume = vol;
            } else {
                merged.push(TickerVolume {
                    symbol: t.symbol,
                    spot_volume: 0.0,
                    futures_volume: vol,
                    price_change_percent: t.price_change_percent.parse().unwrap_or(0.0),
                });
            }
        }

        merged.sort_by(|a, b| {
            b.spot_volume
                .partial_cmp(&a.spot_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(merged)
    }

    /// Clear the 418 latch after operator intervention.
    pub fn reset_ban(&self) {
        let mut state = self.state.lock();
        state.banned = false;
        warn!("exchange ban flag reset by operator");
    }

    pub fn is_banned(&self) -> bool {
        self.state.lock().banned
    }

    /// Instant until which REST calls are paused, 0 when unpaused.
    pub fn paused_until_ms(&self) -> i64 {
        self.state.lock().paused_until_ms
    }

    pub fn used_weight_1m(&self) -> u32 {
        self.state.lock().used_weight_1m
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn get_checked(&self, url: &str, weight: u32) -> Result<String, ExchangeError> {
        self.check_gate()?;

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(format!("GET {url}: {e}")))?;

        let status = resp.status().as_u16();
        let header_weight = resp
            .headers()
            .get(USED_WEIGHT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        self.note_weight(header_weight, weight);

        if let Some(err) = self.note_status(status, retry_after) {
            return Err(err);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(format!("read body for {url}: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(ExchangeError::Transport(format!(
                "GET {url} returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        Ok(body)
    }

    fn check_gate(&self) -> Result<(), ExchangeError> {
        let state = self.state.lock();
        if state.banned {
            return Err(ExchangeError::Banned);
        }
        let now = now_ms();
        if now < state.paused_until_ms {
            return Err(ExchangeError::RateLimited {
                until_ms: state.paused_until_ms,
            });
        }
        Ok(())
    }

    /// Fold a response status into the shared state. Returns the error the
    /// caller should surface, if any.
    fn note_status(&self, status: u16, retry_after_secs: Option<u64>) -> Option<ExchangeError> {
        match status {
            418 => {
                let mut state = self.state.lock();
                state.banned = true;
                warn!("exchange returned 418, REST calls disabled until reset");
                Some(ExchangeError::Banned)
            }
            429 => {
                let pause_ms = retry_after_secs
                    .map(|s| (s as i64) * 1_000)
                    .unwrap_or(DEFAULT_RATE_LIMIT_PAUSE_MS);
                let until = now_ms() + pause_ms;
                let mut state = self.state.lock();
                state.paused_until_ms = state.paused_until_ms.max(until);
                warn!(pause_ms, "exchange rate limit hit, pausing REST calls");
                Some(ExchangeError::RateLimited {
                    until_ms: state.paused_until_ms,
                })
            }
            _ => None,
        }
    }

    /// Track the per-minute weight budget, preferring the server's header
    /// over our own estimate.
    fn note_weight(&self, header_weight: Option<u32>, estimated: u32) {
        let minute = now_ms() / 60_000;
        let mut state = self.state.lock();
        if state.weight_minute != minute {
            state.weight_minute = minute;
            state.used_weight_1m = 0;
        }
        state.used_weight_1m = match header_weight {
            Some(used) => used,
            None => state.used_weight_1m.saturating_add(estimated),
        };
        if state.used_weight_1m > WEIGHT_LIMIT_1M * 9 / 10 {
            warn!(
                used = state.used_weight_1m,
                limit = WEIGHT_LIMIT_1M,
                "request-weight budget nearly exhausted"
            );
        }
    }
}

/// Depth levels (and request weight) pulled for a symbol.
fn depth_limit_for(symbol: &str) -> (u32, u32) {
    if crate::models::MAJOR_PAIRS.contains(&symbol.to_uppercase().as_str()) {
        (500, DEPTH_WEIGHT_DEEP)
    } else {
        (100, DEPTH_WEIGHT_SHALLOW)
    }
}
