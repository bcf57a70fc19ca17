// =============================================================================
// Delta Exchange REST client: historical candle backfill
// =============================================================================
//
// Only the public history endpoint is used, so there is no request signing.
// Any failure here is reported as a `BackfillError`; the caller treats it as
// "no history" and carries on with an empty series.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{BackfillError, FeedError};
use crate::market_data::feed::{check_ohlc, non_negative, parse_decimal, parse_timestamp, required_price};
use crate::market_data::Candle;

/// Parameters of one history request.  Times are epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub symbol: String,
    pub resolution: String,
    pub start: i64,
    pub end: i64,
}

impl BackfillRequest {
    /// Window of `lookback_secs` ending at `now`.
    pub fn lookback(
        symbol: impl Into<String>,
        resolution: impl Into<String>,
        lookback_secs: i64,
        now: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            resolution: resolution.into(),
            start: now - lookback_secs,
            end: now,
        }
    }
}

/// Source of historical candles, ascending and unique by time.
#[async_trait]
pub trait BackfillProvider: Send + Sync {
    async fn fetch_candles(&self, request: &BackfillRequest) -> Result<Vec<Candle>, BackfillError>;
}

/// Delta Exchange REST API client.
#[derive(Clone)]
pub struct DeltaClient {
    base_url: String,
    client: reqwest::Client,
}

impl DeltaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackfillError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    /// Use a preconfigured HTTP client (proxies, TLS settings, ...).
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "DeltaClient initialised");
        Self { base_url, client }
    }

    /// GET /v2/history/candles (public).
    ///
    /// Response shape:
    /// ```json
    /// { "success": true, "result": [ { "time": 1700000000, "open": 3200.5, ... } ] }
    /// ```
    #[instrument(skip(self), name = "delta::get_history_candles")]
    pub async fn get_history_candles(
        &self,
        request: &BackfillRequest,
    ) -> Result<Vec<Candle>, BackfillError> {
        let url = format!("{}/v2/history/candles", self.base_url);
        let start = request.start.to_string();
        let end = request.end.to_string();

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", request.symbol.as_str()),
                ("resolution", request.resolution.as_str()),
                ("start", start.as_str()),
                ("end", end.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(BackfillError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let body: Value =
            serde_json::from_str(&text).map_err(|e| BackfillError::Decode(e.to_string()))?;
        let candles = decode_history(&body)?;

        debug!(
            symbol = %request.symbol,
            resolution = %request.resolution,
            count = candles.len(),
            "history candles fetched"
        );
        Ok(candles)
    }
}

#[async_trait]
impl BackfillProvider for DeltaClient {
    async fn fetch_candles(&self, request: &BackfillRequest) -> Result<Vec<Candle>, BackfillError> {
        self.get_history_candles(request).await
    }
}

impl std::fmt::Debug for DeltaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Decoding
// -----------------------------------------------------------------------------

/// Turn a history response body into an ascending, de-duplicated candle list.
///
/// Entries with unreadable fields are skipped with a warning; an empty result
/// is an error so the caller can report "no history".
pub fn decode_history(body: &Value) -> Result<Vec<Candle>, BackfillError> {
    if !body["success"].as_bool().unwrap_or(false) {
        return Err(BackfillError::Unsuccessful);
    }

    let raw = match &body["result"] {
        Value::Array(entries) => entries,
        Value::Null => return Err(BackfillError::Empty),
        _ => return Err(BackfillError::Decode("result is not an array".to_string())),
    };

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        match decode_entry(entry) {
            Ok(candle) => candles.push(candle),
            Err(e) => warn!(error = %e, "skipping malformed history candle"),
        }
    }

    // The endpoint does not promise an order.
    candles.sort_by_key(|c| c.time);
    candles.dedup_by_key(|c| c.time);

    if candles.is_empty() {
        return Err(BackfillError::Empty);
    }
    Ok(candles)
}

fn decode_entry(entry: &Value) -> Result<Candle, FeedError> {
    let obj = entry.as_object().ok_or(FeedError::NotAnObject)?;

    let time = parse_timestamp(obj.get("time").ok_or(FeedError::MissingField("time"))?, "time")?;
    let open = required_price(obj, "open")?;
    let high = required_price(obj, "high")?;
    let low = required_price(obj, "low")?;
    let close = required_price(obj, "close")?;
    let volume = match obj.get("volume").map(|v| parse_decimal(v, "volume")) {
        Some(Ok(v)) => non_negative(v, "volume")?,
        _ => Decimal::ZERO,
    };

    check_ohlc(Candle {
        time,
        open,
        high,
        low,
        close,
        volume,
    })
}
