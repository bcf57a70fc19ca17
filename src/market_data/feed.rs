// =============================================================================
// Feed Reconciler: turns raw feed frames into series upserts and ticker events
// =============================================================================
//
// Every inbound text frame ends up as exactly one `ReconcileOutcome`.  Nothing
// here returns an error to the connection: bad frames are counted, logged and
// dropped so the stream keeps flowing.
// =============================================================================

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{FeedError, OutOfOrderError};
use crate::market_data::candle_series::{Candle, CandleSeries};

/// `candle_start_time` is sent in microseconds.
const MICROS_PER_SECOND: i64 = 1_000_000;

/// Message kind the feed uses for ticker pushes.
pub const TICKER_KIND: &str = "ticker";

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Last-trade summary for the configured symbol.  Not stored anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub close: Decimal,
    pub price_change_24h: Option<Decimal>,
}

/// Why a well-formed frame was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Frame without a `type` field (e.g. bare acknowledgements).
    MissingKind,
    /// A kind this reconciler does not handle (subscription acks, heartbeats).
    UnknownKind(String),
    SymbolMismatch { expected: String, received: String },
    /// Candle older than the series tail.
    OutOfOrder(OutOfOrderError),
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingKind => write!(f, "missing message type"),
            Self::UnknownKind(kind) => write!(f, "unhandled message type {kind}"),
            Self::SymbolMismatch { expected, received } => {
                write!(f, "symbol {received} does not match {expected}")
            }
            Self::OutOfOrder(e) => write!(f, "{e}"),
        }
    }
}

/// Result of handling one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    CandleUpdated(Candle),
    TickerReceived(TickerSnapshot),
    Ignored(IgnoreReason),
    MalformedMessage(FeedError),
}

/// Receives the latest known price after every applied candle or ticker.
pub trait PriceHook: Send + Sync {
    fn on_price(&self, price: Decimal);
}

/// Counters describing what the reconciler has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStats {
    pub received: u64,
    pub candles: u64,
    pub tickers: u64,
    pub ignored: u64,
    pub malformed: u64,
}

// ---------------------------------------------------------------------------
// FeedReconciler
// ---------------------------------------------------------------------------

/// Interprets feed frames for one symbol and applies them to a shared
/// [`CandleSeries`].
pub struct FeedReconciler {
    symbol: String,
    candle_kind: String,
    ticker_channel: String,
    series: Arc<CandleSeries>,
    hook: Option<Arc<dyn PriceHook>>,
    received: AtomicU64,
    candles: AtomicU64,
    tickers: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
}

impl FeedReconciler {
    /// `candle_kind` is the message type of bar updates (`candlestick_1m`);
    /// `ticker_channel` is accepted as an alias of `ticker`.
    pub fn new(
        symbol: impl Into<String>,
        candle_kind: impl Into<String>,
        ticker_channel: impl Into<String>,
        series: Arc<CandleSeries>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            candle_kind: candle_kind.into(),
            ticker_channel: ticker_channel.into(),
            series,
            hook: None,
            received: AtomicU64::new(0),
            candles: AtomicU64::new(0),
            tickers: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Attach a collaborator that is told the latest price after each applied
    /// candle or ticker.
    pub fn with_hook(mut self, hook: Arc<dyn PriceHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn series(&self) -> &Arc<CandleSeries> {
        &self.series
    }

    /// Handle one raw frame: classify it, apply it, notify the hook.
    pub fn handle_message(&self, raw: &str) -> ReconcileOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.interpret(raw) {
            Interpreted::Candle(candle) => self.apply_candle(candle),
            Interpreted::Ticker(ticker) => {
                info!(
                    symbol = %ticker.symbol,
                    price = %ticker.close,
                    change_24h = ?ticker.price_change_24h,
                    "live price"
                );
                self.notify(ticker.close);
                ReconcileOutcome::TickerReceived(ticker)
            }
            Interpreted::Ignored(reason) => ReconcileOutcome::Ignored(reason),
            Interpreted::Malformed(err) => ReconcileOutcome::MalformedMessage(err),
        };

        match &outcome {
            ReconcileOutcome::CandleUpdated(_) => {
                self.candles.fetch_add(1, Ordering::Relaxed);
            }
            ReconcileOutcome::TickerReceived(_) => {
                self.tickers.fetch_add(1, Ordering::Relaxed);
            }
            ReconcileOutcome::Ignored(IgnoreReason::OutOfOrder(e)) => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %self.symbol, error = %e, "dropping out-of-order candle");
            }
            ReconcileOutcome::Ignored(reason) => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
                debug!(reason = %reason, "feed message ignored");
            }
            ReconcileOutcome::MalformedMessage(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping malformed feed message");
            }
        }

        outcome
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            received: self.received.load(Ordering::Relaxed),
            candles: self.candles.load(Ordering::Relaxed),
            tickers: self.tickers.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    fn apply_candle(&self, candle: Candle) -> ReconcileOutcome {
        if let Err(e) = self.series.upsert(candle) {
            return ReconcileOutcome::Ignored(IgnoreReason::OutOfOrder(e));
        }

        info!(
            time = %candle.datetime().format("%H:%M:%S"),
            open = %candle.open,
            high = %candle.high,
            low = %candle.low,
            close = %candle.close,
            volume = %candle.volume,
            "candle update"
        );

        let latest = self.series.latest().map_or(candle.close, |c| c.close);
        self.notify(latest);
        ReconcileOutcome::CandleUpdated(candle)
    }

    fn notify(&self, price: Decimal) {
        if let Some(hook) = &self.hook {
            hook.on_price(price);
        }
    }

    fn interpret(&self, raw: &str) -> Interpreted {
        let root: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return Interpreted::Malformed(FeedError::InvalidJson(e.to_string())),
        };
        let Some(obj) = root.as_object() else {
            return Interpreted::Malformed(FeedError::NotAnObject);
        };
        let Some(kind) = obj.get("type").and_then(Value::as_str) else {
            return Interpreted::Ignored(IgnoreReason::MissingKind);
        };

        let is_candle = kind == self.candle_kind;
        let is_ticker = kind == TICKER_KIND || kind == self.ticker_channel;
        if !is_candle && !is_ticker {
            return Interpreted::Ignored(IgnoreReason::UnknownKind(kind.to_string()));
        }

        match obj.get("symbol").and_then(Value::as_str) {
            Some(s) if s == self.symbol => {}
            Some(other) => {
                return Interpreted::Ignored(IgnoreReason::SymbolMismatch {
                    expected: self.symbol.clone(),
                    received: other.to_string(),
                })
            }
            None => return Interpreted::Malformed(FeedError::MissingField("symbol")),
        }

        let parsed = if is_candle {
            parse_candle(obj).map(Interpreted::Candle)
        } else {
            parse_ticker(obj, &self.symbol).map(Interpreted::Ticker)
        };
        parsed.unwrap_or_else(Interpreted::Malformed)
    }
}

impl std::fmt::Debug for FeedReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedReconciler")
            .field("symbol", &self.symbol)
            .field("candle_kind", &self.candle_kind)
            .field("ticker_channel", &self.ticker_channel)
            .field("hook", &self.hook.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

enum Interpreted {
    Candle(Candle),
    Ticker(TickerSnapshot),
    Ignored(IgnoreReason),
    Malformed(FeedError),
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

fn parse_candle(obj: &Map<String, Value>) -> Result<Candle, FeedError> {
    let start = parse_timestamp(
        obj.get("candle_start_time")
            .ok_or(FeedError::MissingField("candle_start_time"))?,
        "candle_start_time",
    )?;

    let open = required_price(obj, "open")?;
    let high = required_price(obj, "high")?;
    let low = required_price(obj, "low")?;
    let close = required_price(obj, "close")?;

    // Volume is optional: absent or unreadable means zero.
    let volume = match obj.get("volume") {
        None | Some(Value::Null) => Decimal::ZERO,
        Some(v) => match parse_decimal(v, "volume") {
            Ok(d) => non_negative(d, "volume")?,
            Err(e) => {
                debug!(error = %e, "volume unreadable, defaulting to zero");
                Decimal::ZERO
            }
        },
    };

    check_ohlc(Candle {
        time: start.div_euclid(MICROS_PER_SECOND),
        open,
        high,
        low,
        close,
        volume,
    })
}

fn parse_ticker(obj: &Map<String, Value>, symbol: &str) -> Result<TickerSnapshot, FeedError> {
    let close = required_price(obj, "close")?;
    let price_change_24h = obj
        .get("price_change_24h")
        .and_then(|v| parse_decimal(v, "price_change_24h").ok());

    Ok(TickerSnapshot {
        symbol: symbol.to_string(),
        close,
        price_change_24h,
    })
}

/// Mandatory, non-negative price field.
pub fn required_price(obj: &Map<String, Value>, field: &'static str) -> Result<Decimal, FeedError> {
    let value = obj.get(field).ok_or(FeedError::MissingField(field))?;
    non_negative(parse_decimal(value, field)?, field)
}

/// Reject candles whose body does not sit inside the wick:
/// `low <= min(open, close)` and `max(open, close) <= high`.
pub fn check_ohlc(candle: Candle) -> Result<Candle, FeedError> {
    let body_low = candle.open.min(candle.close);
    let body_high = candle.open.max(candle.close);
    if candle.low > body_low || body_high > candle.high {
        return Err(FeedError::InconsistentOhlc {
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
        });
    }
    Ok(candle)
}

pub fn non_negative(value: Decimal, field: &'static str) -> Result<Decimal, FeedError> {
    if value < Decimal::ZERO {
        return Err(FeedError::NegativeValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// The feed and the history endpoint send prices either as JSON strings or as
/// JSON numbers.  Both are parsed from their textual form so no binary float
/// rounding sneaks in.
pub fn parse_decimal(value: &Value, field: &'static str) -> Result<Decimal, FeedError> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(FeedError::InvalidNumber {
                field,
                value: other.to_string(),
            })
        }
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| FeedError::InvalidNumber { field, value: text })
}

/// Integer timestamps only; a float here would mean precision already lost.
pub fn parse_timestamp(value: &Value, field: &'static str) -> Result<i64, FeedError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| FeedError::InvalidTimestamp {
        field,
        value: value.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
