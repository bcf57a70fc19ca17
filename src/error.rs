// =============================================================================
// Error taxonomy for the live candle pipeline
// =============================================================================
//
// Only `ValidationError` is ever returned to a caller that can act on it (an
// explicit bulk load).  Everything else is raised per message / per request,
// logged where it happens, and skipped.
// =============================================================================

use rust_decimal::Decimal;
use thiserror::Error;

/// A bulk load was handed a sequence it cannot accept.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("bulk load requires at least one candle")]
    EmptyInput,
    #[error("candle at index {index} has time {time}, not after previous time {previous}")]
    NotAscending { index: usize, previous: i64, time: i64 },
}

/// An upsert referenced a bucket older than the series tail.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("candle time {received} is older than series tail {last}")]
pub struct OutOfOrderError {
    pub last: i64,
    pub received: i64,
}

/// Why an inbound feed message could not be interpreted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {field} is not a decimal: {value}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field {field} must be non-negative, got {value}")]
    NegativeValue { field: &'static str, value: String },
    #[error("field {field} is not an integer timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("inconsistent OHLC: open {open}, high {high}, low {low}, close {close}")]
    InconsistentOhlc {
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    },
}

/// Historical candles could not be obtained.  Always non-fatal.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("history request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("history endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("history endpoint reported success=false")]
    Unsuccessful,
    #[error("failed to decode history response: {0}")]
    Decode(String),
    #[error("history endpoint returned no candles")]
    Empty,
}

/// Failures reported by (or while driving) the WebSocket transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection is not open")]
    NotConnected,
    #[error("socket error: {0}")]
    Socket(String),
}

/// Misuse of the stream supervisor lifecycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}
