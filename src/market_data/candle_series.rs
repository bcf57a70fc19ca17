use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OutOfOrderError, ValidationError};

/// Default number of candles retained by a series.
pub const DEFAULT_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLCV bar.  `time` is the bucket start in epoch seconds and is the
/// primary key within a [`CandleSeries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Bucket start as a UTC timestamp (presentation only).
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.time, 0).unwrap_or_default()
    }

    /// Green candle: closed at or above its open.
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }
}

/// What an [`CandleSeries::upsert`] did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    /// The tail bucket was refined in place.
    Replaced,
    /// A new bucket was appended (possibly evicting the oldest one).
    Appended,
}

// ---------------------------------------------------------------------------
// CandleSeries -- bounded, time-ascending, thread-safe
// ---------------------------------------------------------------------------

/// Bounded window of the most recent candles for one symbol.
///
/// The forming bar is refined in place while its bucket is open; a new bucket
/// is appended and the oldest bar evicted once `capacity` is exceeded.  Every
/// operation takes the internal lock exactly once, so readers always see a
/// state that existed between two mutations.
pub struct CandleSeries {
    candles: RwLock<VecDeque<Candle>>,
    capacity: usize,
    /// Bumped on every successful mutation; lets readers skip unchanged frames.
    version: AtomicU64,
}

impl CandleSeries {
    /// Create an empty series holding at most `capacity` candles (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            candles: RwLock::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
            version: AtomicU64::new(0),
        }
    }

    /// Replace the whole series with `candles`.
    ///
    /// The input must be non-empty and strictly ascending by `time`.  Only
    /// the newest `capacity` candles are kept.  On error the series is left
    /// untouched.
    pub fn bulk_load(&self, candles: &[Candle]) -> Result<usize, ValidationError> {
        if candles.is_empty() {
            return Err(ValidationError::EmptyInput);
        }
        for (index, pair) in candles.windows(2).enumerate() {
            if pair[1].time <= pair[0].time {
                return Err(ValidationError::NotAscending {
                    index: index + 1,
                    previous: pair[0].time,
                    time: pair[1].time,
                });
            }
        }

        let start = candles.len().saturating_sub(self.capacity);
        let kept: VecDeque<Candle> = candles[start..].iter().copied().collect();
        let loaded = kept.len();
        *self.candles.write() = kept;
        self.version.fetch_add(1, Ordering::Release);

        debug!(
            received = candles.len(),
            loaded,
            capacity = self.capacity,
            "series bulk loaded"
        );
        Ok(loaded)
    }

    /// Insert or replace the tail candle.
    ///
    /// * Same `time` as the tail: the tail is replaced, length unchanged.
    /// * Newer `time`: appended, then the oldest candles are evicted until the
    ///   series fits `capacity`.
    /// * Older `time`: rejected, series unchanged.
    pub fn upsert(&self, candle: Candle) -> Result<UpsertKind, OutOfOrderError> {
        let mut ring = self.candles.write();

        if let Some(last) = ring.back_mut() {
            if candle.time == last.time {
                *last = candle;
                self.version.fetch_add(1, Ordering::Release);
                return Ok(UpsertKind::Replaced);
            }
            if candle.time < last.time {
                return Err(OutOfOrderError {
                    last: last.time,
                    received: candle.time,
                });
            }
        }

        ring.push_back(candle);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        self.version.fetch_add(1, Ordering::Release);
        Ok(UpsertKind::Appended)
    }

    /// Owned point-in-time copy of the series, oldest first.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.read().iter().copied().collect()
    }

    /// The most recent candle, if any.
    pub fn latest(&self) -> Option<Candle> {
        self.candles.read().back().copied()
    }

    pub fn len(&self) -> usize {
        self.candles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of successful mutations so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl Default for CandleSeries {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for CandleSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.candles.read();
        f.debug_struct("CandleSeries")
            .field("len", &ring.len())
            .field("capacity", &self.capacity)
            .field("first", &ring.front().map(|c| c.time))
            .field("last", &ring.back().map(|c| c.time))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
