pub mod candle_series;
pub mod feed;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_series::{Candle, CandleSeries};
pub use feed::{FeedReconciler, FeedStats, PriceHook, ReconcileOutcome};
