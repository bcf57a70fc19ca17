// =============================================================================
// Application State: wiring for one live chart
// =============================================================================
//
// Owns the shared pieces of the pipeline for a single symbol:
//
//   DeltaClient ──backfill──▶ CandleSeries ◀──upsert── FeedReconciler
//                                  │                        │ latest price
//                                  ▼                        ▼
//                            render loop               AlertEngine
//
// Subsystems hold `Arc`s to the parts they use; AppState ties them together
// and provides a serialisable status snapshot.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alerts::{AlertEngine, AlertFired, PriceAlert};
use crate::delta::{BackfillProvider, BackfillRequest};
use crate::market_data::{Candle, CandleSeries, FeedReconciler, FeedStats, PriceHook};
use crate::runtime_config::RuntimeConfig;

/// Serialisable view of the pipeline, logged on shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub symbol: String,
    pub series_version: u64,
    pub candles: usize,
    pub latest: Option<Candle>,
    pub feed: FeedStats,
    pub alerts: Vec<PriceAlert>,
    pub server_time: i64,
}

/// The reconciler owns the series; everything else reaches it through
/// [`AppState::series`].
pub struct AppState {
    pub config: RuntimeConfig,
    pub alerts: Arc<AlertEngine>,
    pub reconciler: Arc<FeedReconciler>,
}

impl AppState {
    /// Build the series, register configured alerts and hook the alert
    /// engine into the reconciler.  Fired alerts are also published on
    /// `alert_events` when given.
    pub fn new(config: RuntimeConfig, alert_events: Option<mpsc::UnboundedSender<AlertFired>>) -> Self {
        let series = Arc::new(CandleSeries::new(config.capacity));

        let engine = match alert_events {
            Some(tx) => AlertEngine::new().with_events(tx),
            None => AlertEngine::new(),
        };
        for spec in &config.alerts {
            engine.register(spec.threshold, spec.direction);
        }
        let alerts = Arc::new(engine);

        let hook: Arc<dyn PriceHook> = alerts.clone();
        let reconciler = Arc::new(
            FeedReconciler::new(
                config.symbol.clone(),
                config.candle_channel.clone(),
                config.ticker_channel.clone(),
                series,
            )
            .with_hook(hook),
        );

        Self {
            config,
            alerts,
            reconciler,
        }
    }

    pub fn series(&self) -> &Arc<CandleSeries> {
        self.reconciler.series()
    }

    /// Channels subscribed for the live feed, candles first.
    pub fn channels(&self) -> Vec<String> {
        vec![
            self.config.candle_channel.clone(),
            self.config.ticker_channel.clone(),
        ]
    }

    /// Seed the series with recent history ending now.
    pub async fn backfill<P>(&self, provider: &P) -> usize
    where
        P: BackfillProvider + ?Sized,
    {
        self.backfill_until(provider, Utc::now().timestamp()).await
    }

    /// Seed the series with history ending at `now` (epoch seconds).
    ///
    /// Failures leave the series untouched and are only logged: the chart
    /// then starts empty and fills from the live feed.  Returns the number of
    /// candles retained.
    pub async fn backfill_until<P>(&self, provider: &P, now: i64) -> usize
    where
        P: BackfillProvider + ?Sized,
    {
        let request = BackfillRequest::lookback(
            self.config.symbol.clone(),
            self.config.resolution.clone(),
            self.config.backfill_lookback_secs,
            now,
        );

        let candles = match provider.fetch_candles(&request).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "history backfill failed, starting empty");
                return 0;
            }
        };

        match self.series().bulk_load(&candles) {
            Ok(kept) => {
                info!(
                    symbol = %request.symbol,
                    fetched = candles.len(),
                    kept,
                    "history backfill loaded"
                );
                kept
            }
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "history backfill rejected, starting empty");
                0
            }
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            symbol: self.config.symbol.clone(),
            series_version: self.series().version(),
            candles: self.series().len(),
            latest: self.series().latest(),
            feed: self.reconciler.stats(),
            alerts: self.alerts.alerts(),
            server_time: Utc::now().timestamp_millis(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("symbol", &self.config.symbol)
            .field("series", self.series())
            .field("alerts", &self.alerts)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackfillError;
    use crate::market_data::ReconcileOutcome;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Serves `candles`, or an unsuccessful response when `None`.
    struct FakeHistory {
        candles: Option<Vec<Candle>>,
        seen: Mutex<Vec<BackfillRequest>>,
    }

    impl FakeHistory {
        fn returning(candles: Option<Vec<Candle>>) -> Self {
            Self {
                candles,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BackfillProvider for FakeHistory {
        async fn fetch_candles(&self, request: &BackfillRequest) -> Result<Vec<Candle>, BackfillError> {
            self.seen.lock().push(request.clone());
            self.candles.clone().ok_or(BackfillError::Unsuccessful)
        }
    }

    fn flat(time: i64, price: Decimal) -> Candle {
        Candle {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: dec!(1),
        }
    }

    fn config() -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.capacity = 3;
        cfg.alerts = vec!["above:3300".parse().unwrap(), "below:3200".parse().unwrap()];
        cfg
    }

    #[tokio::test]
    async fn backfill_requests_the_configured_window() {
        let state = AppState::new(config(), None);
        let history = FakeHistory::returning(Some((0..5).map(|i| flat(i * 60, dec!(3250))).collect()));

        let kept = state.backfill_until(&history, 10_000).await;
        assert_eq!(kept, 3);
        assert_eq!(
            state.series().snapshot().iter().map(|c| c.time).collect::<Vec<_>>(),
            vec![120, 180, 240]
        );

        let seen = history.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].symbol, "ETHUSD");
        assert_eq!(seen[0].resolution, "1m");
        assert_eq!(seen[0].start, 10_000 - 7200);
        assert_eq!(seen[0].end, 10_000);
    }

    #[tokio::test]
    async fn failed_backfill_starts_empty() {
        let state = AppState::new(config(), None);
        let history = FakeHistory::returning(None);

        assert_eq!(state.backfill(&history).await, 0);
        assert!(state.series().is_empty());
        assert_eq!(state.series().version(), 0);
    }

    #[tokio::test]
    async fn unordered_history_is_rejected_without_touching_the_series() {
        let state = AppState::new(config(), None);
        let history = FakeHistory::returning(Some(vec![flat(60, dec!(1)), flat(0, dec!(1))]));

        assert_eq!(state.backfill_until(&history, 1_000).await, 0);
        assert!(state.series().is_empty());
    }

    #[test]
    fn configured_alerts_fire_from_live_prices() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = AppState::new(config(), Some(tx));
        assert_eq!(state.alerts.armed_count(), 2);

        let frame = r#"{"type":"candlestick_1m","symbol":"ETHUSD","candle_start_time":120000000,"open":"3290","high":"3305","low":"3290","close":"3301","volume":"2"}"#;
        let outcome = state.reconciler.handle_message(frame);
        assert!(matches!(outcome, ReconcileOutcome::CandleUpdated(_)));

        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.threshold, dec!(3300));
        assert_eq!(fired.price, dec!(3301));
        assert!(rx.try_recv().is_err());
        assert_eq!(state.alerts.armed_count(), 1);

        let status = state.status();
        assert_eq!(status.candles, 1);
        assert_eq!(status.feed.candles, 1);
        assert_eq!(status.alerts.iter().filter(|a| a.triggered).count(), 1);
    }

    #[test]
    fn channels_list_candles_then_ticker() {
        let state = AppState::new(config(), None);
        assert_eq!(state.channels(), vec!["candlestick_1m", "v2/ticker"]);
    }
}
