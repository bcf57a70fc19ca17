// =============================================================================
// Chart Rendering: frame model and periodic redraw loop
// =============================================================================
//
// Drawing itself is left to a `ChartRenderer`.  This module turns a series
// snapshot into a `ChartFrame` and drives redraws: the loop wakes every
// period, compares the series version with the last one drawn and only
// rebuilds the frame when something changed.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::market_data::{Candle, CandleSeries};

/// Fewer candles than this produce no frame.
pub const MIN_CANDLES: usize = 2;

/// One drawable candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CandleBar {
    pub time: DateTime<Utc>,
    pub wick_low: Decimal,
    pub wick_high: Decimal,
    pub body_bottom: Decimal,
    pub body_top: Decimal,
    pub bullish: bool,
    /// Open equals close; drawn as a flat line.
    pub doji: bool,
    pub volume: Decimal,
}

impl From<&Candle> for CandleBar {
    fn from(c: &Candle) -> Self {
        Self {
            time: c.datetime(),
            wick_low: c.low,
            wick_high: c.high,
            body_bottom: c.open.min(c.close),
            body_top: c.open.max(c.close),
            bullish: c.is_bullish(),
            doji: c.open == c.close,
            volume: c.volume,
        }
    }
}

/// Header line shown above the chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameSummary {
    pub symbol: String,
    pub current_price: Decimal,
    /// Change versus the open of the first candle in the window.
    pub change: Decimal,
    /// `None` when the first open is zero.
    pub change_pct: Option<Decimal>,
    pub volume: Decimal,
    pub candles: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartFrame {
    pub bars: Vec<CandleBar>,
    pub summary: FrameSummary,
}

impl ChartFrame {
    /// Build a frame from candles in series order.  Returns `None` below
    /// [`MIN_CANDLES`].
    pub fn build(symbol: &str, candles: &[Candle]) -> Option<Self> {
        if candles.len() < MIN_CANDLES {
            return None;
        }
        let first = candles.first()?;
        let last = candles.last()?;

        let change = last.close - first.open;
        let change_pct = change
            .checked_div(first.open)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .map(|pct| pct.round_dp(2));

        Some(Self {
            bars: candles.iter().map(CandleBar::from).collect(),
            summary: FrameSummary {
                symbol: symbol.to_string(),
                current_price: last.close,
                change,
                change_pct,
                volume: last.volume,
                candles: candles.len(),
            },
        })
    }
}

/// Draws frames.  Called from the render loop only.
pub trait ChartRenderer: Send + Sync {
    fn draw(&self, frame: &ChartFrame);
}

/// Writes the frame summary to the log.
#[derive(Debug, Default)]
pub struct LogRenderer;

impl ChartRenderer for LogRenderer {
    fn draw(&self, frame: &ChartFrame) {
        let s = &frame.summary;
        let pct = s
            .change_pct
            .map(|p| format!("{}%", signed(p)))
            .unwrap_or_else(|| "n/a".to_string());
        info!(
            symbol = %s.symbol,
            price = %s.current_price,
            change = %s.change,
            change_pct = %pct,
            volume = %s.volume,
            candles = s.candles,
            "{} {} ({} / {})",
            s.symbol,
            s.current_price,
            signed(s.change),
            pct
        );
    }
}

fn signed(value: Decimal) -> String {
    if value > Decimal::ZERO {
        format!("+{value}")
    } else {
        value.to_string()
    }
}

/// Redraw `series` every `period` until `shutdown` turns true (or its sender
/// is dropped).  Returns the number of frames drawn.
pub async fn run_render_loop<R>(
    symbol: String,
    series: Arc<CandleSeries>,
    renderer: Arc<R>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> u64
where
    R: ChartRenderer + ?Sized,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_drawn: Option<u64> = None;
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let version = series.version();
                if last_drawn == Some(version) {
                    continue;
                }

                let candles = series.snapshot();
                match ChartFrame::build(&symbol, &candles) {
                    Some(frame) => {
                        renderer.draw(&frame);
                        frames += 1;
                    }
                    None => debug!(candles = candles.len(), "not enough candles to draw yet"),
                }
                last_drawn = Some(version);
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(symbol = %symbol, frames, "render loop stopped");
    frames
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    fn candle(time: i64, open: Decimal, close: Decimal) -> Candle {
        Candle {
            time,
            open,
            high: open.max(close) + dec!(1),
            low: open.min(close) - dec!(1),
            close,
            volume: dec!(10),
        }
    }

    #[test]
    fn fewer_than_two_candles_draw_nothing() {
        assert!(ChartFrame::build("ETHUSD", &[]).is_none());
        assert!(ChartFrame::build("ETHUSD", &[candle(0, dec!(1), dec!(2))]).is_none());
    }

    #[test]
    fn bars_follow_candle_shape() {
        let candles = [
            candle(0, dec!(100), dec!(110)),
            candle(60, dec!(110), dec!(105)),
            candle(120, dec!(105), dec!(105)),
        ];
        let frame = ChartFrame::build("ETHUSD", &candles).unwrap();
        assert_eq!(frame.bars.len(), 3);

        let up = frame.bars[0];
        assert!(up.bullish && !up.doji);
        assert_eq!((up.body_bottom, up.body_top), (dec!(100), dec!(110)));
        assert_eq!((up.wick_low, up.wick_high), (dec!(99), dec!(111)));

        let down = frame.bars[1];
        assert!(!down.bullish);
        assert_eq!((down.body_bottom, down.body_top), (dec!(105), dec!(110)));

        let flat = frame.bars[2];
        assert!(flat.doji && flat.bullish);
        assert_eq!(flat.time.timestamp(), 120);
    }

    #[test]
    fn summary_measures_change_from_first_open() {
        let candles = [candle(0, dec!(3200), dec!(3210)), candle(60, dec!(3210), dec!(3248))];
        let s = ChartFrame::build("ETHUSD", &candles).unwrap().summary;
        assert_eq!(s.current_price, dec!(3248));
        assert_eq!(s.change, dec!(48));
        assert_eq!(s.change_pct, Some(dec!(1.50)));
        assert_eq!(s.volume, dec!(10));
        assert_eq!(s.candles, 2);
    }

    #[test]
    fn zero_first_open_has_no_percentage() {
        let candles = [candle(0, dec!(0), dec!(1)), candle(60, dec!(1), dec!(2))];
        let s = ChartFrame::build("ETHUSD", &candles).unwrap().summary;
        assert_eq!(s.change, dec!(2));
        assert_eq!(s.change_pct, None);
    }

    #[test]
    fn signed_marks_gains() {
        assert_eq!(signed(dec!(1.5)), "+1.5");
        assert_eq!(signed(dec!(-2)), "-2");
        assert_eq!(signed(dec!(0)), "0");
    }

    #[derive(Default)]
    struct RecordingRenderer {
        frames: Mutex<Vec<ChartFrame>>,
    }

    impl ChartRenderer for RecordingRenderer {
        fn draw(&self, frame: &ChartFrame) {
            self.frames.lock().push(frame.clone());
        }
    }

    async fn wait_for_frames(renderer: &RecordingRenderer, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while renderer.frames.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("renderer never reached the expected frame count");
    }

    #[tokio::test]
    async fn render_loop_redraws_only_on_change() {
        let series = Arc::new(CandleSeries::new(10));
        series.upsert(candle(0, dec!(1), dec!(2))).unwrap();

        let renderer = Arc::new(RecordingRenderer::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_render_loop(
            "ETHUSD".to_string(),
            Arc::clone(&series),
            Arc::clone(&renderer),
            Duration::from_millis(10),
            stop_rx,
        ));

        // One candle: ticks pass without a frame.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(renderer.frames.lock().is_empty());

        series.upsert(candle(60, dec!(2), dec!(3))).unwrap();
        wait_for_frames(&renderer, 1).await;

        // Nothing changed: no redraw.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(renderer.frames.lock().len(), 1);

        series.upsert(candle(60, dec!(2), dec!(4))).unwrap();
        wait_for_frames(&renderer, 2).await;
        assert_eq!(renderer.frames.lock()[1].summary.current_price, dec!(4));

        stop_tx.send(true).unwrap();
        let frames = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames, 2);
    }

    #[tokio::test]
    async fn render_loop_stops_when_shutdown_sender_drops() {
        let series = Arc::new(CandleSeries::new(10));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_render_loop(
            "ETHUSD".to_string(),
            series,
            Arc::new(LogRenderer),
            Duration::from_millis(10),
            stop_rx,
        ));
        drop(stop_tx);
        let frames = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames, 0);
    }
}
