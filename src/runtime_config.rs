// =============================================================================
// Runtime Configuration: chart settings with atomic save
// =============================================================================
//
// Every field carries a serde default so that a partial (or empty) JSON file
// still loads, and adding fields never breaks an older config file.
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alerts::{parse_alert_list, AlertSpec};
use crate::market_data::candle_series::DEFAULT_CAPACITY;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "ETHUSD".to_string()
}

fn default_resolution() -> String {
    "1m".to_string()
}

fn default_candle_channel() -> String {
    "candlestick_1m".to_string()
}

fn default_ticker_channel() -> String {
    "v2/ticker".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.india.delta.exchange".to_string()
}

fn default_ws_url() -> String {
    "wss://socket.india.delta.exchange".to_string()
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_backfill_lookback_secs() -> i64 {
    2 * 3600
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_render_interval_ms() -> u64 {
    1000
}

fn default_subscribe_grace_ms() -> u64 {
    2000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Settings for one live chart (one symbol, one bar interval).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instrument ---------------------------------------------------------

    /// Trading pair, e.g. `ETHUSD`.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Bar resolution requested from the history endpoint.
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Channel (and inbound message type) carrying bar updates.
    #[serde(default = "default_candle_channel")]
    pub candle_channel: String,

    /// Channel carrying last-trade tickers.
    #[serde(default = "default_ticker_channel")]
    pub ticker_channel: String,

    // --- Endpoints ----------------------------------------------------------

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    // --- Series & timing ----------------------------------------------------

    /// Number of candles kept in the rolling window.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// How far back the startup backfill reaches.
    #[serde(default = "default_backfill_lookback_secs")]
    pub backfill_lookback_secs: i64,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Period of the render loop.
    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,

    /// How long startup waits for the subscriptions to go out.
    #[serde(default = "default_subscribe_grace_ms")]
    pub subscribe_grace_ms: u64,

    // --- Alerts -------------------------------------------------------------

    /// Alerts registered at startup.
    #[serde(default)]
    pub alerts: Vec<AlertSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            resolution: default_resolution(),
            candle_channel: default_candle_channel(),
            ticker_channel: default_ticker_channel(),
            rest_base_url: default_rest_base_url(),
            ws_url: default_ws_url(),
            capacity: default_capacity(),
            backfill_lookback_secs: default_backfill_lookback_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            render_interval_ms: default_render_interval_ms(),
            subscribe_grace_ms: default_subscribe_grace_ms(),
            alerts: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read chart config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse chart config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            alerts = config.alerts.len(),
            "chart config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise chart config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "chart config saved (atomic)");
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            anyhow::bail!("symbol must not be empty");
        }
        if self.capacity == 0 {
            anyhow::bail!("capacity must be at least 1");
        }
        if self.render_interval_ms == 0 {
            anyhow::bail!("render_interval_ms must be positive");
        }
        if self.backfill_lookback_secs < 0 {
            anyhow::bail!("backfill_lookback_secs must not be negative");
        }
        Ok(())
    }

    /// Apply `CHART_SYMBOL`, `CHART_ALERTS`, `CHART_WS_URL` and
    /// `CHART_REST_URL` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`.  Blank values are ignored; alerts from
    /// `CHART_ALERTS` replace the ones in the file.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(symbol) = get("CHART_SYMBOL") {
            self.symbol = symbol.trim().to_uppercase();
        }
        if let Some(url) = get("CHART_WS_URL") {
            self.ws_url = url.trim().to_string();
        }
        if let Some(url) = get("CHART_REST_URL") {
            self.rest_base_url = url.trim().to_string();
        }
        if let Some(list) = get("CHART_ALERTS") {
            self.alerts = parse_alert_list(&list)
                .map_err(|e| anyhow::anyhow!("invalid CHART_ALERTS: {e}"))?;
        }
        Ok(())
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }

    pub fn subscribe_grace(&self) -> Duration {
        Duration::from_millis(self.subscribe_grace_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
