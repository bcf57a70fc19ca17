// =============================================================================
// Live Candles: Main Entry Point
// =============================================================================
//
// Startup order: config, history backfill, live feed subscription (with a
// short grace period), then the render loop.  Ctrl+C closes the feed and
// stops rendering.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod app_state;
mod delta;
mod error;
mod market_data;
mod render;
mod runtime_config;
mod stream;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::delta::DeltaClient;
use crate::render::LogRenderer;
use crate::runtime_config::RuntimeConfig;
use crate::stream::{StreamState, StreamSupervisor, WsTransport};

const DEFAULT_CONFIG_PATH: &str = "chart_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Live Candles starting up");

    let config_path =
        std::env::var("CHART_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = RuntimeConfig::default();
        // Leave an editable template behind when there was no file at all.
        if !Path::new(&config_path).exists() {
            if let Err(e) = defaults.save(&config_path) {
                warn!(error = %e, "Failed to write default config");
            }
        }
        defaults
    });
    config.apply_env_overrides()?;
    config.validate().context("invalid chart configuration")?;

    info!(
        symbol = %config.symbol,
        resolution = %config.resolution,
        capacity = config.capacity,
        alerts = config.alerts.len(),
        "Chart configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, None));
    info!(armed = state.alerts.armed_count(), "Price alerts armed");

    // ── 3. History backfill ──────────────────────────────────────────────
    match DeltaClient::new(state.config.rest_base_url.clone(), state.config.http_timeout()) {
        Ok(client) => {
            state.backfill(&client).await;
        }
        Err(e) => warn!(error = %e, "Failed to build REST client, skipping backfill"),
    }
    if state.series().is_empty() {
        warn!("No history loaded, chart fills from the live feed");
    } else {
        info!(
            candles = state.series().len(),
            capacity = state.series().capacity(),
            "Chart seeded from history"
        );
    }

    // ── 4. Live feed ─────────────────────────────────────────────────────
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let transport = WsTransport::new(state.config.ws_url.clone(), event_tx);
    let supervisor = Arc::new(StreamSupervisor::new(
        transport,
        Arc::clone(&state.reconciler),
        state.channels(),
    ));

    info!(
        url = %supervisor.transport().url(),
        channels = ?state.channels(),
        "Opening live feed"
    );
    supervisor
        .connect()
        .context("failed to start the live feed connection")?;

    let feed_task = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run(event_rx).await })
    };

    if !supervisor.wait_subscribed(state.config.subscribe_grace()).await {
        warn!(
            state = %supervisor.state(),
            "Live feed not subscribed within grace period, rendering anyway"
        );
    }

    // ── 5. Render loop ───────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let render_task = tokio::spawn(render::run_render_loop(
        state.config.symbol.clone(),
        Arc::clone(state.series()),
        Arc::new(LogRenderer),
        state.config.render_interval(),
        shutdown_rx,
    ));

    info!("Live chart running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    let mut feed_state = supervisor.watch_state();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        closed = feed_state.wait_for(|s| *s == StreamState::Closed) => {
            // Release the watch borrow before waiting on.
            drop(closed);
            warn!("Live feed closed, chart keeps the last data until Ctrl+C");
            tokio::signal::ctrl_c().await?;
        }
    }
    warn!("Shutdown signal received, stopping gracefully");

    if let Err(e) = supervisor.close() {
        error!(error = %e, "Failed to close live feed");
    }
    if tokio::time::timeout(Duration::from_secs(5), feed_task).await.is_err() {
        warn!("Live feed did not close within 5s");
    }

    let _ = shutdown_tx.send(true);
    match render_task.await {
        Ok(frames) => info!(frames, "Render loop finished"),
        Err(e) => error!(error = %e, "Render loop task failed"),
    }

    match serde_json::to_string(&state.status()) {
        Ok(json) => info!(status = %json, "Final chart status"),
        Err(e) => warn!(error = %e, "Failed to serialise final status"),
    }

    info!("Live Candles shut down complete.");
    Ok(())
}
