// =============================================================================
// Price Alerts: one-shot threshold watchers over the latest price
// =============================================================================
//
// An alert is armed when registered and latches the first time the price
// reaches its threshold.  There is no re-arming and no removal.
// =============================================================================

use std::str::FromStr;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::market_data::PriceHook;

/// Side of the threshold that fires the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDirection {
    Above,
    Below,
}

impl std::fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Above => write!(f, "above"),
            Self::Below => write!(f, "below"),
        }
    }
}

impl FromStr for AlertDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "above" => Ok(Self::Above),
            "below" => Ok(Self::Below),
            other => Err(format!("unknown alert direction '{other}', expected above or below")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub threshold: Decimal,
    pub direction: AlertDirection,
    pub triggered: bool,
}

impl PriceAlert {
    fn crossed_by(&self, price: Decimal) -> bool {
        match self.direction {
            AlertDirection::Above => price >= self.threshold,
            AlertDirection::Below => price <= self.threshold,
        }
    }
}

/// Emitted once per alert, the moment it latches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFired {
    pub threshold: Decimal,
    pub direction: AlertDirection,
    pub price: Decimal,
}

/// Alert definition as written in config or `CHART_ALERTS`: `above:3300`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSpec {
    pub direction: AlertDirection,
    pub threshold: Decimal,
}

impl FromStr for AlertSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (direction, threshold) = s
            .split_once(':')
            .ok_or_else(|| format!("alert '{s}' must look like above:3300 or below:3200"))?;
        let direction = direction.parse()?;
        let threshold = Decimal::from_str(threshold.trim())
            .map_err(|e| format!("alert threshold '{threshold}' is not a decimal: {e}"))?;
        Ok(Self { direction, threshold })
    }
}

/// Parse a comma-separated list of alert specs, e.g. `above:3300,below:3200`.
pub fn parse_alert_list(s: &str) -> Result<Vec<AlertSpec>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(AlertSpec::from_str)
        .collect()
}

// ---------------------------------------------------------------------------
// AlertEngine
// ---------------------------------------------------------------------------

/// Holds every registered alert in registration order.
pub struct AlertEngine {
    alerts: Mutex<Vec<PriceAlert>>,
    events: Option<mpsc::UnboundedSender<AlertFired>>,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            events: None,
        }
    }

    /// Publish every fired alert on `tx` in addition to logging it.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AlertFired>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Add an armed alert.  Duplicates are allowed and fire independently.
    pub fn register(&self, threshold: Decimal, direction: AlertDirection) {
        self.alerts.lock().push(PriceAlert {
            threshold,
            direction,
            triggered: false,
        });
        info!(%threshold, %direction, "price alert added");
    }

    /// Check every armed alert against `current_price`, latching the ones it
    /// crosses.  Returns the alerts that fired during this call.
    pub fn evaluate(&self, current_price: Decimal) -> Vec<AlertFired> {
        let fired: Vec<AlertFired> = {
            let mut alerts = self.alerts.lock();
            alerts
                .iter_mut()
                .filter(|a| !a.triggered)
                .filter(|a| a.crossed_by(current_price))
                .map(|a| {
                    a.triggered = true;
                    AlertFired {
                        threshold: a.threshold,
                        direction: a.direction,
                        price: current_price,
                    }
                })
                .collect()
        };

        for event in &fired {
            warn!(
                price = %event.price,
                threshold = %event.threshold,
                direction = %event.direction,
                "ALERT: price is {} {}",
                event.direction,
                event.threshold
            );
            if let Some(tx) = &self.events {
                if tx.send(*event).is_err() {
                    debug!("alert receiver dropped, event only logged");
                }
            }
        }

        fired
    }

    /// Copy of all alerts, armed and triggered.
    pub fn alerts(&self) -> Vec<PriceAlert> {
        self.alerts.lock().clone()
    }

    pub fn armed_count(&self) -> usize {
        self.alerts.lock().iter().filter(|a| !a.triggered).count()
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceHook for AlertEngine {
    fn on_price(&self, price: Decimal) {
        self.evaluate(price);
    }
}

impl std::fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let alerts = self.alerts.lock();
        f.debug_struct("AlertEngine")
            .field("registered", &alerts.len())
            .field("armed", &alerts.iter().filter(|a| !a.triggered).count())
            .finish()
    }
}
