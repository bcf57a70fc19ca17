// =============================================================================
// Stream Supervisor: connection lifecycle for one live feed
// =============================================================================
//
//   Disconnected ─connect()─▶ Connecting ─Open─▶ Connected{subscribed:false}
//        │                                              │ subscribe requests sent
//        │ close()                                      ▼
//        └───────────────▶ Closed ◀──Close── Connected{subscribed:true}
//
// `Closed` is terminal: a caller that wants to resume builds a new supervisor
// around a new transport.  Transport errors are recorded and logged; only the
// transport's `Close` event ends the connection.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{StreamError, TransportError};
use crate::market_data::{FeedReconciler, ReconcileOutcome};
use crate::stream::transport::{Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected { subscribed: bool },
    Closed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { subscribed: false } => write!(f, "Connected"),
            Self::Connected { subscribed: true } => write!(f, "Subscribed"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Subscription request understood by the upstream feed.
pub fn subscribe_message(channel: &str, symbol: &str) -> String {
    json!({
        "type": "subscribe",
        "payload": {
            "channels": [
                { "name": channel, "symbols": [symbol] }
            ]
        }
    })
    .to_string()
}

/// Drives one transport connection and feeds its messages to a reconciler.
pub struct StreamSupervisor<T: Transport> {
    transport: T,
    reconciler: Arc<FeedReconciler>,
    channels: Vec<String>,
    state: watch::Sender<StreamState>,
    last_error: Mutex<Option<TransportError>>,
    error_count: AtomicU64,
}

impl<T: Transport> StreamSupervisor<T> {
    /// `channels` are subscribed, in order, for the reconciler's symbol once
    /// the transport opens.
    pub fn new(transport: T, reconciler: Arc<FeedReconciler>, channels: Vec<String>) -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        Self {
            transport,
            reconciler,
            channels,
            state,
            last_error: Mutex::new(None),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Observe state transitions from another task.
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn last_error(&self) -> Option<TransportError> {
        self.last_error.lock().clone()
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Start connecting.  Only valid from `Disconnected`.
    pub fn connect(&self) -> Result<(), StreamError> {
        let current = self.state();
        if current != StreamState::Disconnected {
            return Err(StreamError::InvalidState {
                action: "connect",
                state: current.to_string(),
            });
        }

        self.transition(StreamState::Connecting);
        if let Err(e) = self.transport.open() {
            error!(error = %e, "transport failed to open");
            self.transition(StreamState::Disconnected);
            return Err(e.into());
        }
        Ok(())
    }

    /// Ask the transport to close.  The state becomes `Closed` when the
    /// transport confirms; calling this again after that is a no-op.
    pub fn close(&self) -> Result<(), StreamError> {
        match self.state() {
            StreamState::Closed => Ok(()),
            StreamState::Disconnected => {
                self.transition(StreamState::Closed);
                Ok(())
            }
            StreamState::Connecting | StreamState::Connected { .. } => {
                info!(symbol = %self.reconciler.symbol(), "closing feed connection");
                if let Err(e) = self.transport.close() {
                    // Nothing will report the close for us.
                    warn!(error = %e, "transport rejected close, marking stream closed");
                    self.transition(StreamState::Closed);
                }
                Ok(())
            }
        }
    }

    /// Apply one transport event.  Returns the reconcile outcome for
    /// delivered messages.
    pub fn handle_event(&self, event: TransportEvent) -> Option<ReconcileOutcome> {
        match event {
            TransportEvent::Open => {
                self.on_open();
                None
            }
            TransportEvent::Message(text) => self.on_message(&text),
            TransportEvent::Error(e) => {
                error!(symbol = %self.reconciler.symbol(), error = %e, "feed transport error");
                self.error_count.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(e);
                None
            }
            TransportEvent::Close { code, reason } => {
                info!(
                    symbol = %self.reconciler.symbol(),
                    code = ?code,
                    reason = %reason,
                    "feed connection closed"
                );
                self.transition(StreamState::Closed);
                None
            }
        }
    }

    /// Consume transport events until the connection is closed.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while self.state() != StreamState::Closed {
            match events.recv().await {
                Some(event) => {
                    self.handle_event(event);
                }
                None => {
                    warn!("transport event channel ended without a close");
                    self.transition(StreamState::Closed);
                }
            }
        }
        debug!(symbol = %self.reconciler.symbol(), "stream supervisor finished");
    }

    /// Wait up to `grace` for the subscriptions to go out.  Returns whether
    /// they did.
    pub async fn wait_subscribed(&self, grace: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let reached = tokio::time::timeout(
            grace,
            rx.wait_for(|s| {
                matches!(s, StreamState::Connected { subscribed: true } | StreamState::Closed)
            }),
        )
        .await;

        match reached {
            Ok(Ok(state)) => *state == StreamState::Connected { subscribed: true },
            _ => false,
        }
    }

    fn on_open(&self) {
        if self.state() != StreamState::Connecting {
            warn!(state = %self.state(), "unexpected transport open, ignoring");
            return;
        }
        self.transition(StreamState::Connected { subscribed: false });

        let symbol = self.reconciler.symbol();
        for channel in &self.channels {
            if let Err(e) = self.transport.send(subscribe_message(channel, symbol)) {
                error!(channel = %channel, error = %e, "failed to send subscription");
                return;
            }
        }

        info!(symbol = %symbol, channels = ?self.channels, "subscribed to live feeds");
        self.transition(StreamState::Connected { subscribed: true });
    }

    fn on_message(&self, text: &str) -> Option<ReconcileOutcome> {
        match self.state() {
            StreamState::Connected { .. } => Some(self.reconciler.handle_message(text)),
            other => {
                debug!(state = %other, "dropping message outside a live connection");
                None
            }
        }
    }

    fn transition(&self, next: StreamState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "stream state changed");
        }
    }
}

impl<T: Transport> std::fmt::Debug for StreamSupervisor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("symbol", &self.reconciler.symbol())
            .field("state", &self.state())
            .field("channels", &self.channels)
            .field("error_count", &self.error_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::CandleSeries;
    use serde_json::Value;

    /// In-memory transport that records what the supervisor asks of it.
    #[derive(Default)]
    struct ScriptedTransport {
        opened: AtomicU64,
        closes: AtomicU64,
        sent: Mutex<Vec<String>>,
        fail_send: bool,
    }

    impl Transport for ScriptedTransport {
        fn open(&self) -> Result<(), TransportError> {
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn send(&self, text: String) -> Result<(), TransportError> {
            if self.fail_send {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().push(text);
            Ok(())
        }

        fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn supervisor_with(transport: ScriptedTransport) -> StreamSupervisor<ScriptedTransport> {
        let series = Arc::new(CandleSeries::new(10));
        let reconciler = Arc::new(FeedReconciler::new(
            "ETHUSD",
            "candlestick_1m",
            "v2/ticker",
            series,
        ));
        StreamSupervisor::new(
            transport,
            reconciler,
            vec!["candlestick_1m".into(), "v2/ticker".into()],
        )
    }

    fn supervisor() -> StreamSupervisor<ScriptedTransport> {
        supervisor_with(ScriptedTransport::default())
    }

    const CANDLE: &str = r#"{"type":"candlestick_1m","symbol":"ETHUSD","candle_start_time":60000000,"open":"1","high":"2","low":"1","close":"2","volume":"3"}"#;

    #[test]
    fn subscribe_message_matches_wire_format() {
        let msg: Value = serde_json::from_str(&subscribe_message("candlestick_1m", "ETHUSD")).unwrap();
        assert_eq!(
            msg,
            json!({
                "type": "subscribe",
                "payload": { "channels": [{ "name": "candlestick_1m", "symbols": ["ETHUSD"] }] }
            })
        );
    }

    #[test]
    fn open_subscribes_to_both_channels() {
        let sup = supervisor();
        assert_eq!(sup.state(), StreamState::Disconnected);

        sup.connect().unwrap();
        assert_eq!(sup.state(), StreamState::Connecting);
        assert_eq!(sup.transport().opened.load(Ordering::Relaxed), 1);

        sup.handle_event(TransportEvent::Open);
        assert_eq!(sup.state(), StreamState::Connected { subscribed: true });

        let sent = sup.transport().sent.lock().clone();
        assert_eq!(
            sent,
            vec![
                subscribe_message("candlestick_1m", "ETHUSD"),
                subscribe_message("v2/ticker", "ETHUSD"),
            ]
        );
    }

    #[test]
    fn failed_subscription_leaves_connection_unsubscribed() {
        let sup = supervisor_with(ScriptedTransport {
            fail_send: true,
            ..Default::default()
        });
        sup.connect().unwrap();
        sup.handle_event(TransportEvent::Open);
        assert_eq!(sup.state(), StreamState::Connected { subscribed: false });
    }

    #[test]
    fn connect_twice_is_rejected() {
        let sup = supervisor();
        sup.connect().unwrap();
        assert_eq!(
            sup.connect(),
            Err(StreamError::InvalidState {
                action: "connect",
                state: "Connecting".into()
            })
        );
        assert_eq!(sup.transport().opened.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn messages_only_reach_the_reconciler_while_connected() {
        let sup = supervisor();
        sup.connect().unwrap();

        assert_eq!(sup.handle_event(TransportEvent::Message(CANDLE.into())), None);

        sup.handle_event(TransportEvent::Open);
        let outcome = sup.handle_event(TransportEvent::Message(CANDLE.into()));
        assert!(matches!(outcome, Some(ReconcileOutcome::CandleUpdated(c)) if c.time == 60));
        assert_eq!(sup.reconciler.series().len(), 1);
    }

    #[test]
    fn transport_error_is_recorded_without_closing() {
        let sup = supervisor();
        sup.connect().unwrap();
        sup.handle_event(TransportEvent::Open);

        sup.handle_event(TransportEvent::Error(TransportError::Socket("reset".into())));
        assert_eq!(sup.state(), StreamState::Connected { subscribed: true });
        assert_eq!(sup.error_count(), 1);
        assert_eq!(sup.last_error(), Some(TransportError::Socket("reset".into())));
    }

    #[test]
    fn close_waits_for_transport_and_is_idempotent() {
        let sup = supervisor();
        sup.connect().unwrap();
        sup.handle_event(TransportEvent::Open);

        sup.close().unwrap();
        assert_eq!(sup.transport().closes.load(Ordering::Relaxed), 1);
        assert_eq!(sup.state(), StreamState::Connected { subscribed: true });

        sup.handle_event(TransportEvent::Close {
            code: Some(1000),
            reason: "bye".into(),
        });
        assert_eq!(sup.state(), StreamState::Closed);

        sup.close().unwrap();
        sup.close().unwrap();
        assert_eq!(sup.transport().closes.load(Ordering::Relaxed), 1);

        // Late frames after closure are dropped.
        assert_eq!(sup.handle_event(TransportEvent::Message(CANDLE.into())), None);
    }

    #[test]
    fn close_before_connect_goes_straight_to_closed() {
        let sup = supervisor();
        sup.close().unwrap();
        assert_eq!(sup.state(), StreamState::Closed);
        assert_eq!(sup.transport().closes.load(Ordering::Relaxed), 0);
        assert!(sup.connect().is_err());
    }

    #[tokio::test]
    async fn run_processes_events_in_order_until_close() {
        let sup = Arc::new(supervisor());
        let (tx, rx) = mpsc::unbounded_channel();
        sup.connect().unwrap();

        let runner = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.run(rx).await })
        };

        assert!(!sup.wait_subscribed(Duration::from_millis(50)).await);

        tx.send(TransportEvent::Open).unwrap();
        assert!(sup.wait_subscribed(Duration::from_secs(5)).await);

        tx.send(TransportEvent::Message(CANDLE.into())).unwrap();
        tx.send(TransportEvent::Message(CANDLE.replace("\"close\":\"2\"", "\"close\":\"1.5\""))).unwrap();
        tx.send(TransportEvent::Close { code: Some(1000), reason: String::new() }).unwrap();

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sup.state(), StreamState::Closed);
        let series = sup.reconciler.series();
        assert_eq!(series.len(), 1);
        assert_eq!(series.latest().unwrap().close.to_string(), "1.5");
    }

    #[tokio::test]
    async fn run_stops_when_the_event_channel_ends() {
        let sup = supervisor();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx);
        sup.run(rx).await;
        assert_eq!(sup.state(), StreamState::Closed);
        assert!(!sup.wait_subscribed(Duration::from_millis(10)).await);
    }
}
