// =============================================================================
// WebSocket Transport: socket I/O behind a callback-style event channel
// =============================================================================
//
// The transport owns the socket task.  It reports everything that happens on
// the wire as `TransportEvent`s, in the order the socket produced them, and
// accepts outbound frames from any thread through `send` / `close`.
//
// A read error is reported as `Error` followed by `Close`: the socket is gone
// at that point, and `Close` is the only event that ends a connection.
// =============================================================================

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(TransportError),
    Close { code: Option<u16>, reason: String },
}

/// Connection handle used by the stream supervisor.
pub trait Transport: Send + Sync {
    /// Start connecting.  Progress is reported as events.
    fn open(&self) -> Result<(), TransportError>;

    /// Queue a text frame.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Start the closing handshake.  The matching `Close` event follows.
    fn close(&self) -> Result<(), TransportError>;
}

/// tokio-tungstenite backed transport.
pub struct WsTransport {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            url: url.into(),
            events,
            outbound: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    /// Must be called from within a tokio runtime.
    fn open(&self) -> Result<(), TransportError> {
        let mut outbound = self.outbound.lock();
        if outbound.is_some() {
            return Err(TransportError::Connect("transport already opened".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *outbound = Some(tx);
        tokio::spawn(run_socket(self.url.clone(), self.events.clone(), rx));
        Ok(())
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&self) -> Result<(), TransportError> {
        match self.outbound.lock().as_ref() {
            // Socket task already gone: nothing left to close.
            Some(tx) => {
                if tx.send(Message::Close(None)).is_err() {
                    debug!("close requested after socket task ended");
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("opened", &self.outbound.lock().is_some())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Socket task
// -----------------------------------------------------------------------------

async fn run_socket(
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    // The supervisor may have gone away; events are then simply dropped.
    let emit = |event: TransportEvent| {
        let _ = events.send(event);
    };

    info!(url = %url, "connecting to feed WebSocket");
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            warn!(url = %url, error = %e, "feed WebSocket connect failed");
            emit(TransportEvent::Error(TransportError::Connect(e.to_string())));
            emit(TransportEvent::Close {
                code: None,
                reason: "connect failed".to_string(),
            });
            return;
        }
    };

    info!(url = %url, "feed WebSocket connected");
    emit(TransportEvent::Open);

    let (mut write, mut read) = ws_stream.split();
    let mut closing = false;

    loop {
        tokio::select! {
            out = outbound.recv(), if !closing => {
                let msg = out.unwrap_or(Message::Close(None));
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "feed WebSocket write error");
                    emit(TransportEvent::Error(TransportError::Socket(e.to_string())));
                    emit(TransportEvent::Close { code: None, reason: e.to_string() });
                    return;
                }
                closing = is_close;
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => emit(TransportEvent::Message(text)),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        emit(TransportEvent::Close { code, reason });
                        return;
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => emit(TransportEvent::Message(text)),
                        Err(e) => debug!(error = %e, "dropping non-UTF-8 binary frame"),
                    },
                    // Ping / Pong / raw frames; tungstenite answers pings.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "feed WebSocket read error");
                        emit(TransportEvent::Error(TransportError::Socket(e.to_string())));
                        emit(TransportEvent::Close { code: None, reason: e.to_string() });
                        return;
                    }
                    None => {
                        emit(TransportEvent::Close {
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                        return;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[test]
    fn send_before_open_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = WsTransport::new("ws://127.0.0.1:1", tx);
        assert_eq!(
            transport.send("hello".into()),
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.close(), Ok(()));
    }

    #[tokio::test]
    async fn round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();

            let mut received = Vec::new();
            while received.len() < 2 {
                if let Some(Ok(Message::Text(t))) = ws.next().await {
                    received.push(t);
                }
            }
            ws.send(Message::Ping(vec![1])).await.unwrap();
            ws.send(Message::Text("{\"type\":\"ticker\"}".into())).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
            ws.send(Message::Binary(b"{\"type\":\"candle\"}".to_vec())).await.unwrap();

            // Drain until the client's close handshake completes.
            while let Some(Ok(_)) = ws.next().await {}
            received
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = WsTransport::new(format!("ws://{addr}"), tx);
        transport.open().unwrap();
        assert!(transport.open().is_err());

        assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
        transport.send("first".into()).unwrap();
        transport.send("second".into()).unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message("{\"type\":\"ticker\"}".into())
        );

        // The invalid UTF-8 frame is dropped, the JSON one is delivered as text.
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message("{\"type\":\"candle\"}".into())
        );

        transport.close().unwrap();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Close { .. }));

        let received = server.await.unwrap();
        assert_eq!(received, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn connect_failure_reports_error_then_close() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = WsTransport::new(format!("ws://{addr}"), tx);
        transport.open().unwrap();

        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Error(TransportError::Connect(_))
        ));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Close { code: None, .. }));
    }
}
