//! Duplex text transport to the evaluation service
//!
//! The session only needs a fire-and-forget `send`, an explicit `close` and a
//! stream of lifecycle events. [`WsConnector`] provides that on top of a
//! `tokio-tungstenite` WebSocket; tests substitute their own [`Connector`].
//!
//! # Socket Task
//!
//! ```text
//! Session loop                       Socket task (tokio)
//! ┌──────────────┐   outgoing    ┌──────────────────────────┐
//! │ send()/close │──channel────▶ │ connect → Open           │
//! │              │               │ write frames             │
//! │ events rx    │ ◀──channel─── │ read → Message / Close   │
//! └──────────────┘               │ errors → Error           │
//!                                └──────────────────────────┘
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
};

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle events reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// An open (or opening) connection
///
/// Sends never block and never fail synchronously; failures arrive later as
/// `TransportEvent::Error`.
pub trait Transport: Send {
    fn send(&mut self, text: String);
    fn close(&mut self);
}

/// Opens transports. Events for the new transport are delivered on `events`.
pub trait Connector: Send + Sync {
    fn open(&self, url: &str, events: TransportEventSender) -> Box<dyn Transport>;
}

enum Outgoing {
    Text(String),
    Close,
}

/// WebSocket connector (rustls, webpki roots)
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector {
    pub fn new() -> Self {
        // Fails only if a provider is already installed, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            connect_timeout: CONNECTION_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str, events: TransportEventSender) -> Box<dyn Transport> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(
            url.to_string(),
            self.connect_timeout,
            outgoing_rx,
            events,
        ));
        Box::new(WsTransport {
            outgoing: outgoing_tx,
        })
    }
}

struct WsTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for WsTransport {
    fn send(&mut self, text: String) {
        if self.outgoing.send(Outgoing::Text(text)).is_err() {
            log::debug!("WebSocket task already gone, frame discarded");
        }
    }

    fn close(&mut self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

async fn run_socket(
    url: String,
    connect_timeout: Duration,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: TransportEventSender,
) {
    let request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            let _ = events.send(TransportEvent::Error(format!("invalid URL: {}", e)));
            return;
        }
    };

    log::info!("Connecting to evaluation service...");

    let ws_stream = match timeout(
        connect_timeout,
        connect_async_with_config(request, None, true),
    )
    .await
    {
        Ok(Ok((ws_stream, _response))) => ws_stream,
        Ok(Err(e)) => {
            let _ = events.send(TransportEvent::Error(e.to_string()));
            return;
        }
        Err(_) => {
            let _ = events.send(TransportEvent::Error("Connection timeout".to_string()));
            return;
        }
    };

    log::info!("WebSocket connected");
    let _ = events.send(TransportEvent::Open);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            next = outgoing.recv() => match next {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        log::warn!("WebSocket send failed: {}", e);
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                // Explicit close, or the session dropped its transport
                Some(Outgoing::Close) | None => {
                    if let Err(e) = write.close().await {
                        log::debug!("Error closing WebSocket: {}", e);
                    }
                    let _ = events.send(TransportEvent::Close);
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("WebSocket closed by server: {:?}", frame);
                    let _ = events.send(TransportEvent::Close);
                    break;
                }
                Some(Ok(_)) => {} // Ignore ping/pong/binary
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    let _ = events.send(TransportEvent::Close);
                    break;
                }
            },
        }
    }

    log::debug!("WebSocket task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WsConnector::new().open("not a url", tx);

        match rx.recv().await {
            Some(TransportEvent::Error(msg)) => assert!(msg.contains("invalid URL")),
            other => panic!("Expected Error event, got {:?}", other),
        }

        // Sending on a dead transport is a no-op
        transport.send("{}".to_string());
        transport.close();
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _transport = WsConnector::new()
            .with_connect_timeout(Duration::from_secs(2))
            .open("ws://127.0.0.1:1/v2/open-ise", tx);

        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(_))));
    }
}
