//! Signaling channel
//!
//! Owns exactly one duplex WebSocket to the signaling relay. Inbound frames
//! are decoded into [`SignalingEvent`] values and dispatched in arrival order
//! to a single consumer; outbound envelopes are serialized through a writer
//! task. The channel never reconnects: any transport failure surfaces as an
//! `Error` event followed by `Close`, and the owner decides what comes next.

use super::message::{ClientEnvelope, SignalKind, SignalingEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Channel-level errors (connection setup only; runtime failures become events)
#[derive(Debug)]
pub enum ChannelError {
    /// The WebSocket connection could not be established
    Connect(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Connect(msg) => write!(f, "Signaling connect failed: {}", msg),
        }
    }
}

impl Error for ChannelError {}

/// Handle to one open signaling connection.
///
/// Cheap to clone; all clones refer to the same underlying socket.
#[derive(Clone)]
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<Message>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    closed: Arc<AtomicBool>,
}

impl SignalingChannel {
    /// Open the connection, register with the pairing code and role, and
    /// return the channel plus the ordered event receiver.
    pub async fn connect(
        ws_url: &str,
        code: &str,
        role: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), ChannelError> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        debug!("Signaling connected to {}", ws_url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let channel = Self {
            outbound: outbound_tx.clone(),
            events_tx: events_tx.clone(),
            closed: closed.clone(),
        };

        // Register before anything else so the relay binds this socket to the code.
        let register = ClientEnvelope::Register {
            code: code.to_string(),
            role: role.to_string(),
        };
        match register.to_json() {
            Ok(json) => {
                let _ = outbound_tx.send(Message::Text(json));
            }
            Err(e) => return Err(ChannelError::Connect(e.to_string())),
        }

        let reader_closed = closed.clone();
        let reader_outbound = outbound_tx;
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                if reader_closed.load(Ordering::SeqCst) {
                    break;
                }
                match msg {
                    Ok(Message::Text(text)) => match SignalingEvent::from_json(&text) {
                        Ok(event) => {
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Dropping undecodable signaling frame: {}", e),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = reader_outbound.send(Message::Pong(data));
                    }
                    Ok(Message::Pong(_)) | Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {}
                    Ok(Message::Close(_)) => {
                        if !reader_closed.swap(true, Ordering::SeqCst) {
                            let _ = events_tx.send(SignalingEvent::Close);
                        }
                        break;
                    }
                    Err(e) => {
                        warn!("Signaling transport error: {}", e);
                        if !reader_closed.swap(true, Ordering::SeqCst) {
                            let _ = events_tx.send(SignalingEvent::Error {
                                message: format!("signaling transport error: {}", e),
                            });
                            let _ = events_tx.send(SignalingEvent::Close);
                        }
                        break;
                    }
                }
            }
            // Stream ended without a close frame: still guarantee a final Close.
            if !reader_closed.swap(true, Ordering::SeqCst) {
                let _ = events_tx.send(SignalingEvent::Close);
            }
        });

        Ok((channel, events_rx))
    }

    /// Transmit one outbound signal envelope.
    ///
    /// Never fails into the caller: sending on a shut channel degrades into a
    /// `Close` event on the consumer side.
    pub fn send_signal(&self, kind: SignalKind, payload: Value) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let envelope = ClientEnvelope::Signal { kind, payload };
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {} signal: {}", kind.as_str(), e);
                return;
            }
        };
        if self.outbound.send(Message::Text(json)).is_err()
            && !self.closed.swap(true, Ordering::SeqCst)
        {
            let _ = self.events_tx.send(SignalingEvent::Close);
        }
    }

    /// Shut the channel down. Idempotent; no further events are dispatched
    /// after the first call.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Message::Close(None));
        }
    }

    /// Whether the channel has been shut (locally or by the transport)
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn stub() -> (
        Self,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedSender<SignalingEvent>,
        mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Self {
            outbound: outbound_tx,
            events_tx: events_tx.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (channel, outbound_rx, events_tx, events_rx)
    }
}

/// Seam for opening signaling connections so the orchestrator can be tested
/// without a relay.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        ws_url: &str,
        code: &str,
        role: &str,
    ) -> Result<(SignalingChannel, mpsc::UnboundedReceiver<SignalingEvent>), ChannelError>;
}

/// The real WebSocket connector
pub struct WebSocketSignaling;

#[async_trait]
impl SignalingConnector for WebSocketSignaling {
    async fn connect(
        &self,
        ws_url: &str,
        code: &str,
        role: &str,
    ) -> Result<(SignalingChannel, mpsc::UnboundedReceiver<SignalingEvent>), ChannelError> {
        SignalingChannel::connect(ws_url, code, role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    /// Minimal relay: accept one socket, check the register envelope, send a
    /// registered event, then hand the socket back for the test to drive.
    async fn accept_and_register(
        listener: TcpListener,
    ) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let envelope: ClientEnvelope = match first {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected text register frame, got {:?}", other),
        };
        assert_eq!(
            envelope,
            ClientEnvelope::Register {
                code: "ABC123".to_string(),
                role: "desktop".to_string(),
            }
        );

        let registered = json!({
            "type": "registered",
            "expiresAt": 1_700_000_300_000u64,
            "peerConnected": false
        });
        ws.send(Message::Text(registered.to_string())).await.unwrap();
        ws
    }

    #[tokio::test]
    async fn test_connect_registers_and_receives_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_and_register(listener));

        let (channel, mut events) =
            SignalingChannel::connect(&format!("ws://{}", addr), "ABC123", "desktop")
                .await
                .unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for registered")
            .expect("event stream ended early");
        assert_eq!(
            event,
            SignalingEvent::Registered {
                expires_at: 1_700_000_300_000,
                peer_connected: false,
            }
        );

        let mut ws = server.await.unwrap();

        // An outbound signal shows up server-side as a signal envelope.
        channel.send_signal(SignalKind::Ice, json!({"candidate": "candidate:0"}));
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for signal frame")
            .unwrap()
            .unwrap();
        match frame {
            Message::Text(text) => {
                let envelope: ClientEnvelope = serde_json::from_str(&text).unwrap();
                match envelope {
                    ClientEnvelope::Signal { kind, .. } => assert_eq!(kind, SignalKind::Ice),
                    other => panic!("Expected signal envelope, got {:?}", other),
                }
            }
            other => panic!("Expected text frame, got {:?}", other),
        }

        channel.close();
        channel.close(); // idempotent
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_server_drop_surfaces_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_and_register(listener));

        let (_channel, mut events) =
            SignalingChannel::connect(&format!("ws://{}", addr), "ABC123", "desktop")
                .await
                .unwrap();

        let first = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, SignalingEvent::Registered { .. }));

        // Drop the server socket without a close handshake.
        let ws = server.await.unwrap();
        drop(ws);

        // The channel must end in a Close, optionally preceded by an Error.
        let mut saw_close = false;
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
            match event {
                SignalingEvent::Close => {
                    saw_close = true;
                    break;
                }
                SignalingEvent::Error { message } => assert!(!message.is_empty()),
                other => panic!("Unexpected event after drop: {:?}", other),
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_send_after_close_is_silent() {
        let (channel, mut outbound, _events_tx, mut events_rx) = SignalingChannel::stub();
        channel.close();

        // The close frame is queued exactly once.
        assert!(matches!(outbound.recv().await, Some(Message::Close(None))));

        channel.send_signal(SignalKind::Offer, json!({"sdp": "v=0"}));
        assert!(outbound.try_recv().is_err());
        assert!(events_rx.try_recv().is_err());
    }
}
