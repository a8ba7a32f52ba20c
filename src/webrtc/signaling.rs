//! Signaling over a WebSocket relay
//!
//! The relay forwards named JSON events between room members. Each frame is
//! `{"event": "room/...", "data": {...}}`; outbound events carry `receiverId`,
//! inbound events carry the sender's `id`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::{IceCandidate, PeerId, SessionDescription, SignalingEvent, SignalingMessage};

/// Outbound half of the relay connection
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn emit(&self, msg: SignalingMessage) -> Result<()>;
}

/// Translates negotiation intents into relay events
#[derive(Clone)]
pub struct SignalingClient {
    transport: Arc<dyn SignalingTransport>,
}

impl SignalingClient {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self { transport }
    }

    /// Announce ourselves to the room
    pub async fn join(&self) -> Result<()> {
        info!("Joining room");
        self.transport.emit(SignalingMessage::Join).await
    }

    pub async fn send_offer(&self, receiver: &PeerId, offer: SessionDescription) -> Result<()> {
        self.transport
            .emit(SignalingMessage::Offer {
                receiver_id: receiver.clone(),
                offer,
            })
            .await
    }

    pub async fn send_answer(&self, receiver: &PeerId, answer: SessionDescription) -> Result<()> {
        self.transport
            .emit(SignalingMessage::Accept {
                receiver_id: receiver.clone(),
                offer: answer,
            })
            .await
    }

    pub async fn send_candidate(&self, receiver: &PeerId, candidate: IceCandidate) -> Result<()> {
        self.transport
            .emit(SignalingMessage::IceCandidate {
                receiver_id: receiver.clone(),
                candidate,
            })
            .await
    }
}

/// Parse one relay frame; unknown events yield `None`
pub fn parse_event(text: &str) -> Option<SignalingEvent> {
    match serde_json::from_str::<SignalingEvent>(text) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Ignoring relay frame ({}): {}", e, text);
            None
        }
    }
}

/// WebSocket connection to the relay
pub struct WsSignaling {
    outgoing: mpsc::UnboundedSender<SignalingMessage>,
}

impl WsSignaling {
    /// Connect to `url`. Inbound events arrive on the returned receiver,
    /// which ends when the socket closes.
    ///
    /// Emitting never waits on the socket task, which may itself be parked
    /// handing an inbound event to the caller.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<SignalingEvent>)> {
        info!("Connecting to relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to relay {}", url))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (event_tx, event_rx) = mpsc::channel::<SignalingEvent>(100);
        let url = url.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outgoing_rx.recv() => {
                        let Some(msg) = msg else {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        };
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                error!("Failed to encode {}: {}", msg.event_name(), e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            error!("Failed to send {} to {}: {}", msg.event_name(), url, e);
                            break;
                        }
                        debug!("Sent {} to {}", msg.event_name(), url);
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) = parse_event(text.as_str()) {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                warn!("Relay connection closed: {}", url);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error from {}: {}", url, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok((Self { outgoing: outgoing_tx }, event_rx))
    }
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    async fn emit(&self, msg: SignalingMessage) -> Result<()> {
        self.outgoing
            .send(msg)
            .map_err(|_| anyhow::anyhow!("Relay connection is closed"))
    }
}
