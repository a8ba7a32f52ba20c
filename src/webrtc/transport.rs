//! Seams over the platform's peer connection and data channel
//!
//! The negotiation engine and the transfer coordinator only talk to these
//! traits. Everything the platform reports asynchronously (discovered ICE
//! candidates, inbound channels, open/close, messages) is funnelled into a
//! single `PeerEvent` queue that the manager drains in order.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::types::{ChannelState, IceCandidate, PeerId, SessionDescription};

/// A message as it arrived on a data channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Ordered, reliable message channel to one peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn ready_state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.ready_state() == ChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Negotiated transport to one peer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an outbound data channel. Its events are reported like inbound ones.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections with every callback already registered
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// The returned connection reports candidate discovery, inbound data
    /// channels and state changes on `events` from the moment it exists.
    async fn create(
        &self,
        peer_id: &PeerId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// Coarse peer-connection state, as far as teardown is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from the platform, tagged by remote peer
pub enum PeerEvent {
    /// `None` signals that gathering is complete
    LocalCandidate {
        peer_id: PeerId,
        candidate: Option<IceCandidate>,
    },
    DataChannel {
        peer_id: PeerId,
        channel: Arc<dyn DataChannel>,
    },
    ChannelOpen {
        peer_id: PeerId,
    },
    ChannelClosed {
        peer_id: PeerId,
    },
    ChannelMessage {
        peer_id: PeerId,
        message: ChannelMessage,
    },
    LinkState {
        peer_id: PeerId,
        state: LinkState,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            PeerEvent::LocalCandidate { peer_id, .. } => peer_id,
            PeerEvent::DataChannel { peer_id, .. } => peer_id,
            PeerEvent::ChannelOpen { peer_id } => peer_id,
            PeerEvent::ChannelClosed { peer_id } => peer_id,
            PeerEvent::ChannelMessage { peer_id, .. } => peer_id,
            PeerEvent::LinkState { peer_id, .. } => peer_id,
        }
    }
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate { peer_id, candidate } => f
                .debug_struct("LocalCandidate")
                .field("peer_id", peer_id)
                .field("candidate", candidate)
                .finish(),
            PeerEvent::DataChannel { peer_id, channel } => f
                .debug_struct("DataChannel")
                .field("peer_id", peer_id)
                .field("label", &channel.label())
                .finish(),
            PeerEvent::ChannelOpen { peer_id } => {
                f.debug_struct("ChannelOpen").field("peer_id", peer_id).finish()
            }
            PeerEvent::ChannelClosed { peer_id } => {
                f.debug_struct("ChannelClosed").field("peer_id", peer_id).finish()
            }
            PeerEvent::ChannelMessage { peer_id, message } => f
                .debug_struct("ChannelMessage")
                .field("peer_id", peer_id)
                .field("message", message)
                .finish(),
            PeerEvent::LinkState { peer_id, state } => f
                .debug_struct("LinkState")
                .field("peer_id", peer_id)
                .field("state", state)
                .finish(),
        }
    }
}
