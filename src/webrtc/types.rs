//! Signaling and negotiation types compatible with the browser client
//!
//! Relay events are named `room/*` and carry browser-shaped JSON payloads:
//! session descriptions as `{type, sdp}` and ICE candidates as
//! `{candidate, sdpMid, sdpMLineIndex, usernameFragment}`.

use serde::{Deserialize, Serialize};

/// Default label for the data channel created by the initiator
pub const CHANNEL_LABEL: &str = "peerdrop";

/// Default size of an outbound binary chunk in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 16_000;

/// Peer identifier assigned by the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
            SdpKind::Pranswer => write!(f, "pranswer"),
            SdpKind::Rollback => write!(f, "rollback"),
        }
    }
}

/// Offer or answer exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Events delivered by the relay, tagged with the sending peer's id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingEvent {
    #[serde(rename = "room/join")]
    Join { id: PeerId },
    #[serde(rename = "room/offer")]
    Offer { id: PeerId, offer: SessionDescription },
    /// The answer travels in a field named `offer`
    #[serde(rename = "room/accept")]
    Accept { id: PeerId, offer: SessionDescription },
    #[serde(rename = "room/icecandidate")]
    IceCandidate { id: PeerId, candidate: IceCandidate },
}

impl SignalingEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingEvent::Join { .. } => "room/join",
            SignalingEvent::Offer { .. } => "room/offer",
            SignalingEvent::Accept { .. } => "room/accept",
            SignalingEvent::IceCandidate { .. } => "room/icecandidate",
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        match self {
            SignalingEvent::Join { id } => id,
            SignalingEvent::Offer { id, .. } => id,
            SignalingEvent::Accept { id, .. } => id,
            SignalingEvent::IceCandidate { id, .. } => id,
        }
    }
}

/// Events emitted to the relay, routed by `receiverId`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingMessage {
    #[serde(rename = "room/join")]
    Join,
    #[serde(rename = "room/offer")]
    Offer {
        #[serde(rename = "receiverId")]
        receiver_id: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "room/accept")]
    Accept {
        #[serde(rename = "receiverId")]
        receiver_id: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "room/icecandidate")]
    IceCandidate {
        #[serde(rename = "receiverId")]
        receiver_id: PeerId,
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingMessage::Join => "room/join",
            SignalingMessage::Offer { .. } => "room/offer",
            SignalingMessage::Accept { .. } => "room/accept",
            SignalingMessage::IceCandidate { .. } => "room/icecandidate",
        }
    }

    pub fn receiver(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Join => None,
            SignalingMessage::Offer { receiver_id, .. } => Some(receiver_id),
            SignalingMessage::Accept { receiver_id, .. } => Some(receiver_id),
            SignalingMessage::IceCandidate { receiver_id, .. } => Some(receiver_id),
        }
    }
}

/// Negotiation progress of the side that discovered the peer via `room/join`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Created,
    DataChannelCreated,
    OfferCreated,
    LocalDescriptionSet,
    /// Waiting for the answer
    OfferSent,
    Connected,
}

/// Negotiation progress of the side that received a `room/offer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Created,
    RemoteDescriptionSet,
    AnswerCreated,
    LocalDescriptionSet,
    AnswerSent,
    Connected,
}

/// Per-peer negotiation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Initiator(InitiatorState),
    Responder(ResponderState),
}

impl Negotiation {
    pub fn role(&self) -> Role {
        match self {
            Negotiation::Initiator(_) => Role::Initiator,
            Negotiation::Responder(_) => Role::Responder,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Negotiation::Initiator(InitiatorState::Connected)
                | Negotiation::Responder(ResponderState::Connected)
        )
    }
}

impl std::fmt::Display for Negotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Negotiation::Initiator(s) => write!(f, "initiator/{:?}", s),
            Negotiation::Responder(s) => write!(f, "responder/{:?}", s),
        }
    }
}

/// Which side of the offer/answer exchange we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Data channel `readyState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closing => write!(f, "closing"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}
