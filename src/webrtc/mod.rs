//! WebRTC peer-to-peer file sharing
//!
//! Peers meet through a WebSocket relay room:
//! - Relay events: room/join, room/offer, room/accept, room/icecandidate
//! - One data channel per peer pair, labelled `peerdrop`
//! - Control messages: file/new, file/remove, file/download, file/download/setup

pub mod manager;
pub mod peer;
pub mod protocol;
pub mod rtc;
pub mod signaling;
pub mod transport;
mod types;


pub use manager::{Command, ManagerHandle, ShareManager};
pub use peer::PeerEngine;
pub use protocol::{ControlMessage, FileName, TransferSetup};
pub use rtc::RtcConnectionFactory;
pub use signaling::{SignalingClient, SignalingTransport, WsSignaling};
pub use transport::{
    ChannelMessage, ConnectionFactory, DataChannel, LinkState, PeerConnection, PeerEvent,
};
pub use types::{
    ChannelState, IceCandidate, InitiatorState, Negotiation, PeerId, ResponderState, Role,
    SdpKind, SessionDescription, SignalingEvent, SignalingMessage, CHANNEL_LABEL,
    DEFAULT_CHUNK_SIZE,
};
