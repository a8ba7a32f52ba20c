//! Error types for peerdrop

use thiserror::Error;

use crate::webrtc::PeerId;

#[derive(Error, Debug)]
pub enum Error {
    /// An action referenced a peer with no live record
    #[error("Peer {0} was not found")]
    UnknownPeer(PeerId),

    #[error("Malformed control message: {0}")]
    MalformedControlMessage(String),

    /// A download was requested while another one is in flight
    #[error("Already downloading {active}")]
    TransferConflict { active: String },

    #[error("Data channel to {0} is not open")]
    ChannelTerminated(PeerId),

    #[error("File not found: {0}")]
    UnknownFile(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
