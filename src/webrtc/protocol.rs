//! Data channel protocol: JSON control messages and raw binary chunks
//!
//! Control messages are text frames `{"type": ..., "payload": {...}}`.
//! Binary frames carry the bytes of the transfer most recently announced
//! with `file/download/setup` on the same channel.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

use super::transport::{ChannelMessage, DataChannel};
use super::types::PeerId;
use crate::error::{Error, Result};
use crate::files::{FileMetadata, SharedFile};

/// Payload naming a single file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileName {
    pub name: String,
}

/// Sent by the holder right before streaming chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSetup {
    pub name: String,
    pub size: u64,
}

/// Control messages exchanged on the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    /// Announce a file the sender owns
    #[serde(rename = "file/new")]
    FileNew(FileMetadata),
    /// Withdraw a previously announced file
    #[serde(rename = "file/remove")]
    FileRemove(FileName),
    /// Ask the holder to stream a file
    #[serde(rename = "file/download")]
    FileDownload(FileName),
    #[serde(rename = "file/download/setup")]
    DownloadSetup(TransferSetup),
}

impl ControlMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            ControlMessage::FileNew(_) => "file/new",
            ControlMessage::FileRemove(_) => "file/remove",
            ControlMessage::FileDownload(_) => "file/download",
            ControlMessage::DownloadSetup(_) => "file/download/setup",
        }
    }

    pub fn download(name: &str) -> Self {
        ControlMessage::FileDownload(FileName {
            name: name.to_string(),
        })
    }

    pub fn remove(name: &str) -> Self {
        ControlMessage::FileRemove(FileName {
            name: name.to_string(),
        })
    }

    pub fn setup(name: &str, size: u64) -> Self {
        ControlMessage::DownloadSetup(TransferSetup {
            name: name.to_string(),
            size,
        })
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Transport(e.into()))
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Control(ControlMessage),
    Binary(Bytes),
}

/// Classify a frame: anything with a byte payload is data, text must be control JSON
pub fn decode(message: ChannelMessage) -> Result<Incoming> {
    match message {
        ChannelMessage::Binary(data) => Ok(Incoming::Binary(data)),
        ChannelMessage::Text(text) => serde_json::from_str::<ControlMessage>(&text)
            .map(Incoming::Control)
            .map_err(|e| Error::MalformedControlMessage(format!("{}: {}", e, truncate(&text)))),
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= 64 {
        text.to_string()
    } else {
        let mut end = 64;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

/// Encode and send one control message
pub async fn send_control(
    channel: &Arc<dyn DataChannel>,
    peer_id: &PeerId,
    msg: &ControlMessage,
) -> Result<()> {
    if !channel.is_open() {
        return Err(Error::ChannelTerminated(peer_id.clone()));
    }
    let json = msg.encode()?;
    channel.send_text(json).await?;
    trace!("[Peer {}] Sent {}", peer_id.short(), msg.msg_type());
    Ok(())
}

/// Result of feeding one chunk to an accumulator
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Progress { received: u64, size: u64 },
    Complete(CompletedFile),
}

/// A fully received file
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedFile {
    pub name: String,
    pub data: Bytes,
}

/// Receive-side state of one transfer on one channel
#[derive(Debug)]
pub struct Accumulator {
    name: String,
    size: u64,
    chunks: Vec<Bytes>,
    received: u64,
}

impl Accumulator {
    pub fn new(setup: TransferSetup) -> Self {
        Self {
            name: setup.name,
            size: setup.size,
            chunks: Vec::new(),
            received: 0,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.size
    }

    /// Append a chunk. Once complete, the accumulator must be discarded.
    pub fn push(&mut self, chunk: Bytes) -> ChunkOutcome {
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);

        if self.is_complete() {
            ChunkOutcome::Complete(self.take())
        } else {
            ChunkOutcome::Progress {
                received: self.received,
                size: self.size,
            }
        }
    }

    /// Concatenate everything received so far
    pub fn take(&mut self) -> CompletedFile {
        let mut data = BytesMut::with_capacity(self.received as usize);
        for chunk in self.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        CompletedFile {
            name: self.name.clone(),
            data: data.freeze(),
        }
    }
}

/// Stream `file` over `channel`: setup first, then sequential chunks
///
/// Chunk `n + 1` is not read before chunk `n` has been read and handed to
/// the channel. Returns the number of chunks sent.
pub async fn send_file(
    channel: Arc<dyn DataChannel>,
    peer_id: PeerId,
    file: SharedFile,
    chunk_size: usize,
) -> Result<usize> {
    let size = file.size();
    let chunk_size = chunk_size.max(1) as u64;

    send_control(&channel, &peer_id, &ControlMessage::setup(file.name(), size)).await?;

    let mut offset = 0u64;
    let mut chunks = 0usize;
    while offset < size {
        let end = (offset + chunk_size).min(size);
        let data = file.source.read_range(offset, end).await?;

        if !channel.is_open() {
            debug!(
                "[Peer {}] Channel closed after {} of {} bytes of {}",
                peer_id.short(),
                offset,
                size,
                file.name()
            );
            return Err(Error::ChannelTerminated(peer_id));
        }
        channel.send_binary(data).await?;
        trace!("[Peer {}] Sent chunk {}..{}", peer_id.short(), offset, end);

        offset = end;
        chunks += 1;
    }

    Ok(chunks)
}
