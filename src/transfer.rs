//! Transfer coordination
//!
//! Keeps the owned and downloadable catalogs in the store, enforces a single
//! in-flight download, answers download requests by streaming chunks, and
//! prunes derived state when a peer goes away.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::files::{FileMetadata, FileSink, SharedFile};
use crate::store::{Download, DownloadableFile, Peer, StatePatch, Store};
use crate::webrtc::peer::PeerEngine;
use crate::webrtc::protocol::{
    decode, send_control, send_file, Accumulator, ChunkOutcome, CompletedFile, ControlMessage,
    Incoming, TransferSetup,
};
use crate::webrtc::{ChannelMessage, PeerId, DEFAULT_CHUNK_SIZE};

/// Result of one outbound transfer task
#[derive(Debug)]
pub struct Upload {
    pub peer_id: PeerId,
    pub name: String,
    pub result: Result<usize>,
}

pub struct TransferCoordinator {
    store: Store,
    sink: Arc<dyn FileSink>,
    chunk_size: usize,
    receiving: HashMap<PeerId, Accumulator>,
    uploads: JoinSet<Upload>,
}

impl TransferCoordinator {
    pub fn new(store: Store, sink: Arc<dyn FileSink>) -> Self {
        Self {
            store,
            sink,
            chunk_size: DEFAULT_CHUNK_SIZE,
            receiving: HashMap::new(),
            uploads: JoinSet::new(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether a receive is in progress on the channel to `peer_id`
    pub fn is_receiving_from(&self, peer_id: &PeerId) -> bool {
        self.receiving.contains_key(peer_id)
    }

    pub fn active_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Wait for the next outbound transfer to finish
    pub async fn next_upload(&mut self) -> Option<Upload> {
        loop {
            match self.uploads.join_next().await? {
                Ok(upload) => return Some(upload),
                Err(e) => warn!("Upload task failed: {}", e),
            }
        }
    }

    /// Start sharing `file` and announce it to every open channel
    pub async fn add_file(&mut self, engine: &PeerEngine, file: SharedFile) {
        let mut owned = self.store.get_state().owned_files;
        owned.retain(|f| f.name() != file.name());
        owned.push(file.clone());
        self.store.set_state(StatePatch::new().owned_files(owned));
        info!("Sharing {} ({} bytes)", file.name(), file.size());

        broadcast(engine, &ControlMessage::FileNew(file.meta.clone())).await;
    }

    /// Stop sharing `name`; returns false if it was not shared
    pub async fn remove_file(&mut self, engine: &PeerEngine, name: &str) -> bool {
        let mut owned = self.store.get_state().owned_files;
        let before = owned.len();
        owned.retain(|f| f.name() != name);
        if owned.len() == before {
            return false;
        }
        self.store.set_state(StatePatch::new().owned_files(owned));
        info!("Stopped sharing {}", name);

        broadcast(engine, &ControlMessage::remove(name)).await;
        true
    }

    /// Tell a newly opened peer about everything we share
    pub async fn announce_to(&self, engine: &PeerEngine, peer_id: &PeerId) {
        let Some(channel) = engine.channel(peer_id) else {
            return;
        };
        for file in self.store.get_state().owned_files {
            let msg = ControlMessage::FileNew(file.meta.clone());
            if let Err(e) = send_control(&channel, peer_id, &msg).await {
                debug!("Failed to announce {} to {}: {}", file.name(), peer_id.short(), e);
                return;
            }
        }
    }

    /// Request `file` from its source peer unless a download is already running
    pub async fn download_file(&mut self, engine: &PeerEngine, file: &DownloadableFile) -> Result<()> {
        if let Some(active) = self.store.get_state().current_download {
            warn!("Already downloading {}", active.file.name());
            return Err(Error::TransferConflict {
                active: active.file.name().to_string(),
            });
        }

        let peer_id = &file.source_peer;
        let channel = match engine.channel(peer_id) {
            Some(channel) if channel.is_open() => channel,
            _ => return Err(Error::ChannelTerminated(peer_id.clone())),
        };

        self.store
            .set_state(StatePatch::new().current_download(Some(Download::new(file.clone()))));

        if let Err(e) = send_control(&channel, peer_id, &ControlMessage::download(file.name())).await {
            self.store.set_state(StatePatch::new().current_download(None));
            return Err(e);
        }
        info!("Requested {} from {}", file.name(), peer_id.short());
        Ok(())
    }

    /// Look up an advertised file and download it
    pub async fn download_by_name(&mut self, engine: &PeerEngine, peer_id: &PeerId, name: &str) -> Result<()> {
        let file = self
            .store
            .get_state()
            .downloadable_file(peer_id, name)
            .cloned()
            .ok_or_else(|| Error::UnknownFile(name.to_string()))?;
        self.download_file(engine, &file).await
    }

    /// Dispatch one frame received from `peer_id`
    pub async fn handle_message(
        &mut self,
        engine: &PeerEngine,
        peer_id: &PeerId,
        message: ChannelMessage,
    ) -> Result<()> {
        match decode(message)? {
            Incoming::Control(ControlMessage::FileNew(meta)) => {
                self.on_file_new(peer_id, meta);
                Ok(())
            }
            Incoming::Control(ControlMessage::FileRemove(file)) => {
                self.on_file_remove(peer_id, &file.name);
                Ok(())
            }
            Incoming::Control(ControlMessage::FileDownload(file)) => {
                self.on_download_request(engine, peer_id, &file.name)
            }
            Incoming::Control(ControlMessage::DownloadSetup(setup)) => {
                self.on_download_setup(peer_id, setup).await
            }
            Incoming::Binary(data) => self.on_binary(peer_id, data).await,
        }
    }

    fn on_file_new(&mut self, peer_id: &PeerId, meta: FileMetadata) {
        debug!("[Peer {}] Announced {}", peer_id.short(), meta.name);
        let mut files = self.store.get_state().downloadable_files;
        files.retain(|f| !(&f.source_peer == peer_id && f.name() == meta.name));
        files.push(DownloadableFile {
            meta,
            source_peer: peer_id.clone(),
        });
        self.store.set_state(StatePatch::new().downloadable_files(files));
    }

    fn on_file_remove(&mut self, peer_id: &PeerId, name: &str) {
        let mut files = self.store.get_state().downloadable_files;
        let before = files.len();
        files.retain(|f| !(&f.source_peer == peer_id && f.name() == name));
        if files.len() != before {
            debug!("[Peer {}] Withdrew {}", peer_id.short(), name);
            self.store.set_state(StatePatch::new().downloadable_files(files));
        }
    }

    fn on_download_request(&mut self, engine: &PeerEngine, peer_id: &PeerId, name: &str) -> Result<()> {
        let file = self
            .store
            .get_state()
            .owned_file(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFile(name.to_string()))?;
        let channel = engine
            .channel(peer_id)
            .ok_or_else(|| Error::ChannelTerminated(peer_id.clone()))?;

        info!("[Peer {}] Sending {} ({} bytes)", peer_id.short(), name, file.size());
        let chunk_size = self.chunk_size;
        let peer_id = peer_id.clone();
        let name = name.to_string();
        self.uploads.spawn(async move {
            let result = send_file(channel, peer_id.clone(), file, chunk_size).await;
            Upload {
                peer_id,
                name,
                result,
            }
        });
        Ok(())
    }

    async fn on_download_setup(&mut self, peer_id: &PeerId, setup: TransferSetup) -> Result<()> {
        let expected = self
            .store
            .get_state()
            .current_download
            .filter(|d| &d.file.source_peer == peer_id && d.file.name() == setup.name);

        if expected.is_none() {
            self.receiving.remove(peer_id);
            warn!(
                "[Peer {}] Ignoring unrequested transfer of {}",
                peer_id.short(),
                setup.name
            );
            return Ok(());
        }

        debug!(
            "[Peer {}] Receiving {} ({} bytes)",
            peer_id.short(),
            setup.name,
            setup.size
        );
        let mut acc = Accumulator::new(setup);
        if acc.is_complete() {
            let done = acc.take();
            return self.complete(done).await;
        }
        self.receiving.insert(peer_id.clone(), acc);
        Ok(())
    }

    async fn on_binary(&mut self, peer_id: &PeerId, data: bytes::Bytes) -> Result<()> {
        let Some(acc) = self.receiving.get_mut(peer_id) else {
            debug!(
                "[Peer {}] Dropping {} bytes with no transfer in progress",
                peer_id.short(),
                data.len()
            );
            return Ok(());
        };

        let chunks = acc.chunk_count() + 1;
        match acc.push(data) {
            ChunkOutcome::Progress { received, size } => {
                trace!("[Peer {}] {}/{} bytes", peer_id.short(), received, size);
                self.record_progress(received, chunks);
                Ok(())
            }
            ChunkOutcome::Complete(done) => {
                self.receiving.remove(peer_id);
                self.record_progress(done.data.len() as u64, chunks);
                self.complete(done).await
            }
        }
    }

    fn record_progress(&self, received: u64, chunks: usize) {
        if let Some(mut download) = self.store.get_state().current_download {
            download.bytes_received = received;
            download.chunks_received = chunks;
            self.store
                .set_state(StatePatch::new().current_download(Some(download)));
        }
    }

    async fn complete(&mut self, done: CompletedFile) -> Result<()> {
        let size = done.data.len();
        let name = done.name.clone();
        let delivered = self.sink.deliver(&done.name, done.data).await;

        // The download ends either way; a failed write needs a fresh request
        self.store.set_state(StatePatch::new().current_download(None));

        let path = delivered?;
        info!("Downloaded {} ({} bytes) to {}", name, size, path.display());
        Ok(())
    }

    /// Publish the removal of a peer together with everything derived from it
    pub fn on_peer_removed(&mut self, peer_id: &PeerId, peers: Vec<Peer>) {
        self.receiving.remove(peer_id);

        let state = self.store.get_state();
        let files: Vec<DownloadableFile> = state
            .downloadable_files
            .into_iter()
            .filter(|f| &f.source_peer != peer_id)
            .collect();

        let mut patch = StatePatch::new().peers(peers).downloadable_files(files);
        if let Some(download) = state.current_download {
            if &download.file.source_peer == peer_id {
                warn!(
                    "Download of {} abandoned, {} went away",
                    download.file.name(),
                    peer_id.short()
                );
                patch = patch.current_download(None);
            }
        }
        self.store.set_state(patch);
    }
}

/// Send `msg` to every peer whose channel is open; others are skipped
async fn broadcast(engine: &PeerEngine, msg: &ControlMessage) {
    for (peer_id, channel) in engine.open_channels() {
        if let Err(e) = send_control(&channel, &peer_id, msg).await {
            debug!("Failed to send {} to {}: {}", msg.msg_type(), peer_id.short(), e);
        }
    }
}
