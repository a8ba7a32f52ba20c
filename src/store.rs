//! Observable application state
//!
//! `Store` holds the single `AppState`. Every mutation is a shallow merge of a
//! `StatePatch`, after which all subscribers are called synchronously, in
//! registration order, with the new full state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::files::{FileMetadata, SharedFile};
use crate::webrtc::{ChannelState, Negotiation, PeerId};

/// Relay connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

/// A remote peer as seen by observers
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: PeerId,
    pub negotiation: Negotiation,
    /// `None` until a data channel exists for this peer
    pub channel: Option<ChannelState>,
}

/// A file advertised by a remote peer
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadableFile {
    pub meta: FileMetadata,
    pub source_peer: PeerId,
}

impl DownloadableFile {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }
}

/// The single in-flight download
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub file: DownloadableFile,
    pub bytes_received: u64,
    pub chunks_received: usize,
}

impl Download {
    pub fn new(file: DownloadableFile) -> Self {
        Self {
            file,
            bytes_received: 0,
            chunks_received: 0,
        }
    }

    /// Completion ratio in `[0, 1]`
    pub fn progress(&self) -> f64 {
        if self.file.size() == 0 {
            return 1.0;
        }
        (self.bytes_received as f64 / self.file.size() as f64).min(1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppState {
    pub signaling: SignalingStatus,
    pub peers: Vec<Peer>,
    pub owned_files: Vec<SharedFile>,
    pub downloadable_files: Vec<DownloadableFile>,
    pub current_download: Option<Download>,
}

impl AppState {
    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }

    pub fn owned_file(&self, name: &str) -> Option<&SharedFile> {
        self.owned_files.iter().find(|f| f.name() == name)
    }

    pub fn downloadable_file(&self, peer_id: &PeerId, name: &str) -> Option<&DownloadableFile> {
        self.downloadable_files
            .iter()
            .find(|f| &f.source_peer == peer_id && f.name() == name)
    }
}

/// Partial state; each `Some` field replaces the corresponding field
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub signaling: Option<SignalingStatus>,
    pub peers: Option<Vec<Peer>>,
    pub owned_files: Option<Vec<SharedFile>>,
    pub downloadable_files: Option<Vec<DownloadableFile>>,
    pub current_download: Option<Option<Download>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signaling(mut self, status: SignalingStatus) -> Self {
        self.signaling = Some(status);
        self
    }

    pub fn peers(mut self, peers: Vec<Peer>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn owned_files(mut self, files: Vec<SharedFile>) -> Self {
        self.owned_files = Some(files);
        self
    }

    pub fn downloadable_files(mut self, files: Vec<DownloadableFile>) -> Self {
        self.downloadable_files = Some(files);
        self
    }

    pub fn current_download(mut self, download: Option<Download>) -> Self {
        self.current_download = Some(download);
        self
    }

    fn apply(self, state: &mut AppState) {
        if let Some(signaling) = self.signaling {
            state.signaling = signaling;
        }
        if let Some(peers) = self.peers {
            state.peers = peers;
        }
        if let Some(files) = self.owned_files {
            state.owned_files = files;
        }
        if let Some(files) = self.downloadable_files {
            state.downloadable_files = files;
        }
        if let Some(download) = self.current_download {
            state.current_download = download;
        }
    }
}

pub type Listener = Arc<dyn Fn(&AppState) + Send + Sync>;

struct Inner {
    state: AppState,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

/// Shared handle to the application state
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

impl Store {
    pub fn new(initial: AppState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: initial,
                listeners: Vec::new(),
                next_listener_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current state
    pub fn get_state(&self) -> AppState {
        self.lock().state.clone()
    }

    /// Merge `patch` into the state and notify every subscriber once
    pub fn set_state(&self, patch: StatePatch) {
        let (snapshot, listeners) = {
            let mut inner = self.lock();
            patch.apply(&mut inner.state);
            let listeners: Vec<Listener> =
                inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (inner.state.clone(), listeners)
        };

        // Called without the lock held so listeners may read or write the store
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Register `listener`; dropping the returned handle does not unsubscribe
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AppState) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));

        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(AppState::default())
    }
}

/// Removes exactly one listener; calling `unsubscribe` again is a no-op
pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
