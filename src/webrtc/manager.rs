//! Share manager: one serialized loop over relay events, platform events and commands
//!
//! Every state change happens on this loop, so the negotiation engine and the
//! transfer coordinator never race each other.

use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::peer::PeerEngine;
use super::signaling::{SignalingClient, SignalingTransport};
use super::transport::{ConnectionFactory, LinkState, PeerEvent};
use super::types::{ChannelState, PeerId, SignalingEvent};
use crate::error::{Error, Result};
use crate::files::{FileSink, SharedFile};
use crate::store::{SignalingStatus, StatePatch, Store};
use crate::transfer::TransferCoordinator;

/// Requests from outside the loop
pub enum Command {
    AddFile(SharedFile),
    RemoveFile(String),
    Download {
        peer_id: PeerId,
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle for driving a running manager
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
    store: Store,
}

impl ManagerHandle {
    fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| Error::Transport(anyhow!("Share manager has stopped")))
    }

    /// Share `file` with every current and future peer
    pub fn add_file(&self, file: SharedFile) -> Result<()> {
        self.send(Command::AddFile(file))
    }

    pub fn remove_file(&self, name: &str) -> Result<()> {
        self.send(Command::RemoveFile(name.to_string()))
    }

    /// Request `name` from `peer_id`; resolves once the request is sent or refused
    pub async fn download(&self, peer_id: &PeerId, name: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Download {
            peer_id: peer_id.clone(),
            name: name.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| Error::Transport(anyhow!("Share manager has stopped")))?
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

pub struct ShareManager {
    store: Store,
    engine: PeerEngine,
    coordinator: TransferCoordinator,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    signaling_events: Option<mpsc::Receiver<SignalingEvent>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ShareManager {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        transport: Arc<dyn SignalingTransport>,
        signaling_events: mpsc::Receiver<SignalingEvent>,
        sink: Arc<dyn FileSink>,
        store: Store,
    ) -> Self {
        let signaling = SignalingClient::new(transport);
        let (engine, peer_events) = PeerEngine::new(factory, signaling, store.clone());
        let coordinator = TransferCoordinator::new(store.clone(), sink);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            store,
            engine,
            coordinator,
            peer_events: Some(peer_events),
            signaling_events: Some(signaling_events),
            commands_tx,
            commands_rx: Some(commands_rx),
            shutdown: Arc::new(shutdown),
            shutdown_rx,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.coordinator = self.coordinator.with_chunk_size(chunk_size);
        self
    }

    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.engine = self.engine.with_channel_label(label);
        self
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            commands: self.commands_tx.clone(),
            shutdown: self.shutdown.clone(),
            store: self.store.clone(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn engine(&self) -> &PeerEngine {
        &self.engine
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut TransferCoordinator {
        &mut self.coordinator
    }

    /// Join the room and process events until shutdown
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut peer_events = self
            .peer_events
            .take()
            .ok_or_else(|| anyhow!("Share manager is already running"))?;
        let mut signaling_events = self
            .signaling_events
            .take()
            .ok_or_else(|| anyhow!("Share manager is already running"))?;
        let mut commands = self
            .commands_rx
            .take()
            .ok_or_else(|| anyhow!("Share manager is already running"))?;

        if let Err(e) = self.engine.signaling().join().await {
            self.store
                .set_state(StatePatch::new().signaling(SignalingStatus::Disconnected));
            return Err(e);
        }
        self.store
            .set_state(StatePatch::new().signaling(SignalingStatus::Connected));

        let mut relay_open = true;
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Share manager shutting down");
                        break;
                    }
                }
                event = signaling_events.recv(), if relay_open => {
                    match event {
                        Some(event) => self.handle_signaling(event).await,
                        None => {
                            relay_open = false;
                            self.on_relay_lost().await;
                        }
                    }
                }
                Some(event) = peer_events.recv() => {
                    self.handle_peer_event(event).await;
                }
                Some(cmd) = commands.recv() => {
                    self.handle_command(cmd).await;
                }
                Some(upload) = self.coordinator.next_upload(), if self.coordinator.active_uploads() > 0 => {
                    match upload.result {
                        Ok(chunks) => info!(
                            "[Peer {}] Sent {} in {} chunks",
                            upload.peer_id.short(),
                            upload.name,
                            chunks
                        ),
                        Err(e) => warn!(
                            "[Peer {}] Transfer of {} failed: {}",
                            upload.peer_id.short(),
                            upload.name,
                            e
                        ),
                    }
                }
            }
        }

        for peer_id in self.engine.peer_summaries().into_iter().map(|p| p.id) {
            self.teardown(&peer_id).await;
        }
        Ok(())
    }

    /// Route one relay event to the negotiation engine
    pub async fn handle_signaling(&mut self, event: SignalingEvent) {
        let name = event.event_name();
        let peer_id = event.peer_id().clone();
        let result = match event {
            SignalingEvent::Join { id } => {
                self.restart(&id).await;
                self.engine.start_initiator(&id).await
            }
            SignalingEvent::Offer { id, offer } => {
                self.restart(&id).await;
                self.engine.start_responder(&id, offer).await
            }
            SignalingEvent::Accept { id, offer } => self.engine.accept_answer(&id, offer).await,
            SignalingEvent::IceCandidate { id, candidate } => {
                self.engine.add_ice_candidate(&id, candidate).await
            }
        };

        match result {
            Ok(()) => {}
            // Candidates routinely race ahead of the offer
            Err(Error::UnknownPeer(id)) if name == "room/icecandidate" => {
                debug!("Ignoring {} for unknown peer {}", name, id.short());
            }
            Err(Error::UnknownPeer(id)) => {
                warn!("Ignoring {} for unknown peer {}", name, id.short());
            }
            Err(e) => error!("Error handling {} from {}: {}", name, peer_id.short(), e),
        }
    }

    /// Route one platform notification
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate { peer_id, candidate } => {
                if let Err(e) = self.engine.on_local_candidate(&peer_id, candidate).await {
                    debug!("Dropping local candidate for {}: {}", peer_id.short(), e);
                }
            }
            PeerEvent::DataChannel { peer_id, channel } => {
                if let Err(e) = self.engine.on_data_channel(&peer_id, channel) {
                    debug!("Dropping data channel: {}", e);
                }
            }
            PeerEvent::ChannelOpen { peer_id } => {
                if let Err(e) = self.engine.on_channel_open(&peer_id) {
                    debug!("Ignoring channel open: {}", e);
                    return;
                }
                self.coordinator.announce_to(&self.engine, &peer_id).await;
            }
            PeerEvent::ChannelClosed { peer_id } => {
                // Late closes from a replaced connection must not remove the new one
                let closed = self.engine.channel(&peer_id).is_some_and(|c| {
                    matches!(c.ready_state(), ChannelState::Closing | ChannelState::Closed)
                });
                if closed {
                    info!("[Peer {}] Data channel closed", peer_id.short());
                    self.teardown(&peer_id).await;
                }
            }
            PeerEvent::ChannelMessage { peer_id, message } => {
                if let Err(e) = self
                    .coordinator
                    .handle_message(&self.engine, &peer_id, message)
                    .await
                {
                    warn!("[Peer {}] {}", peer_id.short(), e);
                }
            }
            PeerEvent::LinkState { peer_id, state } => {
                if state == LinkState::Failed {
                    warn!("Connection to {} failed", peer_id.short());
                    self.teardown(&peer_id).await;
                }
            }
        }
    }

    pub async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddFile(file) => self.coordinator.add_file(&self.engine, file).await,
            Command::RemoveFile(name) => {
                if !self.coordinator.remove_file(&self.engine, &name).await {
                    debug!("{} was not shared", name);
                }
            }
            Command::Download {
                peer_id,
                name,
                reply,
            } => {
                let result = self
                    .coordinator
                    .download_by_name(&self.engine, &peer_id, &name)
                    .await;
                let _ = reply.send(result);
            }
        }
    }

    /// A fresh join or offer from a known peer replaces its connection, so
    /// everything derived from the old one goes first
    async fn restart(&mut self, peer_id: &PeerId) {
        if self.engine.contains(peer_id) {
            warn!("Restarting negotiation with {}", peer_id.short());
            self.teardown(peer_id).await;
        }
    }

    /// Remove a peer and everything derived from it in one store update
    async fn teardown(&mut self, peer_id: &PeerId) {
        if self.engine.remove_peer(peer_id).await {
            self.coordinator
                .on_peer_removed(peer_id, self.engine.peer_summaries());
        }
    }

    /// The relay is gone: negotiations in progress can never complete
    pub async fn on_relay_lost(&mut self) {
        warn!("Relay connection lost");
        self.store
            .set_state(StatePatch::new().signaling(SignalingStatus::Disconnected));
        for peer_id in self.engine.pending_peers() {
            self.teardown(&peer_id).await;
        }
    }
}
