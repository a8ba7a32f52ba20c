//! Peer negotiation engine
//!
//! Owns one connection and one state machine per remote peer. Negotiation
//! steps are awaited in order; every transition is published to the store.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::signaling::SignalingClient;
use super::transport::{ConnectionFactory, DataChannel, PeerConnection, PeerEvent};
use super::types::{
    ChannelState, IceCandidate, InitiatorState, Negotiation, PeerId, ResponderState,
    SessionDescription, CHANNEL_LABEL,
};
use crate::error::{Error, Result};
use crate::store::{Peer, StatePatch, Store};

/// Live connection objects for one peer
struct PeerEntry {
    seq: u64,
    negotiation: Negotiation,
    connection: Arc<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
}

impl PeerEntry {
    fn summary(&self, id: &PeerId) -> Peer {
        Peer {
            id: id.clone(),
            negotiation: self.negotiation,
            channel: self.channel.as_ref().map(|c| c.ready_state()),
        }
    }
}

pub struct PeerEngine {
    factory: Arc<dyn ConnectionFactory>,
    signaling: SignalingClient,
    store: Store,
    channel_label: String,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    peers: HashMap<PeerId, PeerEntry>,
    next_seq: u64,
}

impl PeerEngine {
    /// Create an engine; platform events for all peers arrive on the returned receiver
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        signaling: SignalingClient,
        store: Store,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            factory,
            signaling,
            store,
            channel_label: CHANNEL_LABEL.to_string(),
            events_tx,
            peers: HashMap::new(),
            next_seq: 0,
        };
        (engine, events_rx)
    }

    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = label.into();
        self
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn negotiation(&self, peer_id: &PeerId) -> Option<Negotiation> {
        self.peers.get(peer_id).map(|e| e.negotiation)
    }

    /// Handle to the peer's data channel, if it has one
    pub fn channel(&self, peer_id: &PeerId) -> Option<Arc<dyn DataChannel>> {
        self.peers.get(peer_id).and_then(|e| e.channel.clone())
    }

    /// Channels whose `readyState` is open
    pub fn open_channels(&self) -> Vec<(PeerId, Arc<dyn DataChannel>)> {
        let mut open: Vec<_> = self
            .peers
            .iter()
            .filter_map(|(id, e)| match &e.channel {
                Some(c) if c.is_open() => Some((e.seq, id.clone(), c.clone())),
                _ => None,
            })
            .collect();
        open.sort_by_key(|(seq, _, _)| *seq);
        open.into_iter().map(|(_, id, c)| (id, c)).collect()
    }

    /// Peer records in discovery order
    pub fn peer_summaries(&self) -> Vec<Peer> {
        let mut entries: Vec<_> = self.peers.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries.into_iter().map(|(id, e)| e.summary(id)).collect()
    }

    fn publish(&self) {
        self.store
            .set_state(StatePatch::new().peers(self.peer_summaries()));
    }

    fn transition(&mut self, peer_id: &PeerId, negotiation: Negotiation) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            debug!(
                "Peer {} {} -> {}",
                peer_id.short(),
                entry.negotiation,
                negotiation
            );
            entry.negotiation = negotiation;
        }
        self.publish();
    }

    /// Create a connection for `peer_id`, replacing any previous one
    async fn create_entry(&mut self, peer_id: &PeerId, negotiation: Negotiation) -> Result<()> {
        if let Some(old) = self.peers.remove(peer_id) {
            debug!("Replacing connection to {}", peer_id.short());
            close_entry(peer_id, old).await;
        }

        let connection = self
            .factory
            .create(peer_id, self.events_tx.clone())
            .await?;

        self.next_seq += 1;
        self.peers.insert(
            peer_id.clone(),
            PeerEntry {
                seq: self.next_seq,
                negotiation,
                connection,
                channel: None,
            },
        );
        self.publish();
        Ok(())
    }

    fn connection(&self, peer_id: &PeerId) -> Result<Arc<dyn PeerConnection>> {
        self.peers
            .get(peer_id)
            .map(|e| e.connection.clone())
            .ok_or_else(|| Error::UnknownPeer(peer_id.clone()))
    }

    /// `room/join`: we initiate. The data channel is created before the offer.
    pub async fn start_initiator(&mut self, peer_id: &PeerId) -> Result<()> {
        info!("Peer {} joined, initiating connection", peer_id.short());
        self.create_entry(peer_id, Negotiation::Initiator(InitiatorState::Created))
            .await?;

        if let Err(e) = self.run_initiator(peer_id).await {
            warn!("Negotiation with {} failed: {}", peer_id.short(), e);
            self.drop_failed(peer_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_initiator(&mut self, peer_id: &PeerId) -> Result<()> {
        let connection = self.connection(peer_id)?;

        let channel = connection.create_data_channel(&self.channel_label).await?;
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.channel = Some(channel);
        }
        self.transition(
            peer_id,
            Negotiation::Initiator(InitiatorState::DataChannelCreated),
        );

        let offer = connection.create_offer().await?;
        self.transition(peer_id, Negotiation::Initiator(InitiatorState::OfferCreated));

        connection.set_local_description(offer.clone()).await?;
        self.transition(
            peer_id,
            Negotiation::Initiator(InitiatorState::LocalDescriptionSet),
        );

        self.signaling.send_offer(peer_id, offer).await?;
        self.transition(peer_id, Negotiation::Initiator(InitiatorState::OfferSent));
        info!("Sent offer to {}", peer_id.short());
        Ok(())
    }

    /// `room/offer`: we answer. The inbound channel callback is already
    /// registered by the factory when the remote description is applied.
    pub async fn start_responder(
        &mut self,
        peer_id: &PeerId,
        offer: SessionDescription,
    ) -> Result<()> {
        info!("Received offer from {}", peer_id.short());
        self.create_entry(peer_id, Negotiation::Responder(ResponderState::Created))
            .await?;

        if let Err(e) = self.run_responder(peer_id, offer).await {
            warn!("Negotiation with {} failed: {}", peer_id.short(), e);
            self.drop_failed(peer_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_responder(&mut self, peer_id: &PeerId, offer: SessionDescription) -> Result<()> {
        let connection = self.connection(peer_id)?;

        connection.set_remote_description(offer).await?;
        self.transition(
            peer_id,
            Negotiation::Responder(ResponderState::RemoteDescriptionSet),
        );

        let answer = connection.create_answer().await?;
        self.transition(peer_id, Negotiation::Responder(ResponderState::AnswerCreated));

        connection.set_local_description(answer.clone()).await?;
        self.transition(
            peer_id,
            Negotiation::Responder(ResponderState::LocalDescriptionSet),
        );

        self.signaling.send_answer(peer_id, answer).await?;
        self.transition(peer_id, Negotiation::Responder(ResponderState::AnswerSent));
        info!("Sent answer to {}", peer_id.short());

        // The channel may have opened while we were answering
        if self.channel(peer_id).is_some_and(|c| c.is_open()) {
            self.transition(peer_id, Negotiation::Responder(ResponderState::Connected));
        }
        Ok(())
    }

    /// `room/accept`: apply the answer to our offer
    pub async fn accept_answer(&mut self, peer_id: &PeerId, answer: SessionDescription) -> Result<()> {
        let connection = self.connection(peer_id)?;

        match self.negotiation(peer_id) {
            Some(Negotiation::Initiator(InitiatorState::OfferSent)) => {}
            Some(other) => {
                warn!(
                    "Answer from {} while {}, applying anyway",
                    peer_id.short(),
                    other
                );
            }
            None => {}
        }

        connection.set_remote_description(answer).await?;
        self.transition(peer_id, Negotiation::Initiator(InitiatorState::Connected));
        info!("Applied answer from {}", peer_id.short());
        Ok(())
    }

    /// `room/icecandidate`: applied in any negotiation state
    pub async fn add_ice_candidate(&mut self, peer_id: &PeerId, candidate: IceCandidate) -> Result<()> {
        let connection = self.connection(peer_id)?;

        if candidate.candidate.is_empty() {
            debug!("Peer {} finished sending candidates", peer_id.short());
            return Ok(());
        }

        // A candidate the platform rejects does not fail the negotiation
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            debug!("Failed to add candidate from {}: {}", peer_id.short(), e);
        }
        Ok(())
    }

    /// A local candidate was discovered; `None` means gathering finished
    pub async fn on_local_candidate(
        &mut self,
        peer_id: &PeerId,
        candidate: Option<IceCandidate>,
    ) -> Result<()> {
        let Some(candidate) = candidate else {
            debug!("Candidate gathering complete for {}", peer_id.short());
            return Ok(());
        };
        if !self.contains(peer_id) {
            return Err(Error::UnknownPeer(peer_id.clone()));
        }

        debug!("Emitting candidate to {}", peer_id.short());
        self.signaling.send_candidate(peer_id, candidate).await?;
        Ok(())
    }

    /// Inbound data channel for a responder; the record is updated in place
    pub fn on_data_channel(&mut self, peer_id: &PeerId, channel: Arc<dyn DataChannel>) -> Result<()> {
        let entry = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.clone()))?;

        info!(
            "Peer {} received data channel: {}",
            peer_id.short(),
            channel.label()
        );
        entry.channel = Some(channel);
        self.publish();
        Ok(())
    }

    /// Channel reached `open`
    pub fn on_channel_open(&mut self, peer_id: &PeerId) -> Result<()> {
        let negotiation = self
            .negotiation(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.clone()))?;

        info!("[Peer {}] Data channel open", peer_id.short());
        match negotiation {
            Negotiation::Responder(ResponderState::AnswerSent) => {
                self.transition(peer_id, Negotiation::Responder(ResponderState::Connected));
            }
            _ => self.publish(),
        }
        Ok(())
    }

    /// Forget `peer_id` and close its connection. The store is not touched;
    /// the caller publishes the removal together with derived cleanup.
    pub async fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        match self.peers.remove(peer_id) {
            Some(entry) => {
                info!("Removing peer {}", peer_id.short());
                close_entry(peer_id, entry).await;
                true
            }
            None => false,
        }
    }

    /// Peers that have not finished negotiating
    pub fn pending_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, e)| !e.negotiation.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn drop_failed(&mut self, peer_id: &PeerId) {
        if self.remove_peer(peer_id).await {
            self.publish();
        }
    }
}

async fn close_entry(peer_id: &PeerId, entry: PeerEntry) {
    if let Some(channel) = entry.channel {
        if channel.ready_state() != ChannelState::Closed {
            if let Err(e) = channel.close().await {
                debug!("Error closing channel to {}: {}", peer_id.short(), e);
            }
        }
    }
    if let Err(e) = entry.connection.close().await {
        debug!("Error closing connection to {}: {}", peer_id.short(), e);
    }
}
