//! In-memory stand-ins for the relay, the platform and the download directory

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use peerdrop::webrtc::{
    ChannelMessage, ChannelState, ConnectionFactory, DataChannel, IceCandidate, PeerConnection,
    PeerEvent, PeerId, SessionDescription, SignalingEvent, SignalingMessage, SignalingTransport,
};
use peerdrop::{FileSink, ShareManager, Store};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Data channel that records everything sent on it
pub struct MockChannel {
    label: String,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<ChannelMessage>>,
}

impl MockChannel {
    pub fn new(label: &str, state: ChannelState) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    /// Drain the recorded frames
    pub fn take_sent(&self) -> Vec<ChannelMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                ChannelMessage::Text(t) => Some(t.clone()),
                ChannelMessage::Binary(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.sent.lock().unwrap().push(ChannelMessage::Text(text));
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.sent.lock().unwrap().push(ChannelMessage::Binary(data));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.set_state(ChannelState::Closed);
        Ok(())
    }
}

/// Peer connection that answers every step immediately
pub struct MockConnection {
    peer_id: PeerId,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    channel: Mutex<Option<Arc<MockChannel>>>,
    pub local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub closed: AtomicBool,
}

impl MockConnection {
    pub fn channel(&self) -> Option<Arc<MockChannel>> {
        self.channel.lock().unwrap().clone()
    }

    pub fn set_channel(&self, channel: Arc<MockChannel>) {
        *self.channel.lock().unwrap() = Some(channel);
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = MockChannel::new(label, ChannelState::Connecting);
        self.set_channel(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("offer-to-{}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer-to-{}", self.peer_id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out mock connections and remembers the latest one per peer
#[derive(Default)]
pub struct MockFactory {
    connections: Mutex<HashMap<PeerId, Arc<MockConnection>>>,
    created: Mutex<usize>,
}

impl MockFactory {
    pub fn connection(&self, peer_id: &PeerId) -> Arc<MockConnection> {
        self.connections
            .lock()
            .unwrap()
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("No connection for {}", peer_id))
    }

    pub fn created(&self) -> usize {
        *self.created.lock().unwrap()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(MockConnection {
            peer_id: peer_id.clone(),
            events,
            channel: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.connections
            .lock()
            .unwrap()
            .insert(peer_id.clone(), connection.clone());
        *self.created.lock().unwrap() += 1;
        Ok(connection)
    }
}

/// Relay transport that records emitted events
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<SignalingMessage>>,
}

impl RecordingSignaling {
    pub fn take(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingTransport for RecordingSignaling {
    async fn emit(&self, msg: SignalingMessage) -> Result<()> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

/// Collects completed downloads
#[derive(Default)]
pub struct MemorySink {
    files: Mutex<Vec<(String, Bytes)>>,
}

impl MemorySink {
    pub fn files(&self) -> Vec<(String, Bytes)> {
        self.files.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileSink for MemorySink {
    async fn deliver(&self, name: &str, data: Bytes) -> Result<PathBuf> {
        self.files.lock().unwrap().push((name.to_string(), data));
        Ok(PathBuf::from(name))
    }
}

/// One client wired to mocks, driven by calling the manager's handlers directly
pub struct Node {
    pub id: PeerId,
    pub manager: ShareManager,
    pub factory: Arc<MockFactory>,
    pub signaling: Arc<RecordingSignaling>,
    pub sink: Arc<MemorySink>,
    pub relay: mpsc::Sender<SignalingEvent>,
}

impl Node {
    pub fn new(id: &str, chunk_size: usize) -> Self {
        let factory = Arc::new(MockFactory::default());
        let signaling = Arc::new(RecordingSignaling::default());
        let sink = Arc::new(MemorySink::default());
        let (relay, relay_rx) = mpsc::channel(16);
        let manager = ShareManager::new(
            factory.clone(),
            signaling.clone(),
            relay_rx,
            sink.clone(),
            Store::default(),
        )
        .with_chunk_size(chunk_size);

        Self {
            id: PeerId::new(id),
            manager,
            factory,
            signaling,
            sink,
            relay,
        }
    }

    pub fn store(&self) -> &Store {
        self.manager.store()
    }

    /// Our side of the data channel to `peer_id`
    pub fn channel_to(&self, peer_id: &PeerId) -> Arc<MockChannel> {
        self.factory
            .connection(peer_id)
            .channel()
            .unwrap_or_else(|| panic!("No channel to {}", peer_id))
    }

    pub async fn download(&mut self, peer_id: &PeerId, name: &str) -> peerdrop::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.manager
            .handle_command(peerdrop::webrtc::Command::Download {
                peer_id: peer_id.clone(),
                name: name.to_string(),
                reply,
            })
            .await;
        rx.await.expect("reply dropped")
    }

    pub async fn add_file(&mut self, file: peerdrop::SharedFile) {
        self.manager
            .handle_command(peerdrop::webrtc::Command::AddFile(file))
            .await;
    }

    /// Wait for every upload started so far
    pub async fn finish_uploads(&mut self) {
        while self.manager.coordinator().active_uploads() > 0 {
            let upload = self.manager.coordinator_mut().next_upload().await;
            if let Some(upload) = upload {
                upload.result.expect("upload failed");
            }
        }
    }
}

/// Deliver every frame `from` sent towards `to`
pub async fn pump(from: &Node, to: &mut Node) -> usize {
    let frames = from.channel_to(&to.id).take_sent();
    let count = frames.len();
    for message in frames {
        to.manager
            .handle_peer_event(PeerEvent::ChannelMessage {
                peer_id: from.id.clone(),
                message,
            })
            .await;
    }
    count
}

/// Run a full join/offer/accept exchange with `initiator` discovering `responder`
pub async fn connect(initiator: &mut Node, responder: &mut Node) {
    initiator
        .manager
        .handle_signaling(SignalingEvent::Join {
            id: responder.id.clone(),
        })
        .await;
    let offer = initiator
        .signaling
        .take()
        .into_iter()
        .find_map(|m| match m {
            SignalingMessage::Offer { receiver_id, offer } if receiver_id == responder.id => {
                Some(offer)
            }
            _ => None,
        })
        .expect("initiator sent no offer");

    responder
        .manager
        .handle_signaling(SignalingEvent::Offer {
            id: initiator.id.clone(),
            offer,
        })
        .await;
    let answer = responder
        .signaling
        .take()
        .into_iter()
        .find_map(|m| match m {
            SignalingMessage::Accept { receiver_id, offer } if receiver_id == initiator.id => {
                Some(offer)
            }
            _ => None,
        })
        .expect("responder sent no answer");

    initiator
        .manager
        .handle_signaling(SignalingEvent::Accept {
            id: responder.id.clone(),
            offer: answer,
        })
        .await;

    // Channel opens on both ends
    initiator
        .channel_to(&responder.id)
        .set_state(ChannelState::Open);
    initiator
        .manager
        .handle_peer_event(PeerEvent::ChannelOpen {
            peer_id: responder.id.clone(),
        })
        .await;

    let inbound = MockChannel::new("peerdrop", ChannelState::Open);
    responder
        .factory
        .connection(&initiator.id)
        .set_channel(inbound.clone());
    responder
        .manager
        .handle_peer_event(PeerEvent::DataChannel {
            peer_id: initiator.id.clone(),
            channel: inbound,
        })
        .await;
    responder
        .manager
        .handle_peer_event(PeerEvent::ChannelOpen {
            peer_id: initiator.id.clone(),
        })
        .await;
}
