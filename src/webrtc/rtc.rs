//! Peer connections backed by the `webrtc` crate

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::transport::{
    ChannelMessage, ConnectionFactory, DataChannel, LinkState, PeerConnection, PeerEvent,
};
use super::types::{ChannelState, IceCandidate, PeerId, SdpKind, SessionDescription};

/// Builds `RTCPeerConnection`s with the configured ICE servers
pub struct RtcConnectionFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnectionFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = self
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);

        // Handle ICE candidates
        let id = peer_id.clone();
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate = match candidate {
                Some(c) => c.to_json().map(|init| Some(from_rtc_candidate(init))),
                None => Ok(None),
            };
            match candidate {
                Ok(candidate) => {
                    let _ = tx.send(PeerEvent::LocalCandidate {
                        peer_id: id.clone(),
                        candidate,
                    });
                }
                Err(e) => debug!("Unserializable candidate for {}: {}", id.short(), e),
            }
            Box::pin(async {})
        }));

        // Handle connection state changes
        let id = peer_id.clone();
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Peer {} connection state: {:?}", id.short(), state);
            let state = match state {
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
                _ => LinkState::Connecting,
            };
            let _ = tx.send(PeerEvent::LinkState {
                peer_id: id.clone(),
                state,
            });
            Box::pin(async {})
        }));

        // Inbound channels, for the answering side
        let id = peer_id.clone();
        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let id = id.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let channel = wire_channel(dc, id.clone(), tx.clone());
                let _ = tx.send(PeerEvent::DataChannel {
                    peer_id: id,
                    channel,
                });
            })
        }));

        Ok(Arc::new(RtcPeerConnection {
            peer_id: peer_id.clone(),
            pc,
            events,
        }))
    }
}

/// Register open/close/message handlers and wrap the channel
fn wire_channel(
    dc: Arc<RTCDataChannel>,
    peer_id: PeerId,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> Arc<dyn DataChannel> {
    let id = peer_id.clone();
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let _ = tx.send(PeerEvent::ChannelOpen { peer_id: id });
        Box::pin(async {})
    }));

    let id = peer_id.clone();
    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let _ = tx.send(PeerEvent::ChannelClosed {
            peer_id: id.clone(),
        });
        Box::pin(async {})
    }));

    let id = peer_id;
    let tx = events;
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let message = if msg.is_string {
            String::from_utf8(msg.data.to_vec()).map(ChannelMessage::Text)
        } else {
            trace!("[Peer {}] Received {} bytes binary", id.short(), msg.data.len());
            Ok(ChannelMessage::Binary(msg.data))
        };
        match message {
            Ok(message) => {
                let _ = tx.send(PeerEvent::ChannelMessage {
                    peer_id: id.clone(),
                    message,
                });
            }
            Err(e) => debug!("[Peer {}] Non UTF-8 text frame: {}", id.short(), e),
        }
        Box::pin(async {})
    }));

    Arc::new(RtcDataChannel { dc })
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => anyhow::bail!("Rollback descriptions are not supported"),
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => anyhow::bail!("Session description has no type"),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

pub struct RtcPeerConnection {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self.pc.create_data_channel(label, None).await?;
        Ok(wire_channel(dc, self.peer_id.clone(), self.events.clone()))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn ready_state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}
