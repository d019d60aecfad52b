use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use super::{
    CapabilityFactory, ConnectivityState, IceCandidate, NegotiationCapability, NegotiationEvent,
    SessionEvents,
};
use crate::error::CapabilityError;
use crate::media::MediaStreamRef;
use crate::protocol::{SdpKind, SessionDescription};

/// Public STUN server used when nothing else is configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Builds one peer connection per negotiation session.
pub struct WebRtcCapabilityFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcCapabilityFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, CapabilityError> {
        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers,
                ..Default::default()
            }]
        };
        Ok(Self {
            api: Arc::new(build_api(SettingEngine::default())?),
            ice_servers,
        })
    }
}

impl WebRtcCapabilityFactory {
    fn capability(&self, events: SessionEvents) -> WebRtcCapability {
        WebRtcCapability {
            api: Arc::clone(&self.api),
            config: RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            },
            events,
            peer: OnceCell::new(),
            closed: AtomicBool::new(false),
            final_description: Arc::new(Mutex::new(None)),
        }
    }
}

impl CapabilityFactory for WebRtcCapabilityFactory {
    fn create(&self, events: SessionEvents) -> Arc<dyn NegotiationCapability> {
        Arc::new(self.capability(events))
    }
}

fn build_api(setting: SettingEngine) -> Result<API, CapabilityError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

struct WebRtcCapability {
    api: Arc<API>,
    config: RTCConfiguration,
    events: SessionEvents,
    peer: OnceCell<Arc<RTCPeerConnection>>,
    closed: AtomicBool,
    final_description: Arc<Mutex<Option<SessionDescription>>>,
}

impl WebRtcCapability {
    /// The peer connection, created on first use. Never hands out a peer
    /// once `close` has been called.
    async fn peer(&self) -> Result<Arc<RTCPeerConnection>, CapabilityError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CapabilityError::new("peer connection closed"));
        }
        let pc = self
            .peer
            .get_or_try_init(|| self.new_peer())
            .await
            .map(Arc::clone)?;
        if self.closed.load(Ordering::SeqCst) {
            // close() ran while the peer was still being built and missed it.
            close_peer(&pc, &self.events).await;
            return Err(CapabilityError::new("peer connection closed"));
        }
        Ok(pc)
    }

    async fn new_peer(&self) -> Result<Arc<RTCPeerConnection>, CapabilityError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        tracing::debug!(
            target: "beach_cams::negotiation",
            slot = %self.events.slot,
            generation = self.events.generation(),
            "peer connection created"
        );

        let events = self.events.clone();
        let final_description = Arc::clone(&self.final_description);
        let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let final_description = Arc::clone(&final_description);
            let weak_pc = weak_pc.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            events.emit(NegotiationEvent::Candidate(Some(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            })));
                        }
                        Err(err) => tracing::warn!(
                            target: "beach_cams::negotiation",
                            slot = %events.slot,
                            error = %err,
                            "failed to serialize local candidate"
                        ),
                    },
                    None => {
                        // Record the final description before announcing completion.
                        if let Some(pc) = weak_pc.upgrade() {
                            if let Some(local) = pc.local_description().await {
                                match description_from_rtc(&local) {
                                    Ok(description) => {
                                        *final_description.lock() = Some(description);
                                    }
                                    Err(err) => tracing::warn!(
                                        target: "beach_cams::negotiation",
                                        slot = %events.slot,
                                        error = %err,
                                        "unusable local description after gathering"
                                    ),
                                }
                            }
                        }
                        events.emit(NegotiationEvent::Candidate(None));
                    }
                }
            })
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target: "beach_cams::negotiation",
                    slot = %events.slot,
                    ?state,
                    "peer connection state changed"
                );
                events.emit(NegotiationEvent::Connectivity(connectivity_from_rtc(state)));
            })
        }));

        let events = self.events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                Box::pin(async move {
                    events.emit(NegotiationEvent::Track(MediaStreamRef {
                        stream_id: track.stream_id(),
                        track_id: track.id(),
                        kind: track.kind().to_string(),
                    }));
                })
            },
        ));

        Ok(pc)
    }
}

#[async_trait]
impl NegotiationCapability for WebRtcCapability {
    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        let remote = description_to_rtc(&description)?;
        let pc = self.peer().await?;
        pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        let pc = self.peer().await?;
        let answer = pc.create_answer(None).await?;
        description_from_rtc(&answer)
    }

    async fn apply_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        let local = description_to_rtc(&description)?;
        let pc = self.peer().await?;
        pc.set_local_description(local).await?;
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.final_description.lock().clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pc) = self.peer.get() {
            close_peer(pc, &self.events).await;
        }
    }
}

async fn close_peer(pc: &RTCPeerConnection, events: &SessionEvents) {
    if let Err(err) = pc.close().await {
        tracing::debug!(
            target: "beach_cams::negotiation",
            slot = %events.slot,
            error = %err,
            "peer connection close failed"
        );
    }
}

fn connectivity_from_rtc(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            ConnectivityState::New
        }
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

fn description_from_rtc(
    desc: &RTCSessionDescription,
) -> Result<SessionDescription, CapabilityError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(CapabilityError::new("unspecified sdp type"));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

fn description_to_rtc(
    description: &SessionDescription,
) -> Result<RTCSessionDescription, CapabilityError> {
    let sdp = description.sdp.clone();
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpKind::Rollback => {
            return Err(CapabilityError::new("unsupported sdp type rollback"));
        }
    };
    Ok(rtc)
}
