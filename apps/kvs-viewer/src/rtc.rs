//! webrtc-rs backed implementations of [`PeerConnection`] and
//! [`CallConnector`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use kvs_signaling::{
    IceCandidate, IceServer, ResolvedChannel, SdpKind, SessionDescription, SigV4Signer,
    SignalingClient, SignalingClientConfig, SignalingEvent,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceTransportPolicy;
use crate::error::{ViewerError, ViewerResult};
use crate::media::{MediaStream, MediaTrack, TrackEvent, TrackKind};
use crate::peer::{CallConnector, CallParts, OfferOptions, PeerConnection, PeerEvent, PeerStats};

fn build_api() -> ViewerResult<API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

pub fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_policy(policy: IceTransportPolicy) -> RTCIceTransportPolicy {
    match policy {
        IceTransportPolicy::All => RTCIceTransportPolicy::All,
        IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
    }
}

fn to_rtc_description(description: SessionDescription) -> ViewerResult<RTCSessionDescription> {
    let SessionDescription { kind, sdp } = description;
    let rtc = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpKind::Rollback => {
            return Err(ViewerError::Peer(
                "rollback descriptions are not supported".into(),
            ));
        }
    };
    Ok(rtc)
}

fn from_rtc_description(description: &RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

/// A received track. RTP is drained on a background task so the
/// interceptors keep producing receiver reports.
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
    packets: Arc<AtomicU64>,
    receiver: Arc<RTCRtpReceiver>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteTrack {
    fn spawn(track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>) -> Arc<Self> {
        let id = track.id();
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        let packets = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&packets);
        let reader = Arc::clone(&track);
        let track_id = id.clone();
        let pump = tokio::spawn(async move {
            let mut bytes: u64 = 0;
            while let Ok((packet, _)) = reader.read_rtp().await {
                counter.fetch_add(1, Ordering::Relaxed);
                bytes += packet.payload.len() as u64;
                trace!(track = %track_id, seq = packet.header.sequence_number, bytes, "rtp");
            }
            debug!(track = %track_id, bytes, "remote track ended");
        });

        Arc::new(Self {
            id,
            kind,
            live: AtomicBool::new(true),
            packets,
            receiver,
            pump: Mutex::new(Some(pump)),
        })
    }
}

#[async_trait]
impl MediaTrack for RemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Err(err) = self.receiver.stop().await {
            debug!(track = %self.id, error = %err, "receiver stop failed");
        }
    }

    fn packets_received(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    transceivers_added: AtomicBool,
}

impl RtcPeer {
    pub async fn new(
        ice_servers: &[IceServer],
        policy: IceTransportPolicy,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> ViewerResult<Self> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ice_transport_policy: to_rtc_policy(policy),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        register_handlers(&pc, events);
        Ok(Self {
            pc,
            transceivers_added: AtomicBool::new(false),
        })
    }

    async fn add_receive_transceivers(&self, options: OfferOptions) -> ViewerResult<()> {
        if self.transceivers_added.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let wanted = [
            (options.receive_audio, RTPCodecType::Audio),
            (options.receive_video, RTPCodecType::Video),
        ];
        for (enabled, kind) in wanted {
            if !enabled {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(from_candidate_init(init)),
                    Err(err) => {
                        warn!(error = %err, "failed to serialize local candidate");
                        return;
                    }
                },
                None => None,
            };
            let _ = events.send(PeerEvent::LocalCandidate(candidate));
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    warn!(%state, "peer connection state changed")
                }
                _ => info!(%state, "peer connection state changed"),
            }
        })
    }));

    let streams: Arc<Mutex<HashMap<String, MediaStream>>> = Arc::new(Mutex::new(HashMap::new()));
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            let streams = Arc::clone(&streams);
            Box::pin(async move {
                let stream_id = track.stream_id();
                let remote = RemoteTrack::spawn(track, receiver);
                let remote: Arc<dyn MediaTrack> = remote;
                let stream_list = if stream_id.is_empty() {
                    Vec::new()
                } else {
                    let stream = streams
                        .lock()
                        .entry(stream_id.clone())
                        .or_insert_with(|| MediaStream::new(stream_id))
                        .clone();
                    stream.add_track(Arc::clone(&remote));
                    vec![stream]
                };
                let _ = events.send(PeerEvent::Track(TrackEvent {
                    track: remote,
                    streams: stream_list,
                }));
            })
        },
    ));
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self, options: OfferOptions) -> ViewerResult<SessionDescription> {
        self.add_receive_transceivers(options).await?;
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> ViewerResult<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|description| from_rtc_description(&description))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> ViewerResult<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> ViewerResult<()> {
        self.pc.add_ice_candidate(to_candidate_init(candidate)).await?;
        Ok(())
    }

    async fn stats(&self) -> ViewerResult<PeerStats> {
        let report = self.pc.get_stats().await;
        Ok(PeerStats {
            connection_state: self.pc.connection_state().to_string(),
            report_count: report.reports.len(),
        })
    }

    async fn close(&self) -> ViewerResult<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Production connector: a presigned WebSocket signaling client and a
/// webrtc-rs peer connection configured from the resolved channel.
#[derive(Debug, Clone)]
pub struct RtcConnector {
    signaling: SignalingClientConfig,
    signer: SigV4Signer,
    ice_servers: Vec<IceServer>,
    ice_transport_policy: IceTransportPolicy,
}

impl RtcConnector {
    pub fn new(resolved: &ResolvedChannel, client_id: impl Into<String>, signer: SigV4Signer) -> Self {
        Self {
            signaling: SignalingClientConfig::viewer(
                resolved.channel_arn.clone(),
                resolved.endpoints.wss(),
                client_id,
            ),
            signer,
            ice_servers: resolved.ice_servers.clone(),
            ice_transport_policy: IceTransportPolicy::All,
        }
    }

    pub fn with_ice_transport_policy(mut self, policy: IceTransportPolicy) -> Self {
        self.ice_transport_policy = policy;
        self
    }
}

#[async_trait]
impl CallConnector for RtcConnector {
    async fn connect(
        &self,
        signaling_events: mpsc::UnboundedSender<SignalingEvent>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> ViewerResult<CallParts> {
        let peer = RtcPeer::new(&self.ice_servers, self.ice_transport_policy, peer_events).await?;
        let signaling = SignalingClient::new(
            self.signaling.clone(),
            self.signer.clone(),
            signaling_events,
        );
        debug!(
            channel_arn = %self.signaling.channel_arn,
            ice_servers = self.ice_servers.len(),
            "call collaborators ready"
        );
        Ok(CallParts {
            signaling: Arc::new(signaling),
            peer: Arc::new(peer),
        })
    }
}
