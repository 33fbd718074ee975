//! Peer session controller
//!
//! One controller per streaming attempt. `establish()` runs the negotiation
//! sequence up to the offer; the answer and remote candidates are applied by
//! the owning state machine as they arrive. `release()` is the single
//! teardown routine and is safe to call with any subset of the resources
//! present, including while `establish()` is still suspended — the cancel
//! flag is checked after every suspension point so a superseded attempt
//! cleans up whatever it created.

use super::PeerError;
use crate::capture::{self, CaptureConstraints, CaptureSource, LocalStream};
use crate::signaling::{SignalKind, SignalingChannel};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// Callback for coarse connectivity-state changes
pub type ConnectivitySink = Arc<dyn Fn(RTCPeerConnectionState) + Send + Sync>;

/// The mutable resource triple for one streaming attempt.
///
/// Every field is None before an attempt starts and after teardown.
#[derive(Default)]
struct PeerResources {
    peer: Option<Arc<RTCPeerConnection>>,
    stream: Option<LocalStream>,
    control: Option<Arc<RTCDataChannel>>,
}

/// Drives one peer negotiation and owns its resources
pub struct PeerSessionController {
    ice_servers: Vec<String>,
    cancelled: Arc<AtomicBool>,
    resources: Mutex<PeerResources>,
    pending_candidates: parking_lot::Mutex<Vec<RTCIceCandidateInit>>,
    remote_applied: AtomicBool,
}

impl PeerSessionController {
    pub fn new(ice_servers: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            ice_servers,
            cancelled: Arc::new(AtomicBool::new(false)),
            resources: Mutex::new(PeerResources::default()),
            pending_candidates: parking_lot::Mutex::new(Vec::new()),
            remote_applied: AtomicBool::new(false),
        })
    }

    /// Run the negotiation sequence up to transmitting the offer.
    ///
    /// Order matters: media first, then the peer connection, tracks, the
    /// control channel (before the offer so it is part of the initial
    /// negotiation), and finally the offer itself. Returns Ok(()) without
    /// side effects when the attempt was cancelled mid-flight.
    pub async fn establish(
        &self,
        channel: SignalingChannel,
        sources: &[Box<dyn CaptureSource>],
        constraints: &CaptureConstraints,
        on_connectivity: ConnectivitySink,
    ) -> Result<(), PeerError> {
        // 1. Local media, with the ordered capture fallback.
        let stream = capture::acquire_stream(sources, constraints)
            .await
            .map_err(PeerError::Media)?;
        let track_rtps: Vec<_> = stream.tracks().iter().map(|t| t.rtp()).collect();
        if self.install_stream(stream).await {
            return Ok(());
        }

        // 2. Peer connection against the rendezvous servers.
        let peer = self.build_peer_connection().await?;
        if self.install_peer(peer.clone()).await {
            return Ok(());
        }

        // 3. Attach every local track, send-only: this side never receives media.
        for rtp in track_rtps {
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: Vec::new(),
            };
            peer.add_transceiver_from_track(rtp, Some(init))
                .await
                .map_err(|e| {
                    PeerError::NegotiationFailed(format!("failed to add transceiver: {}", e))
                })?;
        }

        // 4. Control channel, ordered, opened before the offer.
        let control = peer
            .create_data_channel(
                "control",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                PeerError::NegotiationFailed(format!("failed to open control channel: {}", e))
            })?;
        if self.install_control(control).await {
            return Ok(());
        }

        // Locally discovered candidates go out as they are produced.
        let ice_channel = channel.clone();
        let ice_cancelled = self.cancelled.clone();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let channel = ice_channel.clone();
            let cancelled = ice_cancelled.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(&init) {
                        Ok(payload) => channel.send_signal(SignalKind::Ice, payload),
                        Err(e) => warn!("Failed to encode local candidate: {}", e),
                    },
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_cancelled = self.cancelled.clone();
        peer.on_peer_connection_state_change(Box::new(move |state| {
            if !state_cancelled.load(Ordering::SeqCst) {
                on_connectivity(state);
            }
            Box::pin(async {})
        }));

        // 5. Offer: create, apply locally, transmit.
        let offer = peer.create_offer(None).await.map_err(|e| {
            PeerError::NegotiationFailed(format!("failed to create offer: {}", e))
        })?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(|e| {
                PeerError::NegotiationFailed(format!("failed to set local description: {}", e))
            })?;
        if self.cancelled.load(Ordering::SeqCst) {
            self.release().await;
            return Ok(());
        }

        let payload = serde_json::to_value(&offer)
            .map_err(|e| PeerError::NegotiationFailed(format!("failed to encode offer: {}", e)))?;
        channel.send_signal(SignalKind::Offer, payload);

        Ok(())
    }

    /// Apply the remote answer, then flush any candidates that arrived first.
    pub async fn apply_answer(&self, payload: serde_json::Value) -> Result<(), PeerError> {
        let sdp = payload["sdp"]
            .as_str()
            .ok_or_else(|| PeerError::NegotiationFailed("answer without sdp".to_string()))?;
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| PeerError::NegotiationFailed(format!("invalid answer: {}", e)))?;

        let peer = self.active_peer().await?;
        peer.set_remote_description(answer).await.map_err(|e| {
            PeerError::NegotiationFailed(format!("failed to set remote description: {}", e))
        })?;
        self.remote_applied.store(true, Ordering::SeqCst);

        let pending: Vec<_> = self.pending_candidates.lock().drain(..).collect();
        for init in pending {
            if let Err(e) = peer.add_ice_candidate(init).await {
                warn!("Failed to apply buffered candidate: {}", e);
            }
        }
        Ok(())
    }

    /// Apply a remote connectivity candidate.
    ///
    /// Candidates may legitimately arrive before the answer; those are
    /// buffered until the remote description exists.
    pub async fn add_remote_candidate(&self, payload: serde_json::Value) -> Result<(), PeerError> {
        let init: RTCIceCandidateInit = serde_json::from_value(payload)
            .map_err(|e| PeerError::NegotiationFailed(format!("invalid candidate: {}", e)))?;

        if !self.remote_applied.load(Ordering::SeqCst) {
            debug!("Buffering candidate received before answer");
            self.pending_candidates.lock().push(init);
            return Ok(());
        }

        let peer = self.active_peer().await?;
        peer.add_ice_candidate(init).await.map_err(|e| {
            PeerError::NegotiationFailed(format!("failed to add candidate: {}", e))
        })?;
        Ok(())
    }

    /// The single teardown routine: close the control channel, close the
    /// peer connection, stop every track, null all three fields. Safe with
    /// any subset already absent, safe to repeat.
    pub async fn release(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        let mut resources = self.resources.lock().await;
        if let Some(control) = resources.control.take() {
            let _ = control.close().await;
        }
        if let Some(peer) = resources.peer.take() {
            let _ = peer.close().await;
        }
        if let Some(stream) = resources.stream.take() {
            stream.stop();
        }
        self.pending_candidates.lock().clear();
    }

    async fn active_peer(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        self.resources
            .lock()
            .await
            .peer
            .clone()
            .ok_or_else(|| PeerError::NegotiationFailed("no active peer connection".to_string()))
    }

    /// Store a resource, then re-check the cancel flag: a release that ran
    /// while we were suspended has already drained the slots, so anything
    /// stored after it must be torn down by us. Returns true when cancelled.
    async fn install_stream(&self, stream: LocalStream) -> bool {
        self.resources.lock().await.stream = Some(stream);
        self.bail_if_cancelled().await
    }

    async fn install_peer(&self, peer: Arc<RTCPeerConnection>) -> bool {
        self.resources.lock().await.peer = Some(peer);
        self.bail_if_cancelled().await
    }

    async fn install_control(&self, control: Arc<RTCDataChannel>) -> bool {
        self.resources.lock().await.control = Some(control);
        self.bail_if_cancelled().await
    }

    async fn bail_if_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            debug!("Peer establish superseded, releasing");
            self.release().await;
            true
        } else {
            false
        }
    }

    /// Build the peer connection in the teacher-configured shape: explicit
    /// video codecs, default interceptors, rendezvous servers for
    /// connectivity discovery only.
    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        let mut media_engine = MediaEngine::default();
        register_video_codecs(&mut media_engine)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            PeerError::NegotiationFailed(format!("failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer = api.new_peer_connection(config).await.map_err(|e| {
            PeerError::NegotiationFailed(format!("failed to create peer connection: {}", e))
        })?;

        Ok(Arc::new(peer))
    }
}

/// Register the video codecs offered for the screen stream
fn register_video_codecs(media_engine: &mut MediaEngine) -> Result<(), PeerError> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| PeerError::NegotiationFailed(format!("failed to register H264: {}", e)))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 97,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| PeerError::NegotiationFailed(format!("failed to register VP8: {}", e)))?;

    Ok(())
}
