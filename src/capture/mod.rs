//! Local media acquisition
//!
//! Capture strategies are tried in order, first success wins: full-display
//! capture is preferred, a focused-window grab is the fallback. The winning
//! strategy yields a [`LocalStream`] owning its tracks and the capture pump;
//! stopping the stream stops every track exactly once.

pub mod frame;
mod x11;

pub use frame::{Frame, FrameStats};
pub use x11::{X11DisplaySource, X11WindowSource};

use crate::config::CaptureConfig;
use async_trait::async_trait;
use log::{debug, info};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Capture-related errors
#[derive(Debug)]
pub enum CaptureError {
    /// The platform refused permission for the capture primitive
    PermissionDenied(String),
    /// No capture primitive exists for this strategy
    Unavailable(String),
    /// The capture primitive failed after acquisition started
    Failed(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::PermissionDenied(msg) => write!(f, "Capture permission denied: {}", msg),
            CaptureError::Unavailable(msg) => write!(f, "Capture unavailable: {}", msg),
            CaptureError::Failed(msg) => write!(f, "Capture failed: {}", msg),
        }
    }
}

impl Error for CaptureError {}

/// Requested capture parameters. No audio is ever captured.
#[derive(Debug, Clone, Copy)]
pub struct CaptureConstraints {
    /// Bounded frame rate
    pub fps: u32,
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            fps: 15,
            width: 1280,
            height: 720,
        }
    }
}

impl From<&CaptureConfig> for CaptureConstraints {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            fps: config.fps,
            width: config.width,
            height: config.height,
        }
    }
}

/// One local media track plus the pump task feeding it.
///
/// `stop()` aborts the pump and marks the track ended; both are safe to
/// repeat.
pub struct LocalTrack {
    rtp: Arc<TrackLocalStaticRTP>,
    ended: Arc<AtomicBool>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LocalTrack {
    /// Create a track without a pump (the pump may be attached later)
    pub fn new(rtp: Arc<TrackLocalStaticRTP>) -> Self {
        Self {
            rtp,
            ended: Arc::new(AtomicBool::new(false)),
            pump: parking_lot::Mutex::new(None),
        }
    }

    /// Attach the capture pump task driving this track
    pub fn attach_pump(&self, handle: JoinHandle<()>) {
        let mut pump = self.pump.lock();
        if self.ended.load(Ordering::SeqCst) {
            handle.abort();
        } else {
            *pump = Some(handle);
        }
    }

    /// The RTP track object attached to the peer connection
    pub fn rtp(&self) -> Arc<TrackLocalStaticRTP> {
        self.rtp.clone()
    }

    /// Whether the track has been stopped
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Flag shared with the pump loop so it can exit on its own
    pub(crate) fn ended_handle(&self) -> Arc<AtomicBool> {
        self.ended.clone()
    }

    /// Stop the track: abort the pump, mark ended. Idempotent.
    pub fn stop(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            if let Some(handle) = self.pump.lock().take() {
                handle.abort();
            }
        }
    }
}

/// The local media stream for one streaming attempt.
pub struct LocalStream {
    label: String,
    tracks: Vec<LocalTrack>,
    frames: broadcast::Sender<Frame>,
}

impl LocalStream {
    pub fn new(label: &str, tracks: Vec<LocalTrack>, frames: broadcast::Sender<Frame>) -> Self {
        Self {
            label: label.to_string(),
            tracks,
            frames,
        }
    }

    /// Which capture strategy produced this stream
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Raw captured frames, for the external encoder
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }

    /// Stop every track. Safe to call more than once.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Build the sendonly video track a capture source hands to the peer connection
pub fn video_track(id_prefix: &str) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_string(),
            rtcp_feedback: vec![],
        },
        format!("{}-{}", id_prefix, uuid::Uuid::new_v4()),
        "tether-stream".to_string(),
    ))
}

/// One capture strategy
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Strategy name, for logs
    fn label(&self) -> &'static str;

    /// Try to acquire a stream under the given constraints
    async fn open(&self, constraints: &CaptureConstraints) -> Result<LocalStream, CaptureError>;
}

/// Try each source in order; the first success wins.
///
/// A permission refusal aborts the whole acquisition — falling back to a
/// weaker capture would silently ignore the user's decision. A source that is
/// merely unavailable lets the next one try.
pub async fn acquire_stream(
    sources: &[Box<dyn CaptureSource>],
    constraints: &CaptureConstraints,
) -> Result<LocalStream, CaptureError> {
    let mut last = CaptureError::Unavailable("no capture source available".to_string());

    for source in sources {
        match source.open(constraints).await {
            Ok(stream) => {
                info!("Capture source '{}' acquired", source.label());
                return Ok(stream);
            }
            Err(CaptureError::PermissionDenied(msg)) => {
                return Err(CaptureError::PermissionDenied(msg));
            }
            Err(e) => {
                debug!("Capture source '{}' unavailable: {}", source.label(), e);
                last = e;
            }
        }
    }

    Err(last)
}
