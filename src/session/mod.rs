//! Pairing session state machine
//!
//! The orchestrator owning the pairing session, the signaling channel and the
//! peer controller. All inputs (public verbs, signaling events, connectivity
//! changes, completions of spawned work) funnel into one queue consumed by a
//! single worker task, so handlers never run concurrently and need no locks.
//!
//! Every input produced by asynchronous work carries the session epoch it was
//! spawned under. Teardown bumps the epoch, which turns every continuation of
//! a superseded session into a no-op instead of a mutation of fresh state.

use crate::capture::{CaptureConstraints, CaptureSource, X11DisplaySource, X11WindowSource};
use crate::config::{Config, ROLE_DESKTOP};
use crate::pairing::{DeviceMetadata, PairingError, PairingGateway, PairingIssuer, PairingSession};
use crate::peer::{ConnectivitySink, PeerError, PeerSessionController};
use crate::signaling::{SignalKind, SignalingChannel, SignalingConnector, SignalingEvent, WebSocketSignaling};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Lifecycle state of the pairing session. Exactly one value at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No session; a pairing request is needed to proceed
    Idle,
    /// The pairing HTTP round trip is in flight
    Requesting,
    /// Registered with the relay, waiting for a companion to scan the code
    Waiting,
    /// A peer announced readiness; negotiation is running
    Pairing,
    /// The peer connection is up and media is flowing
    Streaming,
    /// A failure occurred; `clear_error()` returns to Idle
    Error,
}

/// Everything the UI layer observes, published through a watch channel.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    /// Short-lived code identifying this attempt, shown to the user
    pub pairing_code: Option<String>,
    /// Absolute expiry of the code, milliseconds since the epoch
    pub expires_at: Option<u64>,
    /// Renderable pairing token (QR code payload)
    pub qr_data: Option<String>,
    /// Whether a companion peer is currently attached
    pub peer_connected: bool,
    /// Human-readable failure message while in the Error state
    pub error: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            pairing_code: None,
            expires_at: None,
            qr_data: None,
            peer_connected: false,
            error: None,
        }
    }
}

/// Public verbs, queued as inputs like everything else
#[derive(Debug)]
enum Command {
    Request,
    Stop,
    ClearError,
}

/// Result of the spawned pairing-plus-connect sequence
struct OpenedSession {
    pairing: PairingSession,
    channel: SignalingChannel,
}

/// One item on the worker's input queue.
///
/// Everything except commands is tagged with the epoch the producing task was
/// spawned under; a mismatch means the session moved on and the input is
/// dropped.
enum SessionInput {
    Command(Command),
    Signaling {
        epoch: u64,
        event: SignalingEvent,
    },
    Connectivity {
        epoch: u64,
        state: RTCPeerConnectionState,
    },
    Opened {
        epoch: u64,
        result: Result<OpenedSession, String>,
    },
    EstablishFailed {
        epoch: u64,
        message: String,
    },
}

/// Collaborators behind trait seams, shared with spawned tasks
struct SessionDeps {
    issuer: Box<dyn PairingIssuer>,
    connector: Box<dyn SignalingConnector>,
    sources: Vec<Box<dyn CaptureSource>>,
    platform: String,
    ice_servers: Vec<String>,
    constraints: CaptureConstraints,
}

/// Handle to the session worker. Cheap to clone via the channel senders it
/// wraps; dropping every handle shuts the worker down.
pub struct SessionManager {
    inputs: mpsc::UnboundedSender<SessionInput>,
    status_rx: watch::Receiver<StatusSnapshot>,
}

impl SessionManager {
    /// Build the manager with the real collaborators and start its worker
    pub fn new(config: &Config) -> Result<Self, PairingError> {
        let issuer = PairingGateway::new(
            &config.pairing.endpoint,
            Duration::from_secs(config.pairing.http_timeout_secs),
        )?;

        let display = config.capture.display.clone();
        let sources: Vec<Box<dyn CaptureSource>> = vec![
            Box::new(X11DisplaySource::new(display.clone())),
            Box::new(X11WindowSource::new(display)),
        ];

        Ok(Self::spawn(SessionDeps {
            issuer: Box::new(issuer),
            connector: Box::new(WebSocketSignaling),
            sources,
            platform: config.pairing.platform.clone(),
            ice_servers: config.ice.servers.clone(),
            constraints: CaptureConstraints::from(&config.capture),
        }))
    }

    fn spawn(deps: SessionDeps) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());

        let worker = SessionWorker {
            epoch: 0,
            snapshot: StatusSnapshot::default(),
            status_tx,
            deps: Arc::new(deps),
            inputs: inputs_tx.clone(),
            channel: None,
            controller: None,
        };
        tokio::spawn(worker.run(inputs_rx));

        Self {
            inputs: inputs_tx,
            status_rx,
        }
    }

    /// Request a fresh pairing session, unconditionally releasing any prior one
    pub fn request_pairing_code(&self) {
        let _ = self.inputs.send(SessionInput::Command(Command::Request));
    }

    /// Tear the current session down and return to Idle
    pub fn stop_session(&self) {
        let _ = self.inputs.send(SessionInput::Command(Command::Stop));
    }

    /// Leave the Error state. No effect in any other state.
    pub fn clear_error(&self) {
        let _ = self.inputs.send(SessionInput::Command(Command::ClearError));
    }

    /// Observe status transitions
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }

    /// The current snapshot
    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }
}

struct SessionWorker {
    epoch: u64,
    snapshot: StatusSnapshot,
    status_tx: watch::Sender<StatusSnapshot>,
    deps: Arc<SessionDeps>,
    inputs: mpsc::UnboundedSender<SessionInput>,
    channel: Option<SignalingChannel>,
    controller: Option<Arc<PeerSessionController>>,
}

impl SessionWorker {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
        while let Some(input) = inputs.recv().await {
            self.handle(input).await;
        }
        // Every handle is gone; leave nothing running.
        self.release_resources().await;
    }

    async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Command(command) => self.handle_command(command).await,
            SessionInput::Signaling { epoch, event } => {
                if epoch == self.epoch {
                    self.handle_signaling(event).await;
                }
            }
            SessionInput::Connectivity { epoch, state } => {
                if epoch == self.epoch {
                    self.handle_connectivity(state).await;
                }
            }
            SessionInput::Opened { epoch, result } => {
                if epoch == self.epoch {
                    self.handle_opened(result).await;
                } else if let Ok(opened) = result {
                    // The session moved on while we were connecting.
                    opened.channel.close();
                }
            }
            SessionInput::EstablishFailed { epoch, message } => {
                if epoch == self.epoch {
                    self.fail(message).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request => {
                self.release_resources().await;
                self.snapshot = StatusSnapshot {
                    status: SessionStatus::Requesting,
                    ..Default::default()
                };
                self.publish();
                self.spawn_open();
            }
            Command::Stop => self.teardown().await,
            Command::ClearError => {
                if self.snapshot.status == SessionStatus::Error {
                    self.snapshot = StatusSnapshot::default();
                    self.publish();
                }
            }
        }
    }

    /// Pairing request plus signaling connect, off the worker so commands and
    /// events keep flowing while the round trips are in flight.
    fn spawn_open(&self) {
        let epoch = self.epoch;
        let deps = self.deps.clone();
        let inputs = self.inputs.clone();

        tokio::spawn(async move {
            let result = open_session(&deps, epoch, inputs.clone()).await;
            let _ = inputs.send(SessionInput::Opened { epoch, result });
        });
    }

    async fn handle_opened(&mut self, result: Result<OpenedSession, String>) {
        match result {
            Ok(opened) => {
                info!(
                    "Pairing code {} issued, registered with relay",
                    opened.pairing.code
                );
                self.snapshot.status = SessionStatus::Waiting;
                self.snapshot.pairing_code = Some(opened.pairing.code);
                self.snapshot.expires_at = Some(opened.pairing.expires_at);
                self.snapshot.qr_data = Some(opened.pairing.qr_data);
                self.publish();
                self.channel = Some(opened.channel);
            }
            Err(message) => self.fail(message).await,
        }
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Registered {
                expires_at,
                peer_connected,
            } => {
                self.snapshot.expires_at = Some(expires_at);
                self.snapshot.peer_connected = peer_connected;
                self.publish();
            }
            SignalingEvent::PeerReady => {
                if self.snapshot.status == SessionStatus::Waiting {
                    self.snapshot.status = SessionStatus::Pairing;
                    self.publish();
                    self.spawn_establish();
                } else {
                    debug!("Ignoring peer_ready while {:?}", self.snapshot.status);
                }
            }
            SignalingEvent::Signal { kind, payload } => match kind {
                SignalKind::Answer => {
                    if let Some(controller) = self.controller.clone() {
                        if let Err(e) = controller.apply_answer(payload).await {
                            self.fail(e.to_string()).await;
                        }
                    } else {
                        debug!("Dropping answer without an active negotiation");
                    }
                }
                SignalKind::Ice => {
                    if let Some(controller) = &self.controller {
                        if let Err(e) = controller.add_remote_candidate(payload).await {
                            warn!("Dropping remote candidate: {}", e);
                        }
                    } else {
                        debug!("Dropping candidate without an active negotiation");
                    }
                }
                SignalKind::Control => {
                    debug!("Dropping inbound control signal (not carried here)");
                }
                SignalKind::Offer => {
                    debug!("Dropping unexpected inbound offer");
                }
            },
            SignalingEvent::PeerLeft => {
                info!("Peer left, returning to waiting");
                if let Some(controller) = self.controller.take() {
                    controller.release().await;
                }
                self.snapshot.status = SessionStatus::Waiting;
                self.snapshot.peer_connected = false;
                self.publish();
            }
            SignalingEvent::SessionExpired | SignalingEvent::Terminated => {
                info!("Session ended by relay");
                self.teardown().await;
            }
            SignalingEvent::Error { message } => {
                self.fail(format!("signaling error: {}", message)).await;
            }
            SignalingEvent::Close => {
                // A close without a preceding error still ends the session.
                self.fail("signaling channel closed".to_string()).await;
            }
        }
    }

    /// Exactly one establish per session: the Waiting -> Pairing guard in the
    /// peer_ready handler has already fired before this is called.
    fn spawn_establish(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };

        let controller = PeerSessionController::new(self.deps.ice_servers.clone());
        self.controller = Some(controller.clone());

        let epoch = self.epoch;
        let deps = self.deps.clone();
        let inputs = self.inputs.clone();
        let sink: ConnectivitySink = {
            let inputs = inputs.clone();
            Arc::new(move |state| {
                let _ = inputs.send(SessionInput::Connectivity { epoch, state });
            })
        };

        tokio::spawn(async move {
            if let Err(e) = controller
                .establish(channel, &deps.sources, &deps.constraints, sink)
                .await
            {
                let _ = inputs.send(SessionInput::EstablishFailed {
                    epoch,
                    message: e.to_string(),
                });
            }
        });
    }

    async fn handle_connectivity(&mut self, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Connected => {
                if self.snapshot.status == SessionStatus::Pairing {
                    info!("Peer connection established, streaming");
                    self.snapshot.status = SessionStatus::Streaming;
                    self.snapshot.peer_connected = true;
                    self.publish();
                }
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                if matches!(
                    self.snapshot.status,
                    SessionStatus::Pairing | SessionStatus::Streaming
                ) {
                    self.fail(PeerError::ConnectionLost(state.to_string()).to_string())
                        .await;
                }
            }
            _ => {}
        }
    }

    /// Release everything and surface a failure. Same release path as
    /// teardown; only the resulting snapshot differs.
    async fn fail(&mut self, message: String) {
        warn!("Session failed: {}", message);
        self.release_resources().await;
        self.snapshot = StatusSnapshot {
            status: SessionStatus::Error,
            error: Some(message),
            ..Default::default()
        };
        self.publish();
    }

    /// The single teardown routine used by stop, terminal signaling events
    /// and a fresh pairing request.
    async fn teardown(&mut self) {
        self.release_resources().await;
        self.snapshot = StatusSnapshot::default();
        self.publish();
    }

    /// Bump the epoch (invalidating every outstanding continuation), then
    /// release the channel and the peer resources.
    async fn release_resources(&mut self) {
        self.epoch += 1;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        if let Some(controller) = self.controller.take() {
            controller.release().await;
        }
    }

    fn publish(&self) {
        let _ = self.status_tx.send(self.snapshot.clone());
    }
}

/// The pairing round trip followed by the signaling connect. Signaling events
/// are forwarded onto the worker queue tagged with the spawning epoch.
async fn open_session(
    deps: &SessionDeps,
    epoch: u64,
    inputs: mpsc::UnboundedSender<SessionInput>,
) -> Result<OpenedSession, String> {
    let metadata = DeviceMetadata::now(&deps.platform);
    let pairing = deps
        .issuer
        .request_pairing(&metadata)
        .await
        .map_err(|e| e.to_string())?;

    let (channel, mut events) = deps
        .connector
        .connect(&pairing.signaling_url, &pairing.code, ROLE_DESKTOP)
        .await
        .map_err(|e| e.to_string())?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if inputs.send(SessionInput::Signaling { epoch, event }).is_err() {
                break;
            }
        }
    });

    Ok(OpenedSession { pairing, channel })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{video_track, CaptureError, LocalStream, LocalTrack};
    use crate::signaling::ChannelError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn pairing_session() -> PairingSession {
        PairingSession {
            code: "ABC123".to_string(),
            expires_at: 1_700_000_300_000,
            qr_data: "tether://pair/ABC123".to_string(),
            signaling_url: "wss://signal.example.com/ws".to_string(),
        }
    }

    struct StubIssuer {
        fail: bool,
        /// With a gate set, the pairing round trip suspends until the test
        /// releases it, keeping intermediate states observable.
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PairingIssuer for StubIssuer {
        async fn request_pairing(
            &self,
            _metadata: &DeviceMetadata,
        ) -> Result<PairingSession, PairingError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                Err(PairingError::RequestFailed(503))
            } else {
                Ok(pairing_session())
            }
        }
    }

    /// Handles to one stubbed signaling connection: inject inbound events,
    /// observe outbound frames.
    struct ChannelTap {
        events: mpsc::UnboundedSender<SignalingEvent>,
        outbound: mpsc::UnboundedReceiver<Message>,
    }

    struct StubConnector {
        taps: mpsc::UnboundedSender<ChannelTap>,
    }

    #[async_trait]
    impl SignalingConnector for StubConnector {
        async fn connect(
            &self,
            _ws_url: &str,
            _code: &str,
            _role: &str,
        ) -> Result<(SignalingChannel, mpsc::UnboundedReceiver<SignalingEvent>), ChannelError>
        {
            let (channel, outbound, events_tx, events_rx) = SignalingChannel::stub();
            let _ = self.taps.send(ChannelTap {
                events: events_tx,
                outbound,
            });
            Ok((channel, events_rx))
        }
    }

    /// Capture source yielding an empty stream while exposing the track's
    /// ended flag to the test. With a gate set, acquisition suspends until
    /// the test releases it.
    struct TapSource {
        ended: Arc<parking_lot::Mutex<Option<Arc<AtomicBool>>>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl CaptureSource for TapSource {
        fn label(&self) -> &'static str {
            "stub"
        }

        async fn open(
            &self,
            _constraints: &CaptureConstraints,
        ) -> Result<LocalStream, CaptureError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let track = LocalTrack::new(video_track("video"));
            *self.ended.lock() = Some(track.ended_handle());
            let (frames, _) = tokio::sync::broadcast::channel(4);
            Ok(LocalStream::new("stub", vec![track], frames))
        }
    }

    struct Harness {
        manager: SessionManager,
        taps: mpsc::UnboundedReceiver<ChannelTap>,
        ended: Arc<parking_lot::Mutex<Option<Arc<AtomicBool>>>>,
    }

    fn harness(fail_pairing: bool) -> Harness {
        harness_with(fail_pairing, None)
    }

    fn harness_with(fail_pairing: bool, gate: Option<Arc<Notify>>) -> Harness {
        harness_full(fail_pairing, None, gate)
    }

    fn harness_full(
        fail_pairing: bool,
        issuer_gate: Option<Arc<Notify>>,
        gate: Option<Arc<Notify>>,
    ) -> Harness {
        let (taps_tx, taps_rx) = mpsc::unbounded_channel();
        let ended = Arc::new(parking_lot::Mutex::new(None));

        let manager = SessionManager::spawn(SessionDeps {
            issuer: Box::new(StubIssuer {
                fail: fail_pairing,
                gate: issuer_gate,
            }),
            connector: Box::new(StubConnector { taps: taps_tx }),
            sources: vec![Box::new(TapSource {
                ended: ended.clone(),
                gate,
            })],
            platform: "desktop-linux".to_string(),
            ice_servers: vec!["stun:stun.example.com:3478".to_string()],
            constraints: CaptureConstraints::default(),
        });

        Harness {
            manager,
            taps: taps_rx,
            ended,
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<StatusSnapshot>,
        status: SessionStatus,
    ) -> StatusSnapshot {
        timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.borrow().clone();
                if snapshot.status == status {
                    return snapshot;
                }
                rx.changed().await.expect("status channel closed");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", status))
    }

    async fn next_tap(harness: &mut Harness) -> ChannelTap {
        timeout(Duration::from_secs(5), harness.taps.recv())
            .await
            .expect("timed out waiting for signaling connect")
            .expect("connector dropped")
    }

    /// Reach Waiting and hand back the live tap
    async fn start_session(harness: &mut Harness) -> ChannelTap {
        harness.manager.request_pairing_code();
        let tap = next_tap(harness).await;
        let mut status = harness.manager.subscribe();
        wait_for(&mut status, SessionStatus::Waiting).await;
        tap
    }

    /// Drive Waiting -> Pairing and swallow the outbound offer
    async fn reach_pairing(harness: &mut Harness, tap: &mut ChannelTap) {
        let _ = tap.events.send(SignalingEvent::PeerReady);
        let mut status = harness.manager.subscribe();
        wait_for(&mut status, SessionStatus::Pairing).await;
    }

    fn outbound_signal_kind(frame: &Message) -> Option<SignalKind> {
        let Message::Text(text) = frame else {
            return None;
        };
        match serde_json::from_str(text) {
            Ok(crate::signaling::ClientEnvelope::Signal { kind, .. }) => Some(kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_request_reaches_waiting_with_code() {
        let issuer_gate = Arc::new(Notify::new());
        let mut harness = harness_full(false, Some(issuer_gate.clone()), None);
        let mut status = harness.manager.subscribe();

        harness.manager.request_pairing_code();
        wait_for(&mut status, SessionStatus::Requesting).await;
        issuer_gate.notify_one();
        let _tap = next_tap(&mut harness).await;

        let snapshot = wait_for(&mut status, SessionStatus::Waiting).await;
        assert_eq!(snapshot.pairing_code.as_deref(), Some("ABC123"));
        assert_eq!(snapshot.expires_at, Some(1_700_000_300_000));
        assert_eq!(snapshot.qr_data.as_deref(), Some("tether://pair/ABC123"));
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_request_failure_reaches_error_and_clears() {
        let harness = harness(true);
        let mut status = harness.manager.subscribe();

        harness.manager.request_pairing_code();
        let snapshot = wait_for(&mut status, SessionStatus::Error).await;
        assert!(snapshot.error.as_deref().unwrap_or("").contains("503"));
        assert!(snapshot.pairing_code.is_none());

        harness.manager.clear_error();
        let snapshot = wait_for(&mut status, SessionStatus::Idle).await;
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_registered_updates_expiry_in_waiting() {
        let mut harness = harness(false);
        let tap = start_session(&mut harness).await;

        let _ = tap.events.send(SignalingEvent::Registered {
            expires_at: 1_700_000_999_000,
            peer_connected: false,
        });

        let mut status = harness.manager.subscribe();
        let snapshot = timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = status.borrow().clone();
                if snapshot.expires_at == Some(1_700_000_999_000) {
                    return snapshot;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .expect("expiry never updated");
        assert_eq!(snapshot.status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn test_stop_resets_everything_and_closes_channel() {
        let mut harness = harness(false);
        let mut tap = start_session(&mut harness).await;
        let mut status = harness.manager.subscribe();

        harness.manager.stop_session();
        let snapshot = wait_for(&mut status, SessionStatus::Idle).await;
        assert!(snapshot.pairing_code.is_none());
        assert!(snapshot.qr_data.is_none());
        assert!(snapshot.expires_at.is_none());
        assert!(snapshot.error.is_none());
        assert!(!snapshot.peer_connected);

        // The channel received its close frame.
        let frame = timeout(Duration::from_secs(5), tap.outbound.recv())
            .await
            .expect("timed out waiting for close frame");
        assert!(matches!(frame, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_session_expired_acts_like_stop() {
        let mut harness = harness(false);
        let tap = start_session(&mut harness).await;
        let mut status = harness.manager.subscribe();

        let _ = tap.events.send(SignalingEvent::SessionExpired);
        let snapshot = wait_for(&mut status, SessionStatus::Idle).await;
        assert!(snapshot.pairing_code.is_none());
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_terminated_acts_like_stop() {
        let mut harness = harness(false);
        let tap = start_session(&mut harness).await;
        let mut status = harness.manager.subscribe();

        let _ = tap.events.send(SignalingEvent::Terminated);
        wait_for(&mut status, SessionStatus::Idle).await;
    }

    #[tokio::test]
    async fn test_channel_close_surfaces_error() {
        let mut harness = harness(false);
        let tap = start_session(&mut harness).await;
        let mut status = harness.manager.subscribe();

        let _ = tap.events.send(SignalingEvent::Close);
        let snapshot = wait_for(&mut status, SessionStatus::Error).await;
        assert!(snapshot
            .error
            .as_deref()
            .unwrap_or("")
            .contains("closed"));
    }

    #[tokio::test]
    async fn test_duplicate_peer_ready_sends_one_offer() {
        let mut harness = harness(false);
        let mut tap = start_session(&mut harness).await;

        let _ = tap.events.send(SignalingEvent::PeerReady);
        let _ = tap.events.send(SignalingEvent::PeerReady);

        let mut status = harness.manager.subscribe();
        wait_for(&mut status, SessionStatus::Pairing).await;

        // Exactly one offer on the wire.
        let mut offers = 0;
        let first = timeout(Duration::from_secs(10), tap.outbound.recv())
            .await
            .expect("timed out waiting for the offer")
            .expect("outbound closed");
        if outbound_signal_kind(&first) == Some(SignalKind::Offer) {
            offers += 1;
        }
        while let Ok(Some(frame)) =
            timeout(Duration::from_millis(300), tap.outbound.recv()).await
        {
            if outbound_signal_kind(&frame) == Some(SignalKind::Offer) {
                offers += 1;
            }
        }
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn test_connected_reaches_streaming() {
        let mut harness = harness(false);
        let mut tap = start_session(&mut harness).await;
        reach_pairing(&mut harness, &mut tap).await;

        // Epoch 1: the first request bumps the initial epoch of 0.
        let _ = harness.manager.inputs.send(SessionInput::Connectivity {
            epoch: 1,
            state: RTCPeerConnectionState::Connected,
        });

        let mut status = harness.manager.subscribe();
        let snapshot = wait_for(&mut status, SessionStatus::Streaming).await;
        assert!(snapshot.peer_connected);
    }

    #[tokio::test]
    async fn test_connection_failure_stops_tracks_and_errors() {
        let mut harness = harness(false);
        let mut tap = start_session(&mut harness).await;
        reach_pairing(&mut harness, &mut tap).await;

        // Wait until the stream exists before failing the connection.
        timeout(Duration::from_secs(10), async {
            while harness.ended.lock().is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("capture never acquired");

        let _ = harness.manager.inputs.send(SessionInput::Connectivity {
            epoch: 1,
            state: RTCPeerConnectionState::Failed,
        });

        let mut status = harness.manager.subscribe();
        let snapshot = wait_for(&mut status, SessionStatus::Error).await;
        assert!(snapshot
            .error
            .as_deref()
            .unwrap_or("")
            .contains("connection lost"));

        let ended = harness.ended.lock().clone().expect("no track recorded");
        assert!(ended.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_during_suspended_capture_discards_attempt() {
        let gate = Arc::new(Notify::new());
        let mut harness = harness_with(false, Some(gate.clone()));
        let mut tap = start_session(&mut harness).await;
        let mut status = harness.manager.subscribe();

        // Negotiation starts but acquisition stays suspended on the gate.
        let _ = tap.events.send(SignalingEvent::PeerReady);
        wait_for(&mut status, SessionStatus::Pairing).await;

        harness.manager.stop_session();
        wait_for(&mut status, SessionStatus::Idle).await;

        // The suspended acquisition resolves after teardown; its stream must
        // be torn down by the stale attempt, not adopted.
        gate.notify_one();
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(ended) = harness.ended.lock().clone() {
                    if ended.load(Ordering::SeqCst) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("stale stream never released");

        // No offer ever reached the wire, and the session stayed Idle.
        while let Ok(Some(frame)) =
            timeout(Duration::from_millis(300), tap.outbound.recv()).await
        {
            assert!(outbound_signal_kind(&frame).is_none());
        }
        assert_eq!(harness.manager.status().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_peer_left_returns_to_waiting() {
        let mut harness = harness(false);
        let mut tap = start_session(&mut harness).await;
        reach_pairing(&mut harness, &mut tap).await;

        let _ = tap.events.send(SignalingEvent::PeerLeft);
        let mut status = harness.manager.subscribe();
        let snapshot = wait_for(&mut status, SessionStatus::Waiting).await;
        assert!(!snapshot.peer_connected);
        // The pairing code survives a peer departure.
        assert_eq!(snapshot.pairing_code.as_deref(), Some("ABC123"));
    }

    #[tokio::test]
    async fn test_new_request_releases_previous_session() {
        let mut harness = harness(false);
        let mut first_tap = start_session(&mut harness).await;

        harness.manager.request_pairing_code();
        let _second_tap = next_tap(&mut harness).await;
        let mut status = harness.manager.subscribe();
        wait_for(&mut status, SessionStatus::Waiting).await;

        // The first channel was closed exactly once.
        let frame = timeout(Duration::from_secs(5), first_tap.outbound.recv())
            .await
            .expect("timed out waiting for close frame");
        assert!(matches!(frame, Some(Message::Close(None))));

        // Events from the stale channel no longer reach the session.
        let _ = first_tap.events.send(SignalingEvent::SessionExpired);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.manager.status().status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn test_malformed_answer_without_negotiation_is_dropped() {
        let mut harness = harness(false);
        let tap = start_session(&mut harness).await;

        let _ = tap.events.send(SignalingEvent::Signal {
            kind: SignalKind::Answer,
            payload: json!({"sdp": "v=0\r\n"}),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.manager.status().status, SessionStatus::Waiting);
    }
}
