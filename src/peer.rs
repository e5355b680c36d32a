//! Peer session: one peer connection and all negotiation against it.
//!
//! A [`PeerSession`] owns exactly one `RTCPeerConnection`, its local media
//! tracks and its candidate queue. Controllers never touch the connection
//! directly; they drive the session through offer/answer/candidate calls and
//! observe it through [`SessionEvent`]s.
//!
//! Track additions after the construction window trigger a renegotiation
//! cycle via the connection's negotiation-needed signal. The microphone
//! track attached during construction is part of the initial offer/answer
//! and must not renegotiate, so the signal is gated by a suppression flag
//! for exactly that window.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use tokio::sync::{Mutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::candidates::CandidateQueue;
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{LocalTrack, RemoteTrack};
use crate::sdp::apply_bitrate_bounds;
use crate::signaling::{SignalingBody, SignalingSender};
use crate::speaking::{SpeakingDetector, SpeakingEvent};
use crate::types::{TrackKind, TrackPurpose, UserId, VideoSource};

/// Connection state of one peer session.
///
/// `New → Connecting → {Connected | Failed} → Closed`, with
/// `Connected → Disconnected → {Connected | Closed}` as the transient-loss
/// sub-path. `Closed` is terminal; a closed session ignores all further
/// signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// What a session reports to its owning controller.
#[derive(Clone)]
pub enum SessionEvent {
    State {
        peer: UserId,
        state: ConnectionState,
    },
    RemoteTrack {
        peer: UserId,
        track: Arc<RemoteTrack>,
    },
}

/// Per-purpose encoding caps, applied best-effort on the sending side.
#[derive(Debug, Clone, Copy)]
pub struct EncodingLimits {
    pub max_kbps: u32,
    pub max_framerate: Option<u32>,
}

struct PeerInner {
    candidates: CandidateQueue,
    senders: HashMap<TrackPurpose, Arc<RTCRtpSender>>,
    local_tracks: HashMap<TrackPurpose, Arc<LocalTrack>>,
    remote_tracks: Vec<Arc<RemoteTrack>>,
    detectors: Vec<SpeakingDetector>,
    limits: HashMap<TrackPurpose, EncodingLimits>,
    /// One-shot expectation set by a camera-toggle broadcast and consumed by
    /// the next incoming video track. Two video starts racing back-to-back
    /// can mis-tag a track; the toggle-then-track protocol cannot tell them
    /// apart.
    pending_video: Option<VideoSource>,
    remote_audio_seen: bool,
}

pub struct PeerSession {
    me: UserId,
    remote_id: UserId,
    config: CallConfig,
    pc: Arc<RTCPeerConnection>,
    signaling: SignalingSender,
    events: mpsc::Sender<SessionEvent>,
    speaking: mpsc::Sender<SpeakingEvent>,
    suppress_negotiation: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    inner: Mutex<PeerInner>,
}

impl PeerSession {
    /// Creates the session and its peer connection.
    ///
    /// When `local_audio` is given, the microphone track is attached during
    /// construction; it rides the initial offer/answer instead of triggering
    /// a renegotiation.
    pub async fn new(
        me: UserId,
        remote_id: UserId,
        config: CallConfig,
        signaling: SignalingSender,
        events: mpsc::Sender<SessionEvent>,
        speaking: mpsc::Sender<SpeakingEvent>,
        local_audio: Option<Arc<LocalTrack>>,
    ) -> Result<Arc<Self>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let session = Arc::new(Self {
            me,
            remote_id,
            config,
            pc,
            signaling,
            events,
            speaking,
            suppress_negotiation: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(PeerInner {
                candidates: CandidateQueue::new(),
                senders: HashMap::new(),
                local_tracks: HashMap::new(),
                remote_tracks: Vec::new(),
                detectors: Vec::new(),
                limits: HashMap::new(),
                pending_video: None,
                remote_audio_seen: false,
            }),
        });

        session.wire_callbacks();

        if let Some(track) = local_audio {
            session.add_track(track).await?;
        }

        Ok(session)
    }

    fn wire_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = weak.upgrade() else { return };
                if session.closed.load(Ordering::SeqCst) {
                    return;
                }
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => session.signaling.send(
                        SignalingBody::IceCandidate { candidate: init },
                        Some(session.remote_id.clone()),
                    ),
                    Err(e) => debug!(target: "Calls/Peer", "candidate to_json: {e}"),
                }
            })
        }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(session) = weak.upgrade() else { return };
                    if session.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    let mapped = ConnectionState::from(state);
                    debug!(
                        target: "Calls/Peer",
                        "{}: connection state {mapped:?}", session.remote_id
                    );
                    let _ = session
                        .events
                        .send(SessionEvent::State {
                            peer: session.remote_id.clone(),
                            state: mapped,
                        })
                        .await;
                    if mapped.is_terminal() {
                        session.close().await;
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = weak.upgrade() else { return };
                if session.closed.load(Ordering::SeqCst) {
                    return;
                }
                session.handle_remote_track(track).await;
            })
        }));

        let weak = Arc::downgrade(self);
        self.pc.on_negotiation_needed(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = weak.upgrade() else { return };
                if session.closed.load(Ordering::SeqCst)
                    || session.suppress_negotiation.load(Ordering::SeqCst)
                {
                    return;
                }
                if let Err(e) = session.send_offer().await {
                    warn!(
                        target: "Calls/Peer",
                        "{}: renegotiation failed: {e}", session.remote_id
                    );
                }
            })
        }));
    }

    pub fn remote_id(&self) -> &UserId {
        &self.remote_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Creates an offer, applies bitrate bounds and sends it to the remote
    /// peer. Used for both the initial offer and renegotiation.
    ///
    /// The first call ends the construction window: track additions from
    /// here on renegotiate.
    pub async fn send_offer(&self) -> Result<(), CallError> {
        if self.is_closed() {
            return Ok(());
        }
        self.suppress_negotiation.store(false, Ordering::SeqCst);
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;

        let patched = self.shape_sdp(&offer.sdp).await;
        let sdp = RTCSessionDescription::offer(patched)?;
        if self.is_closed() {
            // Closed while the description was being created; never send it.
            return Ok(());
        }
        self.signaling
            .send(SignalingBody::Offer { sdp }, Some(self.remote_id.clone()));
        debug!(target: "Calls/Peer", "{} -> {}: offer sent", self.me, self.remote_id);
        Ok(())
    }

    /// Responder path: applies the remote offer, drains queued candidates,
    /// then answers back over signaling.
    pub async fn accept_offer(&self, sdp: RTCSessionDescription) -> Result<(), CallError> {
        if self.is_closed() {
            return Ok(());
        }
        self.suppress_negotiation.store(false, Ordering::SeqCst);
        self.apply_remote_description(sdp).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;

        let patched = self.shape_sdp(&answer.sdp).await;
        let sdp = RTCSessionDescription::answer(patched)?;
        if self.is_closed() {
            return Ok(());
        }
        self.signaling
            .send(SignalingBody::Answer { sdp }, Some(self.remote_id.clone()));
        debug!(target: "Calls/Peer", "{} -> {}: answer sent", self.me, self.remote_id);
        Ok(())
    }

    /// Initiator path: applies the remote answer and drains queued
    /// candidates.
    pub async fn accept_answer(&self, sdp: RTCSessionDescription) -> Result<(), CallError> {
        if self.is_closed() {
            return Ok(());
        }
        self.apply_remote_description(sdp).await
    }

    async fn apply_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), CallError> {
        self.pc.set_remote_description(sdp).await?;

        let queued = self.inner.lock().await.candidates.drain();
        for candidate in queued {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                // A malformed candidate must not break the rest of the batch.
                warn!(target: "Calls/Peer", "{}: candidate skipped: {e}", self.remote_id);
            }
        }
        Ok(())
    }

    /// Accepts a trickled candidate: queued until a remote description is
    /// applied, immediate afterwards. Apply failures are logged and skipped.
    pub async fn handle_candidate(&self, candidate: RTCIceCandidateInit) {
        if self.is_closed() {
            return;
        }
        let immediate = self.inner.lock().await.candidates.enqueue(candidate);
        if let Some(candidate) = immediate
            && let Err(e) = self.pc.add_ice_candidate(candidate).await
        {
            warn!(target: "Calls/Peer", "{}: candidate skipped: {e}", self.remote_id);
        }
    }

    /// Attaches a local track to the connection. Outside the construction
    /// window this triggers a renegotiation via the negotiation-needed
    /// signal.
    pub async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::Closed);
        }
        let rtc_track = track.rtc() as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self.pc.add_track(rtc_track).await?;

        // Keep the sender's RTCP stream drained.
        let drain = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while drain.read(&mut buf).await.is_ok() {}
        });

        let mut inner = self.inner.lock().await;
        inner.senders.insert(track.purpose(), sender);
        inner.local_tracks.insert(track.purpose(), track);
        Ok(())
    }

    /// Detaches the local track with the given purpose, triggering a
    /// renegotiation. Unknown purposes are a no-op.
    pub async fn remove_track(&self, purpose: TrackPurpose) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::Closed);
        }
        let sender = {
            let mut inner = self.inner.lock().await;
            inner.local_tracks.remove(&purpose);
            inner.limits.remove(&purpose);
            inner.senders.remove(&purpose)
        };
        if let Some(sender) = sender {
            self.pc.remove_track(&sender).await?;
        }
        Ok(())
    }

    /// Local track handle for a purpose, if attached.
    pub async fn local_track(&self, purpose: TrackPurpose) -> Option<Arc<LocalTrack>> {
        self.inner.lock().await.local_tracks.get(&purpose).cloned()
    }

    /// Currently attached local track purposes.
    pub async fn local_purposes(&self) -> Vec<TrackPurpose> {
        self.inner.lock().await.local_tracks.keys().copied().collect()
    }

    /// Tracks received from the remote peer so far.
    pub async fn remote_tracks(&self) -> Vec<Arc<RemoteTrack>> {
        self.inner.lock().await.remote_tracks.clone()
    }

    /// Arms the one-shot video expectation: the next incoming video track is
    /// tagged with `source`. A newer toggle overwrites an unconsumed one.
    pub async fn expect_video(&self, source: VideoSource) {
        if self.is_closed() {
            return;
        }
        self.inner.lock().await.pending_video = Some(source);
    }

    /// Forgets remote video of `source` (the peer stopped sending it), along
    /// with an unconsumed expectation for it.
    pub async fn clear_remote_video(&self, source: VideoSource) {
        let purpose = match source {
            VideoSource::Camera => TrackPurpose::Camera,
            VideoSource::Screen => TrackPurpose::ScreenVideo,
        };
        let mut inner = self.inner.lock().await;
        inner.remote_tracks.retain(|t| t.purpose() != purpose);
        if inner.pending_video == Some(source) {
            inner.pending_video = None;
        }
    }

    /// Records encoding caps for a sending purpose. Best-effort: the caps
    /// shape the bounds of subsequent offers/answers; transports without
    /// encoder parameter support simply ignore them.
    pub async fn set_encoding_limits(
        &self,
        purpose: TrackPurpose,
        max_kbps: u32,
        max_framerate: Option<u32>,
    ) {
        self.inner.lock().await.limits.insert(
            purpose,
            EncodingLimits {
                max_kbps,
                max_framerate,
            },
        );
    }

    pub async fn encoding_limits(&self, purpose: TrackPurpose) -> Option<EncodingLimits> {
        self.inner.lock().await.limits.get(&purpose).copied()
    }

    async fn shape_sdp(&self, sdp: &str) -> String {
        let video = {
            let inner = self.inner.lock().await;
            let mut bounds = self.config.video_bounds();
            for (purpose, limits) in &inner.limits {
                if purpose.kind() == TrackKind::Video {
                    bounds.max_kbps = bounds.max_kbps.min(limits.max_kbps);
                }
            }
            bounds
        };
        apply_bitrate_bounds(sdp, &self.config.audio_bounds(), &video)
    }

    async fn handle_remote_track(self: &Arc<Self>, track: Arc<TrackRemote>) {
        let mut inner = self.inner.lock().await;
        let purpose = {
            let inner = &mut *inner;
            classify_remote_track(
                track.kind(),
                &mut inner.remote_audio_seen,
                &mut inner.pending_video,
            )
        };
        debug!(
            target: "Calls/Peer",
            "{}: remote track {} (ssrc {})", self.remote_id, purpose.as_str(), track.ssrc()
        );

        let remote = Arc::new(RemoteTrack::new(self.remote_id.clone(), purpose, track));
        if purpose.kind() == TrackKind::Audio {
            inner.detectors.push(SpeakingDetector::spawn(
                self.remote_id.clone(),
                remote.tap(),
                self.config.speaking_threshold,
                self.speaking.clone(),
            ));
        }
        inner.remote_tracks.push(Arc::clone(&remote));
        drop(inner);

        let _ = self
            .events
            .send(SessionEvent::RemoteTrack {
                peer: self.remote_id.clone(),
                track: remote,
            })
            .await;
    }

    /// Tears the session down. Idempotent: the first call wins, later calls
    /// and in-flight continuations become no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let detectors = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.detectors)
        };
        for detector in &detectors {
            detector.stop();
        }
        if let Err(e) = self.pc.close().await {
            debug!(target: "Calls/Peer", "{}: close: {e}", self.remote_id);
        }
        debug!(target: "Calls/Peer", "{}: session closed", self.remote_id);
    }

    #[cfg(test)]
    pub(crate) async fn queued_candidates(&self) -> usize {
        self.inner.lock().await.candidates.len()
    }

    /// Unconsumed video expectation, if any. Mostly useful in tests.
    pub async fn pending_video(&self) -> Option<VideoSource> {
        self.inner.lock().await.pending_video
    }
}

/// Tags an incoming track with its purpose.
///
/// The first remote audio track is the peer's microphone; any further audio
/// is screen audio (no toggle message exists for audio). Video consumes the
/// one-shot camera-toggle expectation, defaulting to camera when no toggle
/// preceded it.
fn classify_remote_track(
    kind: RTPCodecType,
    remote_audio_seen: &mut bool,
    pending_video: &mut Option<VideoSource>,
) -> TrackPurpose {
    match kind {
        RTPCodecType::Audio => {
            if *remote_audio_seen {
                TrackPurpose::ScreenAudio
            } else {
                *remote_audio_seen = true;
                TrackPurpose::Mic
            }
        }
        _ => match pending_video.take() {
            Some(VideoSource::Screen) => TrackPurpose::ScreenVideo,
            Some(VideoSource::Camera) | None => TrackPurpose::Camera,
        },
    }
}
