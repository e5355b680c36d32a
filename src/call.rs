//! 1:1 call lifecycle controller.
//!
//! A [`CallController`] drives one call over one [`PeerSession`]: the
//! `Idle → Ringing → Connected → Ended` phase machine, caller/callee role
//! logic, the ring timeout, mute/deafen, and camera/screen-share
//! renegotiation. Call records and system messages go through the external
//! collaborators; the UI observes the call through watch snapshots and
//! issues commands as plain method calls.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc, watch};

use crate::engine::EngineContext;
use crate::error::CallError;
use crate::media::{MediaStream, RemoteTrack, ScreenShareOptions};
use crate::peer::{ConnectionState, PeerSession, SessionEvent};
use crate::signaling::{SignalingBody, SignalingChannel, SignalingMessage, SignalingSender};
use crate::speaking::{SpeakingDetector, SpeakingEvent};
use crate::types::{
    CallDirection, CallId, CallSession, CallStatus, ThreadId, TrackPurpose, UserId, VideoSource,
};

/// Phase of a 1:1 call. `Ended` is terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    Ringing {
        since: DateTime<Utc>,
    },
    Connected {
        connected_at: DateTime<Utc>,
    },
    Ended {
        status: CallStatus,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallPhase {
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }
}

/// Phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    OfferSent,
    OfferReceived,
    MediaConnected,
    RingTimeout,
    Declined,
    RemoteLeft,
    LocalHangUp,
    ConnectionFailed,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

impl CallPhase {
    /// Applies a transition, returning the next phase.
    pub fn advance(&self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Idle, CallTransition::OfferSent | CallTransition::OfferReceived) => {
                Self::Ringing { since: Utc::now() }
            }
            (Self::Ringing { .. }, CallTransition::MediaConnected) => Self::Connected {
                connected_at: Utc::now(),
            },
            (Self::Ringing { .. }, CallTransition::RingTimeout) => Self::Ended {
                status: CallStatus::Missed,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (Self::Ringing { .. }, CallTransition::Declined) => Self::Ended {
                status: CallStatus::Declined,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (
                Self::Ringing { .. },
                CallTransition::LocalHangUp
                | CallTransition::RemoteLeft
                | CallTransition::ConnectionFailed,
            ) => Self::Ended {
                status: CallStatus::Ended,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (
                Self::Connected { connected_at },
                CallTransition::LocalHangUp
                | CallTransition::RemoteLeft
                | CallTransition::ConnectionFailed,
            ) => {
                let duration = Utc::now().signed_duration_since(*connected_at).num_seconds();
                Self::Ended {
                    status: CallStatus::Ended,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", attempted),
                });
            }
        };
        Ok(next)
    }
}

/// What the UI renders for one call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub call_duration_secs: Option<i64>,
    pub has_local_stream: bool,
    pub has_remote_stream: bool,
}

struct CallState {
    phase: CallPhase,
    muted: bool,
    deafened: bool,
    mic: Option<MediaStream>,
    camera: Option<MediaStream>,
    screen: Option<MediaStream>,
    remote_tracks: Vec<Arc<RemoteTrack>>,
    peer: Option<Arc<PeerSession>>,
    local_detector: Option<SpeakingDetector>,
    sender: Option<SignalingSender>,
}

pub struct CallController {
    ctx: EngineContext,
    me: UserId,
    remote: UserId,
    session_id: CallId,
    thread_id: ThreadId,
    direction: CallDirection,
    state: Mutex<CallState>,
    snapshot: watch::Sender<CallSnapshot>,
    speaking: watch::Sender<HashMap<UserId, bool>>,
    shutdown: Arc<Notify>,
    ring_cancel: Arc<Notify>,
}

impl CallController {
    fn new(
        ctx: EngineContext,
        me: UserId,
        remote: UserId,
        session_id: CallId,
        thread_id: ThreadId,
        direction: CallDirection,
    ) -> Arc<Self> {
        let initial = CallSnapshot {
            phase: CallPhase::Idle,
            is_muted: false,
            is_deafened: false,
            call_duration_secs: None,
            has_local_stream: false,
            has_remote_stream: false,
        };
        Arc::new(Self {
            ctx,
            me,
            remote,
            session_id,
            thread_id,
            direction,
            state: Mutex::new(CallState {
                phase: CallPhase::Idle,
                muted: false,
                deafened: false,
                mic: None,
                camera: None,
                screen: None,
                remote_tracks: Vec::new(),
                peer: None,
                local_detector: None,
                sender: None,
            }),
            snapshot: watch::channel(initial).0,
            speaking: watch::channel(HashMap::new()).0,
            shutdown: Arc::new(Notify::new()),
            ring_cancel: Arc::new(Notify::new()),
        })
    }

    /// Caller path: creates the session record, subscribes, sends the offer
    /// and rings until answered or timed out.
    pub async fn place_call(
        ctx: EngineContext,
        me: UserId,
        callee: UserId,
        thread_id: ThreadId,
    ) -> Result<Arc<Self>, CallError> {
        let session_id = ctx.store.create_session(&me, &callee, &thread_id).await?;
        let controller = Self::new(
            ctx,
            me,
            callee,
            session_id,
            thread_id,
            CallDirection::Outgoing,
        );
        controller.start().await?;
        Ok(controller)
    }

    /// Callee path: subscribes and auto-answers the caller's offer; reports
    /// `Connected` once the transport does.
    pub async fn answer_call(
        ctx: EngineContext,
        me: UserId,
        session: &CallSession,
    ) -> Result<Arc<Self>, CallError> {
        let controller = Self::new(
            ctx,
            me,
            session.caller_id.clone(),
            session.id.clone(),
            session.thread_id.clone(),
            CallDirection::Incoming,
        );
        controller.start().await?;
        Ok(controller)
    }

    async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        let channel = self
            .ctx
            .bus
            .subscribe(self.session_id.as_str(), &self.me);
        let sender = channel.sender();

        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(32);
        let (speaking_tx, speaking_rx) = mpsc::channel::<SpeakingEvent>(64);

        // A denied microphone leaves the call running without audio.
        let mic = match self.ctx.devices.open_microphone().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(target: "Calls/Controller", "{}: microphone unavailable: {e}", self.session_id);
                None
            }
        };
        let mic_track = mic.as_ref().and_then(|s| s.audio_track().cloned());
        let local_detector = mic_track.as_ref().map(|track| {
            SpeakingDetector::spawn(
                self.me.clone(),
                track.tap(),
                self.ctx.config.speaking_threshold,
                speaking_tx.clone(),
            )
        });

        let peer = PeerSession::new(
            self.me.clone(),
            self.remote.clone(),
            self.ctx.config.clone(),
            sender.clone(),
            events_tx,
            speaking_tx,
            mic_track,
        )
        .await?;
        // If anything below fails the session must not leak.
        let peer_guard = scopeguard::guard(Arc::clone(&peer), |p| {
            tokio::spawn(async move { p.close().await });
        });

        {
            let mut state = self.state.lock().await;
            let transition = match self.direction {
                CallDirection::Outgoing => CallTransition::OfferSent,
                CallDirection::Incoming => CallTransition::OfferReceived,
            };
            state.phase = state.phase.advance(transition)?;
            state.mic = mic;
            state.local_detector = local_detector;
            state.peer = Some(Arc::clone(&peer));
            state.sender = Some(sender);
            self.publish_locked(&state);
        }
        scopeguard::ScopeGuard::into_inner(peer_guard);

        if self.direction == CallDirection::Outgoing {
            self.spawn_ring_timer();

            // Wait for the callee's subscription, then a short best-effort
            // grace; an offer that never arrives surfaces as the ring
            // timeout.
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                controller.await_peer_subscription().await;
                tokio::time::sleep(controller.ctx.config.signal_grace).await;
                if let Err(e) = peer.send_offer().await {
                    warn!(
                        target: "Calls/Controller",
                        "{}: initial offer failed: {e}", controller.session_id
                    );
                }
            });
        }

        let controller = Arc::clone(self);
        tokio::spawn(controller.run_loop(channel, events_rx, speaking_rx));
        Ok(())
    }

    async fn await_peer_subscription(&self) {
        let deadline = tokio::time::Instant::now() + self.ctx.config.ring_timeout;
        while self.ctx.bus.member_count(self.session_id.as_str()) < 2 {
            if tokio::time::Instant::now() >= deadline
                || self.state.lock().await.phase.is_ended()
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    fn spawn_ring_timer(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let cancel = Arc::clone(&self.ring_cancel);
        let timeout = self.ctx.config.ring_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => controller.on_ring_timeout().await,
                _ = cancel.notified() => {}
            }
        });
    }

    async fn run_loop(
        self: Arc<Self>,
        mut channel: SignalingChannel,
        mut events: mpsc::Receiver<SessionEvent>,
        mut speaking: mpsc::Receiver<SpeakingEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                msg = channel.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_session_event(event).await,
                    None => break,
                },
                event = speaking.recv() => match event {
                    Some(event) => self.handle_speaking(event),
                    None => break,
                },
            }
        }
        channel.unsubscribe();
        debug!(target: "Calls/Controller", "{}: loop exited", self.session_id);
    }

    async fn handle_message(&self, msg: SignalingMessage) {
        if msg.sender_id != self.remote {
            debug!(
                target: "Calls/Controller",
                "{}: ignoring {} from {}", self.session_id, msg.body.kind(), msg.sender_id
            );
            return;
        }
        let peer = self.state.lock().await.peer.clone();
        let Some(peer) = peer else { return };

        match msg.body {
            SignalingBody::Offer { sdp } => {
                // Covers both the initial offer (callee) and renegotiations.
                if let Err(e) = peer.accept_offer(sdp).await {
                    warn!(
                        target: "Calls/Controller",
                        "{}: negotiation attempt aborted: {e}", self.session_id
                    );
                }
            }
            SignalingBody::Answer { sdp } => {
                if let Err(e) = peer.accept_answer(sdp).await {
                    warn!(
                        target: "Calls/Controller",
                        "{}: negotiation attempt aborted: {e}", self.session_id
                    );
                }
            }
            SignalingBody::IceCandidate { candidate } => peer.handle_candidate(candidate).await,
            SignalingBody::Leave => self.end_call(CallTransition::RemoteLeft).await,
            SignalingBody::CameraToggle { source, active } => {
                if active {
                    peer.expect_video(source).await;
                } else {
                    peer.clear_remote_video(source).await;
                    let purpose = match source {
                        VideoSource::Camera => TrackPurpose::Camera,
                        VideoSource::Screen => TrackPurpose::ScreenVideo,
                    };
                    let mut state = self.state.lock().await;
                    state.remote_tracks.retain(|t| t.purpose() != purpose);
                    self.publish_locked(&state);
                }
            }
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::State { state, .. } => match state {
                ConnectionState::Connected => self.on_connected().await,
                ConnectionState::Disconnected => {
                    debug!(target: "Calls/Controller", "{}: transient connection loss", self.session_id);
                }
                ConnectionState::Failed | ConnectionState::Closed => {
                    self.end_call(CallTransition::ConnectionFailed).await;
                }
                ConnectionState::New | ConnectionState::Connecting => {}
            },
            SessionEvent::RemoteTrack { track, .. } => {
                let mut state = self.state.lock().await;
                state.remote_tracks.push(track);
                self.publish_locked(&state);
            }
        }
    }

    fn handle_speaking(&self, event: SpeakingEvent) {
        self.speaking.send_modify(|map| {
            map.insert(event.user_id.clone(), event.speaking);
        });
    }

    async fn on_connected(&self) {
        {
            let mut state = self.state.lock().await;
            if !state.phase.is_ringing() {
                return;
            }
            match state.phase.advance(CallTransition::MediaConnected) {
                Ok(phase) => state.phase = phase,
                Err(e) => {
                    debug!(target: "Calls/Controller", "{}: {e}", self.session_id);
                    return;
                }
            }
            self.publish_locked(&state);
        }
        self.ring_cancel.notify_one();
        if let Err(e) = self
            .ctx
            .store
            .update_status(&self.session_id, CallStatus::Connected, Some(Utc::now()))
            .await
        {
            warn!(target: "Calls/Controller", "{}: status update failed: {e}", self.session_id);
        }
    }

    async fn on_ring_timeout(&self) {
        {
            let state = self.state.lock().await;
            if !state.phase.is_ringing() {
                return;
            }
            if let Some(sender) = &state.sender {
                sender.send(SignalingBody::Leave, Some(self.remote.clone()));
            }
        }
        debug!(target: "Calls/Controller", "{}: ring timeout", self.session_id);
        self.end_call(CallTransition::RingTimeout).await;
    }

    /// Ends the call via `transition`. No-op once ended.
    async fn end_call(&self, transition: CallTransition) {
        let (status, duration_secs) = {
            let mut state = self.state.lock().await;
            if state.phase.is_ended() {
                return;
            }
            let next = match state.phase.advance(transition) {
                Ok(next) => next,
                Err(e) => {
                    debug!(target: "Calls/Controller", "{}: {e}", self.session_id);
                    return;
                }
            };
            state.phase = next;
            let CallPhase::Ended {
                status,
                duration_secs,
                ..
            } = &state.phase
            else {
                unreachable!("end transitions always land in Ended");
            };
            let out = (*status, *duration_secs);
            self.publish_locked(&state);
            out
        };

        // The side that initiates the end owns the record update; a remote
        // leave means the peer already wrote it.
        if transition != CallTransition::RemoteLeft
            && let Err(e) = self
                .ctx
                .store
                .update_status(&self.session_id, status, Some(Utc::now()))
                .await
        {
            warn!(target: "Calls/Controller", "{}: status update failed: {e}", self.session_id);
        }

        if let Some(text) = self.end_message(transition, status, duration_secs).await {
            if let Err(e) = self
                .ctx
                .messages
                .post_system_message(&self.thread_id, &self.me, &text)
                .await
            {
                debug!(target: "Calls/Controller", "{}: system message failed: {e}", self.session_id);
            }
        }

        self.teardown().await;
    }

    /// System-message text for an end, if this side is the one to post it.
    async fn end_message(
        &self,
        transition: CallTransition,
        status: CallStatus,
        duration_secs: Option<i64>,
    ) -> Option<String> {
        match (transition, status) {
            (CallTransition::RingTimeout, _) => {
                let name = self
                    .ctx
                    .profiles
                    .get_profile(&self.me)
                    .await
                    .map(|p| p.display_name)
                    .unwrap_or_else(|_| self.me.to_string());
                Some(format!("Missed call from {name}"))
            }
            (CallTransition::Declined, _) => Some("Call declined".to_string()),
            (CallTransition::LocalHangUp, _) => Some(match duration_secs {
                Some(secs) => format!("Call ended · {secs}s"),
                None => "Call ended".to_string(),
            }),
            (CallTransition::ConnectionFailed, CallStatus::Ended)
                if self.direction == CallDirection::Outgoing =>
            {
                Some(match duration_secs {
                    Some(secs) => format!("Call ended · {secs}s"),
                    None => "Call ended".to_string(),
                })
            }
            _ => None,
        }
    }

    async fn teardown(&self) {
        self.ring_cancel.notify_one();
        let peer = {
            let mut state = self.state.lock().await;
            if let Some(detector) = state.local_detector.take() {
                detector.stop();
            }
            state.mic = None;
            state.camera = None;
            state.screen = None;
            state.peer.take()
        };
        if let Some(peer) = peer {
            peer.close().await;
        }
        self.shutdown.notify_one();
    }

    /// Hangs up. Broadcasts an explicit leave first so the peer does not
    /// wait out a connectivity timeout. Safe while ringing or connected; a
    /// no-op once ended.
    pub async fn hang_up(&self) {
        {
            let state = self.state.lock().await;
            if state.phase.is_ended() {
                return;
            }
            if let Some(sender) = &state.sender {
                sender.send(SignalingBody::Leave, Some(self.remote.clone()));
            }
        }
        self.end_call(CallTransition::LocalHangUp).await;
    }

    /// Callee path: rejects a ringing call.
    pub async fn decline(&self) {
        {
            let state = self.state.lock().await;
            if !state.phase.is_ringing() {
                return;
            }
            if let Some(sender) = &state.sender {
                sender.send(SignalingBody::Leave, Some(self.remote.clone()));
            }
        }
        self.end_call(CallTransition::Declined).await;
    }

    /// Local-only microphone flip. Ignored once ended.
    pub async fn toggle_mute(&self) {
        let mut state = self.state.lock().await;
        if state.phase.is_ended() {
            return;
        }
        state.muted = !state.muted;
        Self::apply_mic_enable(&state);
        self.publish_locked(&state);
    }

    /// Deafen flip. Deafening also force-mutes the microphone; the mute flag
    /// itself is restored by un-deafening. Ignored once ended.
    pub async fn toggle_deafen(&self) {
        let mut state = self.state.lock().await;
        if state.phase.is_ended() {
            return;
        }
        state.deafened = !state.deafened;
        Self::apply_mic_enable(&state);
        self.publish_locked(&state);
    }

    fn apply_mic_enable(state: &CallState) {
        let enabled = !(state.muted || state.deafened);
        if let Some(mic) = &state.mic {
            mic.set_enabled(enabled);
        }
    }

    /// Starts the camera and renegotiates it in. A device denial is returned
    /// to the caller; the call keeps running without video.
    pub async fn start_camera(&self) -> Result<(), CallError> {
        let (peer, sender) = {
            let state = self.state.lock().await;
            if state.phase.is_ended() || state.camera.is_some() {
                return Ok(());
            }
            (state.peer.clone(), state.sender.clone())
        };
        let (Some(peer), Some(sender)) = (peer, sender) else {
            return Ok(());
        };

        let stream = self.ctx.devices.open_camera().await?;
        let track = stream
            .video_track()
            .cloned()
            .ok_or_else(|| CallError::Device("camera stream has no video track".into()))?;

        // The toggle must precede the renegotiated track so the remote side
        // can tag it.
        sender.send(
            SignalingBody::CameraToggle {
                source: VideoSource::Camera,
                active: true,
            },
            Some(self.remote.clone()),
        );
        peer.add_track(track).await?;

        let mut state = self.state.lock().await;
        state.camera = Some(stream);
        self.publish_locked(&state);
        Ok(())
    }

    pub async fn stop_camera(&self) {
        let (peer, sender) = {
            let mut state = self.state.lock().await;
            if state.phase.is_ended() || state.camera.take().is_none() {
                return;
            }
            self.publish_locked(&state);
            (state.peer.clone(), state.sender.clone())
        };
        if let Some(peer) = peer
            && let Err(e) = peer.remove_track(TrackPurpose::Camera).await
        {
            warn!(target: "Calls/Controller", "{}: camera removal failed: {e}", self.session_id);
        }
        if let Some(sender) = sender {
            sender.send(
                SignalingBody::CameraToggle {
                    source: VideoSource::Camera,
                    active: false,
                },
                Some(self.remote.clone()),
            );
        }
    }

    /// Starts a screen share and renegotiates its tracks in, capped to the
    /// configured screen encoding limits.
    pub async fn start_screen_share(&self, options: ScreenShareOptions) -> Result<(), CallError> {
        let (peer, sender) = {
            let state = self.state.lock().await;
            if state.phase.is_ended() || state.screen.is_some() {
                return Ok(());
            }
            (state.peer.clone(), state.sender.clone())
        };
        let (Some(peer), Some(sender)) = (peer, sender) else {
            return Ok(());
        };

        let stream = self.ctx.devices.open_screen(&options).await?;
        peer.set_encoding_limits(
            TrackPurpose::ScreenVideo,
            self.ctx.config.screen_max_kbps,
            Some(self.ctx.config.screen_max_framerate),
        )
        .await;

        sender.send(
            SignalingBody::CameraToggle {
                source: VideoSource::Screen,
                active: true,
            },
            Some(self.remote.clone()),
        );
        for track in stream.tracks() {
            peer.add_track(Arc::clone(track)).await?;
        }

        let mut state = self.state.lock().await;
        state.screen = Some(stream);
        self.publish_locked(&state);
        Ok(())
    }

    pub async fn stop_screen_share(&self) {
        let (peer, sender) = {
            let mut state = self.state.lock().await;
            if state.phase.is_ended() || state.screen.take().is_none() {
                return;
            }
            self.publish_locked(&state);
            (state.peer.clone(), state.sender.clone())
        };
        if let Some(peer) = peer {
            for purpose in [TrackPurpose::ScreenVideo, TrackPurpose::ScreenAudio] {
                if let Err(e) = peer.remove_track(purpose).await {
                    warn!(
                        target: "Calls/Controller",
                        "{}: screen track removal failed: {e}", self.session_id
                    );
                }
            }
        }
        if let Some(sender) = sender {
            sender.send(
                SignalingBody::CameraToggle {
                    source: VideoSource::Screen,
                    active: false,
                },
                Some(self.remote.clone()),
            );
        }
    }

    fn publish_locked(&self, state: &CallState) {
        let call_duration_secs = match &state.phase {
            CallPhase::Connected { connected_at } => {
                Some(Utc::now().signed_duration_since(*connected_at).num_seconds())
            }
            CallPhase::Ended { duration_secs, .. } => *duration_secs,
            _ => None,
        };
        let snapshot = CallSnapshot {
            phase: state.phase.clone(),
            is_muted: state.muted,
            is_deafened: state.deafened,
            call_duration_secs,
            has_local_stream: state.mic.is_some() || state.camera.is_some(),
            has_remote_stream: !state.remote_tracks.is_empty(),
        };
        let _ = self.snapshot.send(snapshot);
    }

    pub fn session_id(&self) -> &CallId {
        &self.session_id
    }

    pub fn remote_id(&self) -> &UserId {
        &self.remote
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Watch stream of UI snapshots.
    pub fn snapshot_rx(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    /// Watch stream of per-user speaking state.
    pub fn speaking_rx(&self) -> watch::Receiver<HashMap<UserId, bool>> {
        self.speaking.subscribe()
    }

    pub async fn phase(&self) -> CallPhase {
        self.state.lock().await.phase.clone()
    }

    pub async fn remote_tracks(&self) -> Vec<Arc<RemoteTrack>> {
        self.state.lock().await.remote_tracks.clone()
    }

    /// The local microphone track, when audio is up.
    pub async fn local_audio_track(&self) -> Option<Arc<crate::media::LocalTrack>> {
        let state = self.state.lock().await;
        state.mic.as_ref().and_then(|s| s.audio_track().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flow: Idle → Ringing → Connected → Ended, stamping a duration.
    #[test]
    fn test_outgoing_flow() {
        let phase = CallPhase::Idle;
        let phase = phase.advance(CallTransition::OfferSent).unwrap();
        assert!(phase.is_ringing());

        let phase = phase.advance(CallTransition::MediaConnected).unwrap();
        assert!(phase.is_connected());

        let phase = phase.advance(CallTransition::LocalHangUp).unwrap();
        assert!(phase.is_ended());
        if let CallPhase::Ended {
            status,
            duration_secs,
            ..
        } = phase
        {
            assert_eq!(status, CallStatus::Ended);
            assert!(duration_secs.is_some());
        }
    }

    /// A ringing call that times out resolves as missed, without a duration.
    #[test]
    fn test_ring_timeout_is_missed() {
        let phase = CallPhase::Idle
            .advance(CallTransition::OfferReceived)
            .unwrap()
            .advance(CallTransition::RingTimeout)
            .unwrap();
        if let CallPhase::Ended {
            status,
            duration_secs,
            ..
        } = phase
        {
            assert_eq!(status, CallStatus::Missed);
            assert!(duration_secs.is_none());
        } else {
            panic!("expected Ended");
        }
    }

    #[test]
    fn test_decline_from_ringing() {
        let phase = CallPhase::Idle
            .advance(CallTransition::OfferReceived)
            .unwrap()
            .advance(CallTransition::Declined)
            .unwrap();
        assert!(matches!(
            phase,
            CallPhase::Ended {
                status: CallStatus::Declined,
                ..
            }
        ));
    }

    /// Ended is terminal: every further transition is rejected.
    #[test]
    fn test_ended_rejects_transitions() {
        let phase = CallPhase::Idle
            .advance(CallTransition::OfferSent)
            .unwrap()
            .advance(CallTransition::RingTimeout)
            .unwrap();
        assert!(phase.advance(CallTransition::MediaConnected).is_err());
        assert!(phase.advance(CallTransition::LocalHangUp).is_err());
        assert!(phase.advance(CallTransition::OfferSent).is_err());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(CallPhase::Idle.advance(CallTransition::MediaConnected).is_err());
        assert!(CallPhase::Idle.advance(CallTransition::LocalHangUp).is_err());
        let ringing = CallPhase::Idle.advance(CallTransition::OfferSent).unwrap();
        assert!(ringing.advance(CallTransition::OfferSent).is_err());
    }
}
