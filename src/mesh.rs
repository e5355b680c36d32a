//! Multi-party voice channel over a peer-to-peer mesh.
//!
//! One [`PeerSession`] per remote participant, no relay. The joiner offers
//! to everyone already in the roster; existing members answer unsolicited
//! offers from joiners whose roster row they have not seen yet. Duplicate
//! offer/answer races resolve first-message-wins: a second inbound offer for
//! a pairing that already has a session is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{Mutex, Notify, mpsc, watch};

use crate::engine::EngineContext;
use crate::error::CallError;
use crate::media::{MediaStream, RemoteTrack};
use crate::peer::{ConnectionState, PeerSession, SessionEvent};
use crate::signaling::{SignalingBody, SignalingChannel, SignalingMessage, SignalingSender};
use crate::speaking::{SpeakingDetector, SpeakingEvent};
use crate::types::{ChannelId, UserId};

struct MeshInner {
    sessions: HashMap<UserId, Arc<PeerSession>>,
    mic: Option<MediaStream>,
    local_detector: Option<SpeakingDetector>,
    sender: Option<SignalingSender>,
    muted: bool,
    deafened: bool,
    joined: bool,
    events_tx: mpsc::Sender<SessionEvent>,
    speaking_tx: mpsc::Sender<SpeakingEvent>,
}

pub struct VoiceChannelMesh {
    ctx: EngineContext,
    me: UserId,
    channel_id: ChannelId,
    inner: Mutex<MeshInner>,
    speaking: watch::Sender<HashMap<UserId, bool>>,
    shutdown: Arc<Notify>,
}

impl VoiceChannelMesh {
    /// Joins `channel_id`: registers the participant row, subscribes to the
    /// channel's signaling scope, and offers to every participant already
    /// present.
    pub async fn join(
        ctx: EngineContext,
        me: UserId,
        channel_id: ChannelId,
    ) -> Result<Arc<Self>, CallError> {
        ctx.roster.join(&channel_id, &me).await?;

        let channel = ctx.bus.subscribe(channel_id.as_str(), &me);
        let sender = channel.sender();

        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(64);
        let (speaking_tx, speaking_rx) = mpsc::channel::<SpeakingEvent>(128);

        // Voice channels run without audio when the microphone is denied.
        let mic = match ctx.devices.open_microphone().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(target: "Calls/Mesh", "{channel_id}: microphone unavailable: {e}");
                None
            }
        };
        let local_detector = mic.as_ref().and_then(|s| s.audio_track()).map(|track| {
            SpeakingDetector::spawn(
                me.clone(),
                track.tap(),
                ctx.config.speaking_threshold,
                speaking_tx.clone(),
            )
        });

        let mesh = Arc::new(Self {
            ctx,
            me,
            channel_id,
            inner: Mutex::new(MeshInner {
                sessions: HashMap::new(),
                mic,
                local_detector,
                sender: Some(sender),
                muted: false,
                deafened: false,
                joined: true,
                events_tx,
                speaking_tx,
            }),
            speaking: watch::channel(HashMap::new()).0,
            shutdown: Arc::new(Notify::new()),
        });

        // Existing participants are already subscribed; a short grace covers
        // their dispatch catching up.
        tokio::time::sleep(mesh.ctx.config.signal_grace).await;

        let roster = mesh.ctx.roster.list_participants(&mesh.channel_id).await?;
        for participant in roster {
            if participant == mesh.me {
                continue;
            }
            // An inbound offer may already have created this session; the
            // first message of either direction wins.
            if let Some(session) = mesh.ensure_session(&participant).await?
                && let Err(e) = session.send_offer().await
            {
                warn!(target: "Calls/Mesh", "{}: offer to {participant} failed: {e}", mesh.channel_id);
            }
        }

        let task = Arc::clone(&mesh);
        tokio::spawn(task.run_loop(channel, events_rx, speaking_rx));
        Ok(mesh)
    }

    /// Creates a session toward `participant` unless one already exists.
    /// Returns the new session, or `None` when the pairing was established
    /// by an earlier message.
    async fn ensure_session(
        &self,
        participant: &UserId,
    ) -> Result<Option<Arc<PeerSession>>, CallError> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(participant) {
            return Ok(None);
        }
        let mic_track = inner.mic.as_ref().and_then(|s| s.audio_track().cloned());
        let sender = inner
            .sender
            .clone()
            .ok_or_else(|| CallError::Signaling("mesh not subscribed".into()))?;
        let session = PeerSession::new(
            self.me.clone(),
            participant.clone(),
            self.ctx.config.clone(),
            sender,
            inner.events_tx.clone(),
            inner.speaking_tx.clone(),
            mic_track,
        )
        .await?;
        inner.sessions.insert(participant.clone(), Arc::clone(&session));
        debug!(target: "Calls/Mesh", "{}: session created for {participant}", self.channel_id);
        Ok(Some(session))
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
        debug!(target: "Calls/Mesh", "{}: loop exited", self.channel_id);
    }

    async fn handle_message(&self, msg: SignalingMessage) {
        let from = msg.sender_id.clone();
        match msg.body {
            SignalingBody::Offer { sdp } => {
                // Unsolicited offers come from joiners whose roster row we
                // have not seen yet; duplicates for an established pairing
                // are ignored.
                if self.session_for(&from).await.is_some() {
                    debug!(
                        target: "Calls/Mesh",
                        "{}: duplicate offer from {from} ignored", self.channel_id
                    );
                    return;
                }
                let session = match self.ensure_session(&from).await {
                    Ok(Some(session)) => session,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(target: "Calls/Mesh", "{}: session for {from} failed: {e}", self.channel_id);
                        return;
                    }
                };
                if let Err(e) = session.accept_offer(sdp).await {
                    warn!(
                        target: "Calls/Mesh",
                        "{}: negotiation with {from} aborted: {e}", self.channel_id
                    );
                }
            }
            SignalingBody::Answer { sdp } => {
                let session = self.session_for(&from).await;
                if let Some(session) = session
                    && let Err(e) = session.accept_answer(sdp).await
                {
                    warn!(
                        target: "Calls/Mesh",
                        "{}: negotiation with {from} aborted: {e}", self.channel_id
                    );
                }
            }
            SignalingBody::IceCandidate { candidate } => {
                if let Some(session) = self.session_for(&from).await {
                    session.handle_candidate(candidate).await;
                }
            }
            SignalingBody::Leave => self.remove_participant(&from).await,
            SignalingBody::CameraToggle { source, active } => {
                if let Some(session) = self.session_for(&from).await {
                    if active {
                        session.expect_video(source).await;
                    } else {
                        session.clear_remote_video(source).await;
                    }
                }
            }
        }
    }

    async fn session_for(&self, participant: &UserId) -> Option<Arc<PeerSession>> {
        self.inner.lock().await.sessions.get(participant).cloned()
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::State { peer, state } => match state {
                ConnectionState::Failed | ConnectionState::Closed => {
                    // Fatal for that one participant only.
                    self.remove_participant(&peer).await;
                }
                ConnectionState::Connected => {
                    debug!(target: "Calls/Mesh", "{}: {peer} connected", self.channel_id);
                }
                _ => {}
            },
            SessionEvent::RemoteTrack { peer, .. } => {
                debug!(target: "Calls/Mesh", "{}: track from {peer}", self.channel_id);
            }
        }
    }

    fn handle_speaking(&self, event: SpeakingEvent) {
        self.speaking.send_modify(|map| {
            map.insert(event.user_id.clone(), event.speaking);
        });
    }

    /// Closes and removes one participant's session and speaking state.
    async fn remove_participant(&self, participant: &UserId) {
        let session = {
            let mut inner = self.inner.lock().await;
            inner.sessions.remove(participant)
        };
        if let Some(session) = session {
            session.close().await;
            debug!(target: "Calls/Mesh", "{}: {participant} removed", self.channel_id);
        }
        self.speaking.send_modify(|map| {
            map.remove(participant);
        });
    }

    /// Leaves the channel: broadcasts a leave, closes every session, clears
    /// mesh state and removes the participant row. Idempotent.
    pub async fn leave(&self) -> Result<(), CallError> {
        let sessions = {
            let mut inner = self.inner.lock().await;
            if !inner.joined {
                return Ok(());
            }
            inner.joined = false;
            if let Some(sender) = &inner.sender {
                sender.send(SignalingBody::Leave, None);
            }
            if let Some(detector) = inner.local_detector.take() {
                detector.stop();
            }
            inner.mic = None;
            inner.sender = None;
            std::mem::take(&mut inner.sessions)
        };
        for session in sessions.values() {
            session.close().await;
        }
        self.speaking.send_replace(HashMap::new());
        self.shutdown.notify_one();

        self.ctx.roster.leave(&self.channel_id, &self.me).await?;
        Ok(())
    }

    /// Local-only microphone flip.
    pub async fn toggle_mute(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.joined {
            return;
        }
        inner.muted = !inner.muted;
        Self::apply_mic_enable(&inner);
    }

    /// Deafen flip; also force-mutes the microphone while deafened.
    pub async fn toggle_deafen(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.joined {
            return;
        }
        inner.deafened = !inner.deafened;
        Self::apply_mic_enable(&inner);
    }

    fn apply_mic_enable(inner: &MeshInner) {
        let enabled = !(inner.muted || inner.deafened);
        if let Some(mic) = &inner.mic {
            mic.set_enabled(enabled);
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Remote participants with an open session.
    pub async fn participants(&self) -> Vec<UserId> {
        self.inner.lock().await.sessions.keys().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_joined(&self) -> bool {
        self.inner.lock().await.joined
    }

    /// Tracks received from one participant.
    pub async fn remote_tracks_of(&self, participant: &UserId) -> Vec<Arc<RemoteTrack>> {
        match self.session_for(participant).await {
            Some(session) => session.remote_tracks().await,
            None => Vec::new(),
        }
    }

    /// Watch stream of per-participant speaking state.
    pub fn speaking_rx(&self) -> watch::Receiver<HashMap<UserId, bool>> {
        self.speaking.subscribe()
    }
}
