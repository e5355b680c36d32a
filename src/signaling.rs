//! Signaling envelope and the per-scope broadcast bus.
//!
//! Signaling messages are ephemeral control traffic scoped to one call or
//! voice channel: session descriptions, trickled connectivity candidates,
//! leave notices and camera toggles. Delivery is at-least-once with no
//! ordering guarantee across message types; receivers track offer/answer
//! pairing themselves rather than assuming arrival order. Messages are never
//! echoed back to their sender.
//!
//! [`SignalingBus`] is the in-process hub multiplexing every scope this
//! client participates in; one hub sits behind the backend socket the same
//! way a connected client multiplexes its server channel subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::types::{UserId, VideoSource};

/// Per-scope fan-out buffer. Scopes carry a handful of control messages per
/// second at most; overflow means a stalled consumer and is logged.
const SCOPE_BUFFER: usize = 256;

/// Payload of one signaling message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingBody {
    Offer { sdp: RTCSessionDescription },
    Answer { sdp: RTCSessionDescription },
    IceCandidate { candidate: RTCIceCandidateInit },
    Leave,
    CameraToggle { source: VideoSource, active: bool },
}

impl SignalingBody {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Leave => "leave",
            Self::CameraToggle { .. } => "camera-toggle",
        }
    }
}

/// One signaling message. `target_id == None` addresses all subscribers of
/// the scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub sender_id: UserId,
    pub target_id: Option<UserId>,
    #[serde(flatten)]
    pub body: SignalingBody,
}

struct Scope {
    tx: broadcast::Sender<SignalingMessage>,
    /// Subscription refcount per member; a user may hold several handles.
    members: HashMap<UserId, usize>,
}

/// In-process signaling hub: one broadcast scope per call / voice channel.
#[derive(Default)]
pub struct SignalingBus {
    scopes: DashMap<String, Scope>,
}

impl SignalingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Joins `scope_id` as `me` and returns a channel handle.
    ///
    /// Joining a scope the user is already a member of is idempotent at the
    /// membership level; each returned handle still receives its own copy of
    /// subsequent traffic.
    pub fn subscribe(self: &Arc<Self>, scope_id: &str, me: &UserId) -> SignalingChannel {
        let mut entry = self
            .scopes
            .entry(scope_id.to_string())
            .or_insert_with(|| Scope {
                tx: broadcast::channel(SCOPE_BUFFER).0,
                members: HashMap::new(),
            });
        *entry.members.entry(me.clone()).or_insert(0) += 1;
        let tx = entry.tx.clone();
        let rx = tx.subscribe();
        drop(entry);

        debug!(target: "Calls/Signaling", "{me} subscribed to scope {scope_id}");
        SignalingChannel {
            bus: Arc::clone(self),
            scope_id: scope_id.to_string(),
            me: me.clone(),
            tx,
            rx: Some(rx),
        }
    }

    fn leave_scope(&self, scope_id: &str, user: &UserId) {
        if let Some(mut entry) = self.scopes.get_mut(scope_id) {
            if let Some(count) = entry.members.get_mut(user) {
                *count -= 1;
                if *count == 0 {
                    entry.members.remove(user);
                }
            }
            let empty = entry.members.is_empty();
            drop(entry);
            if empty {
                self.scopes.remove_if(scope_id, |_, s| s.members.is_empty());
            }
        }
    }

    /// Current member count of a scope. Mostly useful in tests.
    pub fn member_count(&self, scope_id: &str) -> usize {
        self.scopes
            .get(scope_id)
            .map(|s| s.members.len())
            .unwrap_or(0)
    }
}

/// Fire-and-forget sending half of a scope subscription.
///
/// Cheap to clone; sessions hold one to trickle candidates and offers from
/// transport callbacks.
#[derive(Clone)]
pub struct SignalingSender {
    scope_id: String,
    me: UserId,
    tx: broadcast::Sender<SignalingMessage>,
}

impl SignalingSender {
    /// Sends to the scope. Delivery to absent subscribers is not retried or
    /// reported; an undelivered initial offer surfaces via the ring timeout.
    pub fn send(&self, body: SignalingBody, target_id: Option<UserId>) {
        let msg = SignalingMessage {
            sender_id: self.me.clone(),
            target_id,
            body,
        };
        let _ = self.tx.send(msg);
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }
}

/// One subscription to a signaling scope.
pub struct SignalingChannel {
    bus: Arc<SignalingBus>,
    scope_id: String,
    me: UserId,
    tx: broadcast::Sender<SignalingMessage>,
    rx: Option<broadcast::Receiver<SignalingMessage>>,
}

impl SignalingChannel {
    /// Sending half, for use from transport callbacks.
    pub fn sender(&self) -> SignalingSender {
        SignalingSender {
            scope_id: self.scope_id.clone(),
            me: self.me.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Sends to the scope; see [`SignalingSender::send`].
    pub fn send(&self, body: SignalingBody, target_id: Option<UserId>) {
        self.sender().send(body, target_id);
    }

    /// Receives the next message addressed to this subscriber.
    ///
    /// Skips messages this subscriber sent and messages targeted at someone
    /// else. Returns `None` once unsubscribed or the scope is gone.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if msg.sender_id == self.me {
                        continue;
                    }
                    if let Some(target) = &msg.target_id
                        && *target != self.me
                    {
                        continue;
                    }
                    return Some(msg);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        target: "Calls/Signaling",
                        "scope {} dropped {n} messages for {}", self.scope_id, self.me
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Leaves the scope. Safe to call multiple times.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            self.bus.leave_scope(&self.scope_id, &self.me);
            debug!(target: "Calls/Signaling", "{} unsubscribed from scope {}", self.me, self.scope_id);
        }
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_body() -> SignalingBody {
        // A syntactically valid description is all the bus cares about.
        let sdp = RTCSessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string());
        SignalingBody::Offer { sdp: sdp.unwrap() }
    }

    #[tokio::test]
    async fn test_no_self_loopback() {
        let bus = SignalingBus::new();
        let mut a = bus.subscribe("call-1", &"alice".into());
        let mut b = bus.subscribe("call-1", &"bob".into());

        a.send(SignalingBody::Leave, None);
        let got = b.recv().await.unwrap();
        assert_eq!(got.sender_id, "alice".into());

        // Alice must not see her own message; next recv should time out.
        let none = tokio::time::timeout(std::time::Duration::from_millis(50), a.recv()).await;
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn test_targeted_delivery_skips_others() {
        let bus = SignalingBus::new();
        let mut a = bus.subscribe("call-1", &"alice".into());
        let mut b = bus.subscribe("call-1", &"bob".into());
        let mut c = bus.subscribe("call-1", &"carol".into());

        a.send(offer_body(), Some("bob".into()));
        a.send(SignalingBody::Leave, None);

        let first = b.recv().await.unwrap();
        assert_eq!(first.body.kind(), "offer");

        // Carol only sees the broadcast leave, not the targeted offer.
        let got = c.recv().await.unwrap();
        assert_eq!(got.body.kind(), "leave");
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let bus = SignalingBus::new();
        let a = bus.subscribe("call-1", &"alice".into());
        let mut other = bus.subscribe("call-2", &"bob".into());

        a.send(SignalingBody::Leave, None);
        let none = tokio::time::timeout(std::time::Duration::from_millis(50), other.recv()).await;
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = SignalingBus::new();
        let mut a = bus.subscribe("call-1", &"alice".into());
        let _b = bus.subscribe("call-1", &"bob".into());

        assert_eq!(bus.member_count("call-1"), 2);
        a.unsubscribe();
        a.unsubscribe();
        assert_eq!(bus.member_count("call-1"), 1);
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_scope_removed_when_last_member_leaves() {
        let bus = SignalingBus::new();
        let mut a = bus.subscribe("call-1", &"alice".into());
        a.unsubscribe();
        assert_eq!(bus.member_count("call-1"), 0);
    }

    #[test]
    fn test_envelope_round_trips_as_json() {
        let msg = SignalingMessage {
            sender_id: "alice".into(),
            target_id: None,
            body: SignalingBody::CameraToggle {
                source: VideoSource::Screen,
                active: true,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "camera-toggle");
        let back: SignalingMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.body.kind(), "camera-toggle");
    }
}
