//! End-to-end flows over the in-memory bus and stores: ring timeout,
//! hang-up and decline choreography, and the voice-channel mesh.

use std::sync::Arc;
use std::time::Duration;

use palaver_calls::media::SyntheticDevices;
use palaver_calls::store::memory::{MemoryCallStore, MemoryMessages, MemoryProfiles, MemoryRoster};
use palaver_calls::store::{CallRecordStore, ParticipantRoster};
use palaver_calls::{
    CallConfig, CallController, CallPhase, CallStatus, EngineContext, SignalingBody, SignalingBus,
    UserId, VoiceChannelMesh,
};
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

struct World {
    ctx: EngineContext,
    store: Arc<MemoryCallStore>,
    messages: Arc<MemoryMessages>,
}

fn world(ring_timeout: Duration) -> World {
    let store = MemoryCallStore::new();
    let messages = MemoryMessages::new();
    let profiles = MemoryProfiles::new();
    profiles.insert("alice".into(), "Alice");
    profiles.insert("bob".into(), "Bob");
    profiles.insert("carol".into(), "Carol");

    let ctx = EngineContext {
        config: CallConfig {
            ring_timeout,
            signal_grace: Duration::from_millis(20),
            ..Default::default()
        },
        bus: SignalingBus::new(),
        store: store.clone(),
        roster: MemoryRoster::new(),
        profiles,
        messages: messages.clone(),
        devices: Arc::new(SyntheticDevices::default()),
    };
    World {
        ctx,
        store,
        messages,
    }
}

async fn wait_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// A syntactically complete offer from a throwaway peer connection.
async fn scratch_offer() -> RTCSessionDescription {
    let api = APIBuilder::new().build();
    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();
    pc.create_data_channel("probe", None).await.unwrap();
    pc.create_offer(None).await.unwrap()
}

/// A caller whose callee never shows up rings out into a missed call: the
/// record flips to missed, a system message lands in the thread, and the UI
/// sees the call end.
#[tokio::test]
async fn test_unanswered_call_resolves_missed() {
    let world = world(Duration::from_millis(400));
    let caller = CallController::place_call(
        world.ctx.clone(),
        "alice".into(),
        "bob".into(),
        "thread-1".into(),
    )
    .await
    .unwrap();

    let ended = wait_until(Duration::from_secs(3), || async {
        caller.phase().await.is_ended()
    })
    .await;
    assert!(ended, "ring timeout never fired");

    let record = world.store.session(caller.session_id()).await.unwrap();
    assert_eq!(record.status, CallStatus::Missed);
    assert!(record.ended_at.is_some());

    let phase = caller.phase().await;
    assert!(matches!(
        phase,
        CallPhase::Ended {
            status: CallStatus::Missed,
            ..
        }
    ));
    let snapshot = caller.snapshot_rx().borrow().clone();
    assert!(snapshot.phase.is_ended());

    let texts: Vec<_> = world
        .messages
        .messages()
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["Missed call from Alice".to_string()]);
}

/// Hanging up twice is as good as once, and an ended controller ignores
/// mute/deafen flips without side effects.
#[tokio::test]
async fn test_ended_call_ignores_commands() {
    let world = world(Duration::from_secs(10));
    let caller = CallController::place_call(
        world.ctx.clone(),
        "alice".into(),
        "bob".into(),
        "thread-1".into(),
    )
    .await
    .unwrap();

    caller.hang_up().await;
    assert!(caller.phase().await.is_ended());
    let record = world.store.session(caller.session_id()).await.unwrap();
    assert_eq!(record.status, CallStatus::Ended);

    caller.hang_up().await;
    caller.toggle_mute().await;
    caller.toggle_deafen().await;

    let snapshot = caller.snapshot_rx().borrow().clone();
    assert!(!snapshot.is_muted);
    assert!(!snapshot.is_deafened);

    // Exactly one "Call ended" message despite the second hang-up.
    let texts: Vec<_> = world
        .messages
        .messages()
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("Call ended"));
}

/// The callee answers off the incoming-call push stream; when the remote
/// side hangs up, the caller ends via the leave broadcast rather than a
/// connectivity timeout.
#[tokio::test]
async fn test_answer_then_remote_hangup() {
    let world = world(Duration::from_secs(10));
    let bob: UserId = "bob".into();
    let mut incoming = world.ctx.store.subscribe_incoming(&bob).await;

    let caller = CallController::place_call(
        world.ctx.clone(),
        "alice".into(),
        bob.clone(),
        "thread-1".into(),
    )
    .await
    .unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
        .await
        .expect("no incoming-call push")
        .expect("push stream closed");
    assert_eq!(pushed.id, *caller.session_id());
    assert_eq!(pushed.status, CallStatus::Ringing);

    let callee = CallController::answer_call(world.ctx.clone(), bob, &pushed)
        .await
        .unwrap();
    assert!(callee.phase().await.is_ringing());

    // Let the offer/answer exchange happen, then hang up from the callee.
    tokio::time::sleep(Duration::from_millis(300)).await;
    callee.hang_up().await;

    let ended = wait_until(Duration::from_secs(3), || async {
        caller.phase().await.is_ended()
    })
    .await;
    assert!(ended, "caller never saw the leave");

    let record = world.store.session(caller.session_id()).await.unwrap();
    assert_eq!(record.status, CallStatus::Ended);

    let texts: Vec<_> = world
        .messages
        .messages()
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts.len(), 1, "only the hanging-up side posts: {texts:?}");
    assert!(texts[0].starts_with("Call ended"));
}

/// Declining a ringing call resolves the record as declined on the callee
/// side; the caller just sees the leave.
#[tokio::test]
async fn test_decline_resolves_declined() {
    let world = world(Duration::from_secs(10));
    let bob: UserId = "bob".into();
    let mut incoming = world.ctx.store.subscribe_incoming(&bob).await;

    let caller = CallController::place_call(
        world.ctx.clone(),
        "alice".into(),
        bob.clone(),
        "thread-1".into(),
    )
    .await
    .unwrap();

    let pushed = incoming.recv().await.unwrap();
    let callee = CallController::answer_call(world.ctx.clone(), bob, &pushed)
        .await
        .unwrap();
    callee.decline().await;

    assert!(matches!(
        callee.phase().await,
        CallPhase::Ended {
            status: CallStatus::Declined,
            ..
        }
    ));

    let ended = wait_until(Duration::from_secs(3), || async {
        caller.phase().await.is_ended()
    })
    .await;
    assert!(ended);

    let record = world.store.session(caller.session_id()).await.unwrap();
    assert_eq!(record.status, CallStatus::Declined);

    let texts: Vec<_> = world
        .messages
        .messages()
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["Call declined".to_string()]);
}

/// A denied microphone leaves the call running without audio, and a denied
/// camera is an error to the caller but not to the call.
#[tokio::test]
async fn test_device_denial_disables_feature_only() {
    let mut world = world(Duration::from_secs(10));
    world.ctx.devices = Arc::new(SyntheticDevices {
        allow_microphone: false,
        allow_camera: false,
        ..Default::default()
    });

    let caller = CallController::place_call(
        world.ctx.clone(),
        "alice".into(),
        "bob".into(),
        "thread-1".into(),
    )
    .await
    .unwrap();

    let snapshot = caller.snapshot_rx().borrow().clone();
    assert!(!snapshot.has_local_stream);
    assert!(!snapshot.phase.is_ended());

    assert!(caller.start_camera().await.is_err());
    assert!(!caller.phase().await.is_ended());

    caller.hang_up().await;
}

/// Three participants mesh pairwise: the third joiner ends up with two
/// sessions and everyone else gains exactly one, duplicate offers are
/// ignored, and a leave tears down exactly the departed participant's
/// sessions everywhere.
#[tokio::test]
async fn test_mesh_join_and_leave_choreography() {
    let world = world(Duration::from_secs(10));
    let channel = "voice-1";

    let alice = VoiceChannelMesh::join(world.ctx.clone(), "alice".into(), channel.into())
        .await
        .unwrap();
    let bob = VoiceChannelMesh::join(world.ctx.clone(), "bob".into(), channel.into())
        .await
        .unwrap();
    let carol = VoiceChannelMesh::join(world.ctx.clone(), "carol".into(), channel.into())
        .await
        .unwrap();

    let meshed = wait_until(Duration::from_secs(5), || async {
        alice.session_count().await == 2
            && bob.session_count().await == 2
            && carol.session_count().await == 2
    })
    .await;
    assert!(meshed, "pairwise sessions never settled");

    let mut peers = alice.participants().await;
    peers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(peers, vec![UserId::from("bob"), UserId::from("carol")]);

    // A second offer for an established pairing is a no-op.
    let dup = scratch_offer().await;
    let rogue = world.ctx.bus.subscribe(channel, &"carol".into());
    rogue.send(SignalingBody::Offer { sdp: dup }, Some("alice".into()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.session_count().await, 2);

    // First participant leaves; the two remaining peers each close exactly
    // one session.
    alice.leave().await.unwrap();
    assert!(!alice.is_joined().await);
    assert_eq!(alice.session_count().await, 0);

    let settled = wait_until(Duration::from_secs(3), || async {
        bob.session_count().await == 1 && carol.session_count().await == 1
    })
    .await;
    assert!(settled, "leave did not propagate");
    assert_eq!(bob.participants().await, vec![UserId::from("carol")]);
    assert_eq!(carol.participants().await, vec![UserId::from("bob")]);

    let roster = world
        .ctx
        .roster
        .list_participants(&channel.into())
        .await
        .unwrap();
    assert_eq!(roster.len(), 2);

    // Leaving again is a no-op.
    alice.leave().await.unwrap();
}

/// Speaking state aggregates per user and clears when a participant leaves.
#[tokio::test]
async fn test_mesh_speaking_aggregation() {
    let world = world(Duration::from_secs(10));
    let channel = "voice-2";

    let alice = VoiceChannelMesh::join(world.ctx.clone(), "alice".into(), channel.into())
        .await
        .unwrap();
    let bob = VoiceChannelMesh::join(world.ctx.clone(), "bob".into(), channel.into())
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || async {
        alice.session_count().await == 1 && bob.session_count().await == 1
    })
    .await;

    // No one has produced audio yet.
    assert!(alice.speaking_rx().borrow().is_empty());

    bob.leave().await.unwrap();
    let cleared = wait_until(Duration::from_secs(3), || async {
        alice.session_count().await == 0
    })
    .await;
    assert!(cleared);
    assert!(alice.speaking_rx().borrow().get(&"bob".into()).is_none());
}
