//! Loopback demo: two engines in one process, wired over the in-memory
//! signaling bus and stores.
//!
//! Alice places a call to Bob, Bob answers off the incoming-call push
//! stream, both push synthetic tone frames for a bit, then Alice hangs up.
//! Run with `RUST_LOG=debug` to watch the signaling exchange.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use palaver_calls::media::SyntheticDevices;
use palaver_calls::store::memory::{MemoryCallStore, MemoryMessages, MemoryProfiles, MemoryRoster};
use palaver_calls::{
    AudioFrame, CallConfig, CallController, EngineContext, SignalingBus, TrackPurpose, UserId,
};

#[derive(Parser, Debug)]
#[command(about = "Loopback call between two in-process engines")]
struct Args {
    /// How long to keep the call up, in seconds.
    #[arg(long, default_value_t = 3)]
    seconds: u64,

    /// Ring timeout in seconds.
    #[arg(long, default_value_t = 180)]
    ring_timeout: u64,
}

fn context(args: &Args) -> (EngineContext, Arc<MemoryCallStore>, Arc<MemoryMessages>) {
    let store = MemoryCallStore::new();
    let messages = MemoryMessages::new();
    let profiles = MemoryProfiles::new();
    profiles.insert("alice".into(), "Alice");
    profiles.insert("bob".into(), "Bob");

    let ctx = EngineContext {
        config: CallConfig {
            ring_timeout: Duration::from_secs(args.ring_timeout),
            ..Default::default()
        },
        bus: SignalingBus::new(),
        store: store.clone(),
        roster: MemoryRoster::new(),
        profiles,
        messages: messages.clone(),
        devices: Arc::new(SyntheticDevices::default()),
    };
    (ctx, store, messages)
}

/// Pushes a quiet sine tone into a controller's microphone track so the
/// speaking detector has something to chew on.
async fn push_tone(controller: &CallController, seconds: u64) {
    let Some(track) = controller.local_audio_track().await else {
        return;
    };
    let frames = seconds * 50; // 20 ms cadence
    for n in 0..frames {
        let pcm: Vec<f32> = (0..960)
            .map(|i| 0.2 * f32::sin(0.05 * (n * 960 + i) as f32))
            .collect();
        track
            .push_audio(AudioFrame::from_pcm(pcm, 48_000, Duration::from_millis(20)))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let (ctx, store, messages) = context(&args);
    let alice: UserId = "alice".into();
    let bob: UserId = "bob".into();

    let mut incoming = ctx.store.subscribe_incoming(&bob).await;

    let caller = CallController::place_call(ctx.clone(), alice, bob.clone(), "thread-1".into())
        .await
        .context("placing call")?;
    info!("alice ringing (session {})", caller.session_id());

    let pushed = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .context("waiting for incoming-call push")?
        .context("store dropped the push stream")?;
    let callee = CallController::answer_call(ctx.clone(), bob, &pushed)
        .await
        .context("answering call")?;
    info!("bob answered (session {})", callee.session_id());

    // Give connectivity establishment a moment; the call stays in ringing
    // until the transport reports connected.
    let mut snapshots = caller.snapshot_rx();
    let connected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if snapshots.borrow().phase.is_connected() {
                return;
            }
            if snapshots.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok();
    info!(
        "transport {}",
        if connected { "connected" } else { "still negotiating" }
    );

    // Feed the microphone taps either way; mute flips and speaking state
    // work without a connected transport.
    let remote_tracks = caller.remote_tracks().await;
    if let Some(track) = remote_tracks.iter().find(|t| t.purpose() == TrackPurpose::Mic) {
        info!("remote mic track present from {}", track.peer());
    }
    let speaking = caller.speaking_rx();
    tokio::select! {
        _ = push_tone(&caller, args.seconds) => {}
        _ = tokio::time::sleep(Duration::from_secs(args.seconds)) => {}
    }
    info!("speaking state: {:?}", *speaking.borrow());

    caller.hang_up().await;
    info!("alice hung up");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let record = store
        .session(caller.session_id())
        .await
        .context("session record missing")?;
    info!("final record status: {}", record.status);
    for message in messages.messages().await {
        info!("system message in {}: {}", message.thread_id, message.text);
    }

    Ok(())
}
