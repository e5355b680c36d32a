//! Real-time call and voice-channel engine for the Palaver client.
//!
//! Everything CRUD about the client (profiles, servers, channels, settings)
//! is thin glue over the managed backend and lives elsewhere; this crate is
//! the part with moving parts: establishing, renegotiating and tearing down
//! peer-to-peer audio/video sessions.
//!
//! # Architecture
//!
//! - [`SignalingChannel`]: typed pub/sub transport scoped to one call or
//!   voice channel
//! - [`CandidateQueue`]: buffers connectivity candidates that beat the
//!   remote description
//! - [`PeerSession`]: one peer connection, its tracks and its negotiation
//!   state
//! - [`CallController`]: the 1:1 call state machine on top of one session
//! - [`VoiceChannelMesh`]: N sessions, one per remote participant
//! - [`SpeakingDetector`]: audio-energy speaking transitions
//!
//! Call records, rosters, profiles and system messages are external
//! collaborators behind the traits in [`store`].

pub mod call;
pub mod candidates;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod speaking;
pub mod store;
pub mod types;

pub use call::{CallController, CallPhase, CallSnapshot, CallTransition, InvalidTransition};
pub use candidates::CandidateQueue;
pub use config::CallConfig;
pub use engine::EngineContext;
pub use error::CallError;
pub use media::{AudioFrame, LocalTrack, MediaDevices, MediaStream, RemoteTrack, ScreenShareOptions};
pub use mesh::VoiceChannelMesh;
pub use peer::{ConnectionState, PeerSession, SessionEvent};
pub use signaling::{SignalingBody, SignalingBus, SignalingChannel, SignalingMessage};
pub use speaking::{SpeakingDetector, SpeakingEvent};
pub use types::{
    CallDirection, CallId, CallSession, CallStatus, ChannelId, Profile, ThreadId, TrackKind,
    TrackPurpose, UserId, VideoSource,
};
