//! Core identifier and call-domain types shared across the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a user across calls, voice channels and rosters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies one call session record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random call id (32 hex chars, uppercase).
    pub fn generate() -> Self {
        use rand::Rng as _;
        let bytes: [u8; 16] = rand::rng().random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies a voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies the message thread a 1:1 call is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Status of a call session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Connected,
    Ended,
    Declined,
    Missed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ringing | Self::Connected)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ringing => "ringing",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Missed => "missed",
        };
        f.write_str(s)
    }
}

/// Whether a call was placed or received by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What a track carries, beyond its media kind.
///
/// Kind alone cannot distinguish a camera from a screen capture; both are
/// video. The signaling protocol tags video tracks via camera-toggle
/// broadcasts instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackPurpose {
    Mic,
    Camera,
    ScreenVideo,
    ScreenAudio,
}

impl TrackPurpose {
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Mic | Self::ScreenAudio => TrackKind::Audio,
            Self::Camera | Self::ScreenVideo => TrackKind::Video,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mic => "mic",
            Self::Camera => "camera",
            Self::ScreenVideo => "screen-video",
            Self::ScreenAudio => "screen-audio",
        }
    }
}

/// Source of a video track, as announced over signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    Camera,
    Screen,
}

/// Display data for a user, fetched from the profile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// One call session record, owned by the call record store.
///
/// The engine references and mutates these through the store interface only;
/// it never holds the authoritative copy.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub thread_id: ThreadId,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One membership change in a voice-channel roster.
#[derive(Debug, Clone)]
pub struct RosterDelta {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub joined: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_generate_is_unique_hex() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_purpose_kinds() {
        assert_eq!(TrackPurpose::Mic.kind(), TrackKind::Audio);
        assert_eq!(TrackPurpose::ScreenAudio.kind(), TrackKind::Audio);
        assert_eq!(TrackPurpose::Camera.kind(), TrackKind::Video);
        assert_eq!(TrackPurpose::ScreenVideo.kind(), TrackKind::Video);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Connected.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
    }
}
