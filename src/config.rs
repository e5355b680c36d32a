//! Engine configuration.

use std::time::Duration;

use crate::sdp::BitrateBounds;

/// Configuration for call controllers and voice-channel meshes.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an outgoing call rings before it auto-resolves as missed.
    pub ring_timeout: Duration,
    /// Best-effort delay between subscribing to a signaling scope and the
    /// first send, giving the remote end time to join the scope. Undelivered
    /// first offers are still only surfaced by the ring timeout.
    pub signal_grace: Duration,
    /// ICE server URLs used for connectivity establishment.
    pub ice_servers: Vec<String>,
    /// Audio bitrate bounds injected into offers/answers, in kbit/s.
    pub audio_min_kbps: u32,
    pub audio_max_kbps: u32,
    /// Video bitrate bounds injected into offers/answers, in kbit/s.
    pub video_min_kbps: u32,
    pub video_max_kbps: u32,
    /// Encoding caps for screen-share video senders.
    pub screen_max_kbps: u32,
    pub screen_max_framerate: u32,
    /// RMS energy threshold for speaking detection. The same threshold gates
    /// both directions of the transition.
    pub speaking_threshold: f32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(180),
            signal_grace: Duration::from_millis(150),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            audio_min_kbps: 32,
            audio_max_kbps: 96,
            video_min_kbps: 300,
            video_max_kbps: 2500,
            screen_max_kbps: 2500,
            screen_max_framerate: 30,
            speaking_threshold: 0.01,
        }
    }
}

impl CallConfig {
    pub fn audio_bounds(&self) -> BitrateBounds {
        BitrateBounds {
            min_kbps: self.audio_min_kbps,
            max_kbps: self.audio_max_kbps,
        }
    }

    pub fn video_bounds(&self) -> BitrateBounds {
        BitrateBounds {
            min_kbps: self.video_min_kbps,
            max_kbps: self.video_max_kbps,
        }
    }
}
