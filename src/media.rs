//! Media device seam and track plumbing.
//!
//! Device capture (microphone, camera, screen) is platform territory and sits
//! behind the [`MediaDevices`] trait; the engine only owns the tracks built
//! on top of it. Local tracks wrap a sample-writing transport track plus a
//! PCM tap for energy sampling; remote tracks wrap the receiving side and
//! expose the same tap, fed by the platform playback path once it has
//! decoded audio in hand.
//!
//! A device stream has exactly one owner. Tracks are attached to peer
//! connections, never copied, so stopping the originating stream stops every
//! attached sender.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio::sync::broadcast;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;
use crate::types::{TrackKind, TrackPurpose, UserId};

/// Frame-tap fan-out buffer. Taps carry 20 ms frames; a lagging sampler may
/// skip frames without consequence.
const FRAME_TAP_BUFFER: usize = 32;

/// One audio frame: the encoded payload bound for the transport plus the PCM
/// samples it was encoded from (used for energy sampling).
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub payload: Bytes,
    pub pcm: Arc<Vec<f32>>,
    pub sample_rate: u32,
    pub duration: Duration,
}

impl AudioFrame {
    /// Frame with PCM only, for paths that never hit the transport (decoded
    /// remote audio, synthetic test input).
    pub fn from_pcm(pcm: Vec<f32>, sample_rate: u32, duration: Duration) -> Self {
        Self {
            payload: Bytes::new(),
            pcm: Arc::new(pcm),
            sample_rate,
            duration,
        }
    }
}

fn codec_for(purpose: TrackPurpose) -> RTCRtpCodecCapability {
    match purpose.kind() {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

/// A locally captured track: the transport-facing sample track, an enable
/// flip for mute, and a PCM tap for the speaking detector.
pub struct LocalTrack {
    purpose: TrackPurpose,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    tap: broadcast::Sender<AudioFrame>,
}

impl LocalTrack {
    pub fn new(purpose: TrackPurpose) -> Self {
        let stream_id = match purpose {
            TrackPurpose::Mic => "mic",
            TrackPurpose::Camera => "camera",
            TrackPurpose::ScreenVideo | TrackPurpose::ScreenAudio => "screen",
        };
        Self {
            purpose,
            rtc: Arc::new(TrackLocalStaticSample::new(
                codec_for(purpose),
                purpose.as_str().to_owned(),
                stream_id.to_owned(),
            )),
            enabled: AtomicBool::new(true),
            tap: broadcast::channel(FRAME_TAP_BUFFER).0,
        }
    }

    pub fn purpose(&self) -> TrackPurpose {
        self.purpose
    }

    pub fn kind(&self) -> TrackKind {
        self.purpose.kind()
    }

    pub(crate) fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Enable flip. A disabled track drops frames instead of sending them;
    /// this is what mute toggles.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Subscribes to this track's PCM frames.
    pub fn tap(&self) -> broadcast::Receiver<AudioFrame> {
        self.tap.subscribe()
    }

    /// Writes one audio frame to the transport and the tap. Dropped when the
    /// track is disabled. Transport write failures (e.g. not attached yet)
    /// are swallowed; capture must not depend on attachment.
    pub async fn push_audio(&self, frame: AudioFrame) {
        if !self.is_enabled() {
            return;
        }
        if !frame.payload.is_empty() {
            let sample = Sample {
                data: frame.payload.clone(),
                duration: frame.duration,
                ..Default::default()
            };
            if let Err(e) = self.rtc.write_sample(&sample).await {
                debug!(target: "Calls/Media", "{}: write_sample: {e}", self.purpose.as_str());
            }
        }
        let _ = self.tap.send(frame);
    }

    /// Writes one encoded video frame to the transport.
    pub async fn push_video(&self, payload: Bytes, duration: Duration) {
        if !self.is_enabled() {
            return;
        }
        let sample = Sample {
            data: payload,
            duration,
            ..Default::default()
        };
        if let Err(e) = self.rtc.write_sample(&sample).await {
            debug!(target: "Calls/Media", "{}: write_sample: {e}", self.purpose.as_str());
        }
    }
}

/// A track received from a remote peer, tagged with the purpose negotiated
/// over signaling.
pub struct RemoteTrack {
    peer: UserId,
    purpose: TrackPurpose,
    rtp: Arc<TrackRemote>,
    tap: broadcast::Sender<AudioFrame>,
}

impl RemoteTrack {
    pub(crate) fn new(peer: UserId, purpose: TrackPurpose, rtp: Arc<TrackRemote>) -> Self {
        Self {
            peer,
            purpose,
            rtp,
            tap: broadcast::channel(FRAME_TAP_BUFFER).0,
        }
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn purpose(&self) -> TrackPurpose {
        self.purpose
    }

    /// The receiving transport track; the playback path reads RTP from it.
    pub fn rtp(&self) -> Arc<TrackRemote> {
        Arc::clone(&self.rtp)
    }

    /// Feeds decoded PCM back into the engine. The playback path owns the
    /// decoder; the speaking detector listens on the tap.
    pub fn push_decoded(&self, frame: AudioFrame) {
        let _ = self.tap.send(frame);
    }

    pub fn tap(&self) -> broadcast::Receiver<AudioFrame> {
        self.tap.subscribe()
    }
}

/// One device capture stream and its tracks. Exactly one component owns a
/// stream at a time.
pub struct MediaStream {
    tracks: Vec<Arc<LocalTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }
}

/// Options for starting a screen share.
#[derive(Debug, Clone, Default)]
pub struct ScreenShareOptions {
    /// Capture system audio alongside the video.
    pub with_audio: bool,
}

/// Platform seam for acquiring capture devices.
///
/// A denied or missing device is an error here and a disabled feature above:
/// the affected call keeps running without that track.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<MediaStream, CallError>;
    async fn open_camera(&self) -> Result<MediaStream, CallError>;
    async fn open_screen(&self, options: &ScreenShareOptions) -> Result<MediaStream, CallError>;
}

/// Device layer for tests and the loopback demo: tracks exist but produce
/// frames only when pushed by the caller. Denials are simulated per device.
pub struct SyntheticDevices {
    pub allow_microphone: bool,
    pub allow_camera: bool,
    pub allow_screen: bool,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            allow_microphone: true,
            allow_camera: true,
            allow_screen: true,
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_microphone(&self) -> Result<MediaStream, CallError> {
        if !self.allow_microphone {
            return Err(CallError::Device("microphone access denied".into()));
        }
        Ok(MediaStream::new(vec![Arc::new(LocalTrack::new(
            TrackPurpose::Mic,
        ))]))
    }

    async fn open_camera(&self) -> Result<MediaStream, CallError> {
        if !self.allow_camera {
            return Err(CallError::Device("camera access denied".into()));
        }
        Ok(MediaStream::new(vec![Arc::new(LocalTrack::new(
            TrackPurpose::Camera,
        ))]))
    }

    async fn open_screen(&self, options: &ScreenShareOptions) -> Result<MediaStream, CallError> {
        if !self.allow_screen {
            return Err(CallError::Device("screen capture denied".into()));
        }
        let mut tracks = vec![Arc::new(LocalTrack::new(TrackPurpose::ScreenVideo))];
        if options.with_audio {
            tracks.push(Arc::new(LocalTrack::new(TrackPurpose::ScreenAudio)));
        }
        Ok(MediaStream::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_track_drops_frames() {
        let track = LocalTrack::new(TrackPurpose::Mic);
        let mut tap = track.tap();

        track.set_enabled(false);
        track
            .push_audio(AudioFrame::from_pcm(
                vec![0.5; 960],
                48_000,
                Duration::from_millis(20),
            ))
            .await;
        assert!(tap.try_recv().is_err());

        track.set_enabled(true);
        track
            .push_audio(AudioFrame::from_pcm(
                vec![0.5; 960],
                48_000,
                Duration::from_millis(20),
            ))
            .await;
        assert!(tap.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_denied_devices_error() {
        let devices = SyntheticDevices {
            allow_camera: false,
            ..Default::default()
        };
        assert!(devices.open_microphone().await.is_ok());
        assert!(matches!(
            devices.open_camera().await,
            Err(CallError::Device(_))
        ));
    }

    #[tokio::test]
    async fn test_screen_stream_shape() {
        let devices = SyntheticDevices::default();
        let stream = devices
            .open_screen(&ScreenShareOptions { with_audio: true })
            .await
            .unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(
            stream.video_track().unwrap().purpose(),
            TrackPurpose::ScreenVideo
        );
        assert_eq!(
            stream.audio_track().unwrap().purpose(),
            TrackPurpose::ScreenAudio
        );
    }
}
