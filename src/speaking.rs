//! Audio-energy speaking detection.
//!
//! The detector rides the media cadence: it samples the RMS energy of each
//! PCM frame as it arrives on a track tap rather than running its own timer.
//! A single threshold gates both directions of the transition, so chatter
//! near the boundary is possible and accepted; the one thing the detector
//! guarantees is that it emits only on crossings, never on steady state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use tokio::sync::{Notify, broadcast, mpsc};

use crate::media::AudioFrame;
use crate::types::UserId;

/// RMS energy of a PCM frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// One speaking transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakingEvent {
    pub user_id: UserId,
    pub speaking: bool,
}

/// Samples one audio tap and reports speaking transitions.
///
/// Must be stopped when its owner goes away; a sampler left running after
/// teardown is a leak. Dropping the detector stops it as well.
pub struct SpeakingDetector {
    user_id: UserId,
    stop: Arc<Notify>,
    stopped: AtomicBool,
}

impl SpeakingDetector {
    pub fn spawn(
        user_id: UserId,
        mut frames: broadcast::Receiver<AudioFrame>,
        threshold: f32,
        events: mpsc::Sender<SpeakingEvent>,
    ) -> Self {
        let stop = Arc::new(Notify::new());
        let stop_task = Arc::clone(&stop);
        let task_user = user_id.clone();
        tokio::spawn(async move {
            let mut speaking = false;
            loop {
                tokio::select! {
                    biased;
                    _ = stop_task.notified() => break,
                    frame = frames.recv() => match frame {
                        Ok(frame) => {
                            let level = rms(&frame.pcm);
                            let now_speaking = level > threshold;
                            if now_speaking != speaking {
                                speaking = now_speaking;
                                let event = SpeakingEvent {
                                    user_id: task_user.clone(),
                                    speaking,
                                };
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(target: "Calls/Speaking", "sampler for {task_user} stopped");
        });
        Self {
            user_id,
            stop,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Cancels the sampling loop. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop.notify_one();
        }
    }
}

impl Drop for SpeakingDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn frame(level: f32) -> AudioFrame {
        AudioFrame::from_pcm(vec![level; 960], 48_000, Duration::from_millis(20))
    }

    async fn next_event(rx: &mut mpsc::Receiver<SpeakingEvent>) -> Option<SpeakingEvent> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_emits_only_on_crossings() {
        let (tap, rx) = broadcast::channel(32);
        let (events_tx, mut events) = mpsc::channel(8);
        let detector = SpeakingDetector::spawn("alice".into(), rx, 0.01, events_tx);

        for _ in 0..5 {
            tap.send(frame(0.5)).unwrap();
        }
        let up = next_event(&mut events).await.unwrap();
        assert!(up.speaking);

        for _ in 0..5 {
            tap.send(frame(0.0)).unwrap();
        }
        let down = next_event(&mut events).await.unwrap();
        assert!(!down.speaking);

        // Five frames above then five below produced exactly two events.
        assert!(next_event(&mut events).await.is_none());
        detector.stop();
    }

    #[tokio::test]
    async fn test_silence_emits_nothing() {
        let (tap, rx) = broadcast::channel(32);
        let (events_tx, mut events) = mpsc::channel(8);
        let _detector = SpeakingDetector::spawn("alice".into(), rx, 0.01, events_tx);

        for _ in 0..10 {
            tap.send(frame(0.0)).unwrap();
        }
        assert!(next_event(&mut events).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_cancels_sampling() {
        let (tap, rx) = broadcast::channel(32);
        let (events_tx, mut events) = mpsc::channel(8);
        let detector = SpeakingDetector::spawn("alice".into(), rx, 0.01, events_tx);

        detector.stop();
        detector.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tap.send(frame(0.5)).unwrap();
        assert!(next_event(&mut events).await.is_none());
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 4]), 0.0);
        let level = rms(&[0.5; 4]);
        assert!((level - 0.5).abs() < f32::EPSILON);
    }
}
