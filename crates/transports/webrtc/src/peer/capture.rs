//! Local media capture capability
//!
//! The manager never opens devices itself; it asks a [`MediaCapture`]
//! implementation for tracks. A failed microphone request degrades to a
//! synthetic silent track so the session still carries an audio slot.

use super::track::{LocalTrack, TrackKind, TrackOrigin};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Microphone processing and device selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrophoneOptions {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Input device, `None` for the system default
    pub device_id: Option<String>,
}

impl Default for MicrophoneOptions {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_id: None,
        }
    }
}

/// Request to capture the local playback element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Target capture frame rate
    pub frame_rate: u32,
    /// Also capture the element's own decoded audio
    pub include_audio: bool,
}

/// Tracks produced by one element capture
///
/// Captured once and shared by every session the video is attached to.
#[derive(Debug, Clone)]
pub struct CapturedStream {
    /// Video track
    pub video: Arc<LocalTrack>,
    /// The element's own audio, separate from the microphone
    pub audio: Option<Arc<LocalTrack>>,
}

impl CapturedStream {
    /// Stream carrying only video
    pub fn video_only(video: Arc<LocalTrack>) -> Self {
        Self { video, audio: None }
    }
}

/// Local capture backend
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Open the microphone
    ///
    /// # Errors
    ///
    /// `NoLocalAudio` when no input device can be opened.
    async fn microphone(&self, options: &MicrophoneOptions) -> Result<Arc<LocalTrack>>;

    /// Capture the local playback element
    async fn capture_element(&self, request: &CaptureRequest) -> Result<CapturedStream>;
}

/// Capture backend with no devices
///
/// Every microphone request fails, so sessions run on synthetic silence.
/// Element capture produces tracks fed by the local media pump.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessCapture;

#[async_trait]
impl MediaCapture for HeadlessCapture {
    async fn microphone(&self, options: &MicrophoneOptions) -> Result<Arc<LocalTrack>> {
        Err(Error::NoLocalAudio(match &options.device_id {
            Some(device) => format!("input device '{}' is not available", device),
            None => "no input devices".to_string(),
        }))
    }

    async fn capture_element(&self, request: &CaptureRequest) -> Result<CapturedStream> {
        let video = Arc::new(LocalTrack::new(
            TrackKind::Video,
            format!("element-video@{}fps", request.frame_rate),
            TrackOrigin::PlaybackElement,
        ));
        let audio = request.include_audio.then(|| {
            Arc::new(LocalTrack::new(
                TrackKind::Audio,
                "element-audio",
                TrackOrigin::PlaybackElement,
            ))
        });
        Ok(CapturedStream { video, audio })
    }
}

/// Open the microphone, degrading to synthetic silence on failure
///
/// Returns the track and whether it is degraded.
pub async fn microphone_or_silence(
    capture: &dyn MediaCapture,
    options: &MicrophoneOptions,
) -> (Arc<LocalTrack>, bool) {
    match capture.microphone(options).await {
        Ok(track) => (track, false),
        Err(e) => {
            tracing::warn!("Microphone unavailable, using synthetic silence: {}", e);
            (LocalTrack::silent_audio(), true)
        }
    }
}
