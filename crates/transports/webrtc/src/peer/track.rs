//! Local media tracks and per-session track slots
//!
//! A [`TrackSlot`] binds one [`LocalTrack`] to one transport sender under a
//! named role. Slots live as fields of [`TrackSlots`], so a session can hold
//! at most one slot per role and a video change never touches the
//! microphone field.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Role a track plays on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackRole {
    /// Participant's voice
    Microphone,
    /// Captured movie video
    Video,
    /// The movie's own decoded audio, separate from the microphone
    VideoAudio,
}

impl TrackRole {
    /// All roles in attach order
    pub const ALL: [TrackRole; 3] = [TrackRole::Microphone, TrackRole::Video, TrackRole::VideoAudio];

    /// Media kind carried by this role
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackRole::Microphone | TrackRole::VideoAudio => TrackKind::Audio,
            TrackRole::Video => TrackKind::Video,
        }
    }

    /// Whether this role belongs to the video stream
    pub fn is_video_stream(&self) -> bool {
        matches!(self, TrackRole::Video | TrackRole::VideoAudio)
    }
}

impl fmt::Display for TrackRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackRole::Microphone => write!(f, "microphone"),
            TrackRole::Video => write!(f, "video"),
            TrackRole::VideoAudio => write!(f, "video-audio"),
        }
    }
}

/// Media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a local track's media comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOrigin {
    /// Capture device
    Microphone {
        /// Selected input device, `None` for the system default
        device_id: Option<String>,
    },
    /// Generated silence, used when no microphone can be opened
    SyntheticSilence,
    /// Captured from the local playback element
    PlaybackElement,
}

/// A locally produced media track
///
/// One track may be sent on many sessions at once; the enabled flag mutes
/// it everywhere.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    origin: TrackOrigin,
    enabled: AtomicBool,
}

impl LocalTrack {
    /// Create a new enabled track
    pub fn new(kind: TrackKind, label: impl Into<String>, origin: TrackOrigin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            origin,
            enabled: AtomicBool::new(true),
        }
    }

    /// Silent audio track used when no microphone is available
    pub fn silent_audio() -> Arc<Self> {
        Arc::new(Self::new(
            TrackKind::Audio,
            "synthetic-silence",
            TrackOrigin::SyntheticSilence,
        ))
    }

    /// Unique track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Human-readable label (device name, file name)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Track origin
    pub fn origin(&self) -> &TrackOrigin {
        &self.origin
    }

    /// Whether this track is generated silence
    pub fn is_synthetic(&self) -> bool {
        self.origin == TrackOrigin::SyntheticSilence
    }

    /// Whether the track currently carries media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or mute the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Transport-side handle for an attached track
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderId(pub String);

impl SenderId {
    /// Allocate a fresh sender id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A track attached to a session under a role
#[derive(Debug, Clone)]
pub struct TrackSlot {
    /// Role of this slot
    pub role: TrackRole,
    /// Track being sent
    pub track: Arc<LocalTrack>,
    /// Transport sender carrying the track
    pub sender: SenderId,
}

/// The slots of one session, one optional field per role
#[derive(Debug, Clone, Default)]
pub struct TrackSlots {
    microphone: Option<TrackSlot>,
    video: Option<TrackSlot>,
    video_audio: Option<TrackSlot>,
}

impl TrackSlots {
    fn field(&self, role: TrackRole) -> &Option<TrackSlot> {
        match role {
            TrackRole::Microphone => &self.microphone,
            TrackRole::Video => &self.video,
            TrackRole::VideoAudio => &self.video_audio,
        }
    }

    fn field_mut(&mut self, role: TrackRole) -> &mut Option<TrackSlot> {
        match role {
            TrackRole::Microphone => &mut self.microphone,
            TrackRole::Video => &mut self.video,
            TrackRole::VideoAudio => &mut self.video_audio,
        }
    }

    /// Slot for a role
    pub fn get(&self, role: TrackRole) -> Option<&TrackSlot> {
        self.field(role).as_ref()
    }

    /// Whether a role is occupied
    pub fn has(&self, role: TrackRole) -> bool {
        self.field(role).is_some()
    }

    /// Occupy an empty role
    ///
    /// # Errors
    ///
    /// Returns `MediaTrackError` if the role already holds a slot.
    pub fn insert(&mut self, slot: TrackSlot) -> Result<()> {
        let field = self.field_mut(slot.role);
        if field.is_some() {
            return Err(Error::MediaTrackError(format!(
                "{} slot already occupied",
                slot.role
            )));
        }
        *field = Some(slot);
        Ok(())
    }

    /// Vacate a role, returning its slot
    pub fn take(&mut self, role: TrackRole) -> Option<TrackSlot> {
        self.field_mut(role).take()
    }

    /// Swap the track in an occupied slot, keeping its sender
    pub fn replace_track(&mut self, role: TrackRole, track: Arc<LocalTrack>) -> Option<Arc<LocalTrack>> {
        self.field_mut(role)
            .as_mut()
            .map(|slot| std::mem::replace(&mut slot.track, track))
    }

    /// Update the sender of an occupied slot (after a transport restart)
    pub fn set_sender(&mut self, role: TrackRole, sender: SenderId) {
        if let Some(slot) = self.field_mut(role).as_mut() {
            slot.sender = sender;
        }
    }

    /// Roles currently occupied
    pub fn roles(&self) -> Vec<TrackRole> {
        TrackRole::ALL
            .iter()
            .copied()
            .filter(|role| self.has(*role))
            .collect()
    }

    /// Iterate occupied slots in role order
    pub fn iter(&self) -> impl Iterator<Item = &TrackSlot> {
        [&self.microphone, &self.video, &self.video_audio]
            .into_iter()
            .filter_map(|slot| slot.as_ref())
    }

    /// Remove every slot
    pub fn drain(&mut self) -> Vec<TrackSlot> {
        [
            self.microphone.take(),
            self.video.take(),
            self.video_audio.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
