//! Stream states, named transitions, and their action lists

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media pipeline state of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    VoiceOnly,
    VideoLoading,
    VideoReady,
    Streaming,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::VoiceOnly => "voice_only",
            StreamState::VideoLoading => "video_loading",
            StreamState::VideoReady => "video_ready",
            StreamState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Side effect run as part of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    InitializeMicrophone,
    ConnectPeers,
    StartVideoStreaming,
    StopVideoStreaming,
    /// Re-confirm the microphone slot is present and enabled
    PreserveMicrophone,
    DisconnectPeers,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::InitializeMicrophone => "initializeMicrophone",
            Action::ConnectPeers => "connectPeers",
            Action::StartVideoStreaming => "startVideoStreaming",
            Action::StopVideoStreaming => "stopVideoStreaming",
            Action::PreserveMicrophone => "preserveMicrophone",
            Action::DisconnectPeers => "disconnectPeers",
        };
        f.write_str(name)
    }
}

/// Named state machine edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    StartVoiceChat,
    LoadVideo,
    VideoReady,
    StartStreaming,
    StopStreaming,
    PauseStreaming,
    ResetToVoice,
    Teardown,
}

/// Declared sources, target, and ordered actions of a transition
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub sources: &'static [StreamState],
    pub target: StreamState,
    pub actions: &'static [Action],
}

use Action::*;
use StreamState::*;

impl Transition {
    /// Every transition, in table order
    pub const ALL: [Transition; 8] = [
        Transition::StartVoiceChat,
        Transition::LoadVideo,
        Transition::VideoReady,
        Transition::StartStreaming,
        Transition::StopStreaming,
        Transition::PauseStreaming,
        Transition::ResetToVoice,
        Transition::Teardown,
    ];

    /// The transition table
    pub const fn rule(self) -> TransitionRule {
        match self {
            Transition::StartVoiceChat => TransitionRule {
                sources: &[Idle],
                target: VoiceOnly,
                actions: &[InitializeMicrophone, ConnectPeers],
            },
            Transition::LoadVideo => TransitionRule {
                sources: &[VoiceOnly],
                target: VideoLoading,
                actions: &[],
            },
            Transition::VideoReady => TransitionRule {
                sources: &[VoiceOnly, VideoLoading],
                target: VideoReady,
                actions: &[],
            },
            Transition::StartStreaming => TransitionRule {
                sources: &[VideoReady],
                target: Streaming,
                actions: &[StartVideoStreaming, PreserveMicrophone],
            },
            Transition::StopStreaming => TransitionRule {
                sources: &[Streaming],
                target: VoiceOnly,
                actions: &[StopVideoStreaming, PreserveMicrophone],
            },
            Transition::PauseStreaming => TransitionRule {
                sources: &[Streaming],
                target: VideoReady,
                actions: &[StopVideoStreaming, PreserveMicrophone],
            },
            Transition::ResetToVoice => TransitionRule {
                sources: &[VideoReady, Streaming, VideoLoading],
                target: VoiceOnly,
                actions: &[StopVideoStreaming, PreserveMicrophone],
            },
            Transition::Teardown => TransitionRule {
                sources: &[VoiceOnly, VideoLoading, VideoReady, Streaming],
                target: Idle,
                actions: &[DisconnectPeers],
            },
        }
    }

    /// Whether this transition may fire from `state`
    pub fn allowed_from(self, state: StreamState) -> bool {
        self.rule().sources.contains(&state)
    }

    /// Table name, e.g. `START_STREAMING`
    pub fn name(self) -> &'static str {
        match self {
            Transition::StartVoiceChat => "START_VOICE_CHAT",
            Transition::LoadVideo => "LOAD_VIDEO",
            Transition::VideoReady => "VIDEO_READY",
            Transition::StartStreaming => "START_STREAMING",
            Transition::StopStreaming => "STOP_STREAMING",
            Transition::PauseStreaming => "PAUSE_STREAMING",
            Transition::ResetToVoice => "RESET_TO_VOICE",
            Transition::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
