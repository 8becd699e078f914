//! Relay wire protocol
//!
//! JSON messages exchanged between clients and the room relay. Peer
//! signaling payloads (`sdp`, `candidate`) are opaque to the relay: it only
//! reads the routing field `to` and stamps `from` on delivery.

use serde::{Deserialize, Serialize};

/// Playback action issued by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MovieAction {
    /// Host started streaming video to the room
    StartStreaming,
    /// Resume playback
    Play,
    /// Pause playback
    Pause,
    /// Jump to a position
    Seek,
    /// Host stopped streaming video
    StopStreaming,
    /// Periodic position correction
    Sync,
}

/// Host playback snapshot carried with every control action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieState {
    /// Whether the host is playing
    pub is_playing: bool,

    /// Host playback position in seconds
    pub current_time: f64,

    /// Media duration in seconds, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    /// Name of the file being streamed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl MovieState {
    /// Snapshot at a position
    pub fn at(current_time: f64, is_playing: bool) -> Self {
        Self {
            is_playing,
            current_time,
            duration: None,
            file_name: None,
        }
    }
}

/// Messages sent from a client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Enter a room
    Join {
        /// Room identifier
        room: String,
        /// Participant name, unique within the room
        user: String,
    },

    /// SDP offer for one peer or the whole room
    Offer {
        /// Opaque SDP
        sdp: String,
        /// Target participant (broadcast when absent)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    /// SDP answer
    Answer {
        /// Opaque SDP
        sdp: String,
        /// Target participant (broadcast when absent)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// Opaque candidate (JSON-encoded `RTCIceCandidateInit`)
        candidate: String,
        /// Target participant (broadcast when absent)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    /// Host playback control
    #[serde(rename_all = "camelCase")]
    MovieControl {
        /// Action taken
        action: MovieAction,
        /// Host state at the time of the action
        movie_state: MovieState,
    },

    /// Clock probe
    #[serde(rename_all = "camelCase")]
    TimeSyncRequest {
        /// Client local time when the probe was sent (ms)
        client_time: f64,
    },
}

/// Messages sent from the relay to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Join accepted
    Joined {
        /// The joining participant
        user: String,
        /// Current host-of-record
        host: String,
        /// Everyone in the room, including the joiner
        participants: Vec<String>,
    },

    /// Another participant entered the room
    ParticipantJoined {
        /// New participant
        user: String,
    },

    /// A participant left the room
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        /// Departed participant
        user: String,
        /// Set when the departed participant was host
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_host: Option<String>,
    },

    /// Relayed SDP offer
    Offer {
        /// Opaque SDP
        sdp: String,
        /// Sender
        from: String,
    },

    /// Relayed SDP answer
    Answer {
        /// Opaque SDP
        sdp: String,
        /// Sender
        from: String,
    },

    /// Relayed ICE candidate
    IceCandidate {
        /// Opaque candidate
        candidate: String,
        /// Sender
        from: String,
    },

    /// Authoritatively stamped playback control
    #[serde(rename_all = "camelCase")]
    MovieSync {
        /// Action taken by the host
        action: MovieAction,
        /// Host state at the time of the action
        movie_state: MovieState,
        /// Relay wall-clock time in whole milliseconds
        timestamp: u64,
        /// Relay wall-clock time with sub-millisecond precision
        precision_timestamp: f64,
    },

    /// Clock probe reply
    #[serde(rename_all = "camelCase")]
    TimeSyncResponse {
        /// Relay time when the probe was answered (ms)
        server_time: f64,
        /// Echo of the probe's client time
        client_time: f64,
    },

    /// Request rejected
    Error {
        /// Human-readable reason
        message: String,
    },
}

impl ClientMessage {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
