//! Error types for the watch-party core

use crate::coordinator::{StreamState, Transition};

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in session, loader, and sync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No audio source could be produced at all, not even a synthetic one
    #[error("No local audio: {0}")]
    NoLocalAudio(String),

    /// Container format could not be identified or is not playable
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The decode pipeline rejected data it cannot recover from
    #[error("Fatal decode error: {0}")]
    DecodeFatal(String),

    /// Peer transport failed and the single automatic restart did not help
    #[error("Transport failed: {0}")]
    TransportFailed(String),

    /// Offer/answer exchange after a track change failed
    #[error("Renegotiation failed: {0}")]
    RenegotiationFailed(String),

    /// A probe or acknowledgment did not arrive in time
    #[error("Sync timeout: {0}")]
    SyncTimeout(String),

    /// Transition requested from a state outside its declared source set
    #[error("Invalid transition {transition:?} from state {from:?}")]
    InvalidTransition {
        /// Transition that was requested
        transition: Transition,
        /// State the coordinator was in
        from: StreamState,
    },

    /// A transition's action list failed part-way
    #[error("Transition {transition:?} failed: {reason}")]
    TransitionFailed {
        /// Transition that was running
        transition: Transition,
        /// Underlying failure
        reason: String,
    },

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling relay error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// No session for this peer
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Operation not allowed for this participant
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::SyncTimeout(_)
                | Error::RenegotiationFailed(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::SessionNotFound(_)
                | Error::TransportFailed(_)
                | Error::RenegotiationFailed(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
        )
    }

    /// Message suitable for showing to a participant
    ///
    /// Streaming failures are phrased as partial degradation and format
    /// errors name the likely cause.
    pub fn user_message(&self) -> String {
        match self {
            Error::UnsupportedFormat(detail) => format!(
                "This file can't be played here ({}). It may use a container or codec the player doesn't support; try re-encoding to MP4 (H.264/AAC) or WebM.",
                detail
            ),
            Error::DecodeFatal(detail) => format!(
                "Playback of this file failed ({}). The video codec may be incompatible with this player.",
                detail
            ),
            Error::TransportFailed(_) | Error::RenegotiationFailed(_) => {
                "Video streaming to some participants failed; audio and sync still work.".to_string()
            }
            Error::NoLocalAudio(_) => {
                "No microphone is available; you can still listen and watch.".to_string()
            }
            Error::SyncTimeout(_) => {
                "Playback sync is slow to respond; positions may drift briefly.".to_string()
            }
            other => other.to_string(),
        }
    }
}
