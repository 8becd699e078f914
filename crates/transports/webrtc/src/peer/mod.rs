//! Peer session management
//!
//! Handles per-participant transports, track slots, renegotiation, quality
//! adaptation, and restart of failed transports.

pub mod capture;
pub mod lifecycle;
pub mod manager;
pub mod quality;
pub mod rtc;
pub mod session;
pub mod track;
pub mod transport;

pub use capture::{CaptureRequest, CapturedStream, HeadlessCapture, MediaCapture, MicrophoneOptions};
pub use lifecycle::{FailureDecision, RestartPolicy, RestartTracker};
pub use manager::{PeerSessionManager, SessionBackends, SessionEvent};
pub use quality::{ConnectionQuality, QualityLadder, TransportStats, VideoEncoding};
pub use rtc::{RtcPeerTransport, RtcTransportFactory};
pub use session::{PeerSession, SessionSnapshot, SessionState};
pub use track::{LocalTrack, SenderId, TrackKind, TrackOrigin, TrackRole, TrackSlot, TrackSlots};
pub use transport::{
    PeerTransport, TaggedTransportEvent, TransportEvent, TransportEvents, TransportFactory,
    TransportState,
};
