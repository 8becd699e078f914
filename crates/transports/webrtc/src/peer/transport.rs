//! Peer transport abstraction
//!
//! [`PeerTransport`] is the seam between session bookkeeping and the real
//! media stack. The production backend is [`super::rtc::RtcTransportFactory`];
//! tests plug in scripted fakes.
//!
//! Transports report asynchronous happenings (connection state changes,
//! locally gathered ICE candidates) through a [`TransportEvents`] sink tagged
//! with the peer id and a generation number, so events from a transport that
//! has since been restarted can be told apart and ignored.

use super::quality::{TransportStats, VideoEncoding};
use super::track::{LocalTrack, SenderId, TrackRole};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous transport happening
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection state changed
    StateChanged(TransportState),
    /// Local ICE candidate gathered (JSON-encoded `RTCIceCandidateInit`)
    IceCandidate(String),
}

/// Event tagged with its origin
#[derive(Debug, Clone)]
pub struct TaggedTransportEvent {
    pub peer_id: String,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sink a transport reports its events into
#[derive(Debug, Clone)]
pub struct TransportEvents {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedTransportEvent>,
}

impl TransportEvents {
    /// Create a sink for one transport generation
    pub fn new(
        peer_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    /// Peer this sink belongs to
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Generation of the transport this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; silently dropped once the manager is gone
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(TaggedTransportEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// One real-time transport to one remote participant
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start sending a track; returns the sender carrying it
    async fn add_track(&self, role: TrackRole, track: Arc<LocalTrack>) -> Result<SenderId>;

    /// Stop sending on a sender and release it
    async fn remove_track(&self, sender: &SenderId) -> Result<()>;

    /// Swap the track on an existing sender without renegotiation
    async fn replace_track(&self, sender: &SenderId, track: Arc<LocalTrack>) -> Result<()>;

    /// Apply bitrate/resolution limits to a video sender
    ///
    /// Backends that cannot reconfigure a live sender keep the encoding as a
    /// hint for whatever encodes the track.
    async fn set_encoding(&self, sender: &SenderId, encoding: VideoEncoding) -> Result<()>;

    /// Create a local offer and set it as the local description
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and return the local answer
    async fn create_answer(&self, offer_sdp: &str) -> Result<String>;

    /// Apply the remote answer to our outstanding offer
    async fn set_remote_answer(&self, answer_sdp: &str) -> Result<()>;

    /// Withdraw an unanswered local offer
    ///
    /// A no-op when no offer is pending. Backends that cannot roll back
    /// return an error and the caller answers on a fresh transport instead.
    async fn rollback(&self) -> Result<()>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;

    /// Sample round-trip time and loss
    async fn stats(&self) -> Result<TransportStats>;

    /// Current connection state
    async fn state(&self) -> TransportState;

    /// Close the transport and release its resources
    async fn close(&self) -> Result<()>;
}

/// Builds transports for the session manager
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport for a peer, reporting into `events`
    async fn create(&self, peer_id: &str, events: TransportEvents) -> Result<Arc<dyn PeerTransport>>;
}
