//! Signaling: relay wire protocol, room relay, and client-side channels
//!
//! Peer signaling payloads are opaque everywhere outside the transport:
//! the manager hands SDP and candidates to a [`SignalingChannel`] and the
//! relay forwards them untouched.

pub mod client;
pub mod protocol;
pub mod relay;
pub mod server;

use crate::Result;
use async_trait::async_trait;

pub use client::{RelayClient, RelaySender};
pub use protocol::{ClientMessage, MovieAction, MovieState, ServerMessage};
pub use relay::{Room, RoomRegistry, RoomSnapshot};
pub use server::{RelayServer, RelayServerConfig, RelayServerHandle};

/// Peer-to-peer negotiation payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSignal {
    Offer(String),
    Answer(String),
    /// JSON-encoded `RTCIceCandidateInit`
    IceCandidate(String),
}

impl PeerSignal {
    /// Relay message addressed to one participant
    pub fn into_client_message(self, to: &str) -> ClientMessage {
        let to = Some(to.to_string());
        match self {
            PeerSignal::Offer(sdp) => ClientMessage::Offer { sdp, to },
            PeerSignal::Answer(sdp) => ClientMessage::Answer { sdp, to },
            PeerSignal::IceCandidate(candidate) => ClientMessage::IceCandidate { candidate, to },
        }
    }

    /// Extract sender and payload from a relayed message
    pub fn from_server_message(message: &ServerMessage) -> Option<(String, PeerSignal)> {
        match message {
            ServerMessage::Offer { sdp, from } => Some((from.clone(), PeerSignal::Offer(sdp.clone()))),
            ServerMessage::Answer { sdp, from } => {
                Some((from.clone(), PeerSignal::Answer(sdp.clone())))
            }
            ServerMessage::IceCandidate { candidate, from } => Some((
                from.clone(),
                PeerSignal::IceCandidate(candidate.clone()),
            )),
            _ => None,
        }
    }

    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PeerSignal::Offer(_) => "offer",
            PeerSignal::Answer(_) => "answer",
            PeerSignal::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// Outbound path for negotiation payloads
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver a payload to one participant
    async fn send(&self, to: &str, signal: PeerSignal) -> Result<()>;
}

/// Outbound path for any relay message
pub trait RelayOutbound: Send + Sync {
    /// Queue a message for the relay
    fn send_message(&self, message: ClientMessage) -> Result<()>;
}
