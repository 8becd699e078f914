//! Peer-to-peer watch-party core
//!
//! One participant loads a local movie file and streams it to everyone else
//! over WebRTC while all participants voice-chat, with playback kept in
//! lock-step across clients.
//!
//! # Components
//!
//! - **Peer sessions** ([`peer`]): one transport per remote participant,
//!   role-scoped track slots, serialized renegotiation, quality adaptation
//!   and a single automatic restart of failed transports
//! - **Stream coordinator** ([`coordinator`]): state machine gating which
//!   media actions are legal
//! - **Progressive loader** ([`loader`]): incremental feeding of one local
//!   file into a decode pipeline, with blob playback as fallback
//! - **Playback sync** ([`sync`]): clock calibration against the relay and
//!   latency-compensated play/pause/seek
//! - **Signaling** ([`signaling`]): JSON relay protocol, the room relay
//!   server and its client
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  WatchPartyClient                                        │
//! │  ├─ RelayClient (JSON over WebSocket) ◄──► RelayServer   │
//! │  ├─ StreamCoordinator                                    │
//! │  │   └─ SessionActuator ──► PeerSessionManager           │
//! │  │                          └─ PeerSession per peer      │
//! │  ├─ ProgressiveLoader ──► DecodeTarget / PlaybackElement │
//! │  └─ PlaybackSyncEngine ──► PlaybackElement               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use cinesync_webrtc::CineSyncConfig;
//!
//! let config = CineSyncConfig::from_toml_str(
//!     r#"
//!     [peer]
//!     max_peers = 6
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.peer.max_peers, 6);
//! assert_eq!(config.sync.probes_per_calibration, 5);
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod loader;
pub mod peer;
pub mod signaling;
pub mod sync;

pub use client::{RoomView, WatchPartyBackends, WatchPartyClient};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CineSyncConfig, LoaderConfig, PeerConfig, SyncConfig, TurnServerConfig};
pub use coordinator::{StateChange, StreamCoordinator, StreamState, Transition};
pub use error::{Error, Result};
pub use events::{EventBus, Subscription};
pub use loader::{FileSource, LoadOutcome, MediaSource, MemorySource, ProgressiveLoader};
pub use peer::{PeerSessionManager, SessionEvent, SessionState};
pub use signaling::{
    ClientMessage, MovieAction, MovieState, RelayClient, RelayServer, RelayServerConfig,
    ServerMessage,
};
pub use sync::{PlaybackSyncEngine, SyncEvent, SyncQuality};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
