//! Stream state coordination
//!
//! A finite state machine gating which media actions are legal. Each named
//! transition runs its ordered action list against a [`MediaActuator`];
//! transitions on one coordinator are serialized.
//!
//! ```text
//!  idle ──START_VOICE_CHAT──► voice_only ──LOAD_VIDEO──► video_loading
//!                                │  ▲                         │
//!                     VIDEO_READY│  │STOP_STREAMING/          │VIDEO_READY
//!                                ▼  │RESET_TO_VOICE           ▼
//!                            video_ready ◄──PAUSE_STREAMING── streaming
//!                                └────────START_STREAMING──────►
//! ```
//!
//! A rejected transition leaves the state untouched. A transition whose
//! action fails also leaves the state at its source.

pub mod actuator;
pub mod state;

pub use actuator::{MediaActuator, SessionActuator};
pub use state::{Action, StreamState, Transition, TransitionRule};

use crate::events::{EventBus, Subscription};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// State change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: StreamState,
    pub to: StreamState,
    pub transition: Transition,
}

/// Gatekeeper for media pipeline transitions
pub struct StreamCoordinator {
    state: RwLock<StreamState>,
    transition_lock: Mutex<()>,
    actuator: Arc<dyn MediaActuator>,
    events: EventBus<StateChange>,
}

impl StreamCoordinator {
    /// Create a coordinator in the idle state
    pub fn new(actuator: Arc<dyn MediaActuator>) -> Self {
        Self {
            state: RwLock::new(StreamState::Idle),
            transition_lock: Mutex::new(()),
            actuator,
            events: EventBus::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> Subscription<StateChange> {
        self.events.subscribe()
    }

    /// Run a named transition
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` if the current state is not a declared source
    /// - `TransitionFailed` if an action fails; the state stays at the source
    #[instrument(skip(self), fields(transition = %transition))]
    pub async fn transition(&self, transition: Transition) -> Result<StreamState> {
        let _serialized = self.transition_lock.lock().await;
        let from = self.state();
        let rule = transition.rule();

        if !rule.sources.contains(&from) {
            warn!("Rejected {} from {}", transition, from);
            return Err(Error::InvalidTransition { transition, from });
        }

        for action in rule.actions {
            if let Err(e) = self.actuator.perform(*action).await {
                warn!("{} failed during {}: {}", transition, action, e);
                return Err(Error::TransitionFailed {
                    transition,
                    reason: format!("{}: {}", action, e),
                });
            }
        }

        *self.state.write() = rule.target;
        info!("{} -> {} via {}", from, rule.target, transition);
        self.events.emit(StateChange {
            from,
            to: rule.target,
            transition,
        });
        Ok(rule.target)
    }

    pub async fn start_voice_chat(&self) -> Result<StreamState> {
        self.transition(Transition::StartVoiceChat).await
    }

    pub async fn load_video(&self) -> Result<StreamState> {
        self.transition(Transition::LoadVideo).await
    }

    pub async fn video_ready(&self) -> Result<StreamState> {
        self.transition(Transition::VideoReady).await
    }

    pub async fn start_streaming(&self) -> Result<StreamState> {
        self.transition(Transition::StartStreaming).await
    }

    pub async fn stop_streaming(&self) -> Result<StreamState> {
        self.transition(Transition::StopStreaming).await
    }

    pub async fn pause_streaming(&self) -> Result<StreamState> {
        self.transition(Transition::PauseStreaming).await
    }

    pub async fn reset_to_voice(&self) -> Result<StreamState> {
        self.transition(Transition::ResetToVoice).await
    }

    pub async fn teardown(&self) -> Result<StreamState> {
        self.transition(Transition::Teardown).await
    }

    pub fn can_load_video(&self) -> bool {
        Transition::LoadVideo.allowed_from(self.state())
    }

    pub fn can_start_streaming(&self) -> bool {
        Transition::StartStreaming.allowed_from(self.state())
    }

    pub fn can_stop_streaming(&self) -> bool {
        Transition::StopStreaming.allowed_from(self.state())
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == StreamState::Streaming
    }
}
