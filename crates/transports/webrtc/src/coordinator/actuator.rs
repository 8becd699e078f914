//! Transition side effects
//!
//! [`MediaActuator`] is what the coordinator drives. [`SessionActuator`]
//! performs the actions against a [`PeerSessionManager`], capturing the
//! playback element once and sharing the stream across sessions.

use super::state::Action;
use crate::peer::{CaptureRequest, CapturedStream, MediaCapture, PeerSessionManager};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Performs transition actions
#[async_trait]
pub trait MediaActuator: Send + Sync {
    async fn perform(&self, action: Action) -> Result<()>;
}

/// Actuator backed by the peer session manager
pub struct SessionActuator {
    manager: Arc<PeerSessionManager>,
    capture: Arc<dyn MediaCapture>,
    request: CaptureRequest,
    roster: RwLock<Vec<String>>,
    stream: Mutex<Option<CapturedStream>>,
}

impl SessionActuator {
    pub fn new(
        manager: Arc<PeerSessionManager>,
        capture: Arc<dyn MediaCapture>,
        request: CaptureRequest,
    ) -> Self {
        Self {
            manager,
            capture,
            request,
            roster: RwLock::new(Vec::new()),
            stream: Mutex::new(None),
        }
    }

    /// Session manager being driven
    pub fn manager(&self) -> &Arc<PeerSessionManager> {
        &self.manager
    }

    /// Replace the set of remote participants to connect to
    pub fn set_roster(&self, peers: Vec<String>) {
        *self.roster.write() = peers;
    }

    /// Remote participants currently known
    pub fn roster(&self) -> Vec<String> {
        self.roster.read().clone()
    }

    /// Forget a participant
    pub fn remove_from_roster(&self, peer_id: &str) {
        self.roster.write().retain(|p| p != peer_id);
    }

    /// Whether a captured video stream is being sent
    pub async fn is_capturing(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Connect a participant who joined mid-session
    ///
    /// Opens the session and, if video is currently streaming, attaches it.
    pub async fn admit_peer(&self, peer_id: &str) -> Result<()> {
        {
            let mut roster = self.roster.write();
            if !roster.iter().any(|p| p == peer_id) {
                roster.push(peer_id.to_string());
            }
        }
        self.manager.open_session(peer_id).await?;
        if let Some(stream) = self.stream.lock().await.as_ref() {
            self.manager.attach_video(peer_id, stream).await?;
        }
        Ok(())
    }

    async fn connect_peers(&self) -> Result<()> {
        let roster = self.roster();
        let mut failures = Vec::new();
        for peer_id in &roster {
            if let Err(e) = self.manager.open_session(peer_id).await {
                warn!("Could not open session to {}: {}", peer_id, e);
                failures.push(e);
            }
        }
        all_failed(roster.len(), failures)
    }

    async fn start_video_streaming(&self) -> Result<()> {
        let mut current = self.stream.lock().await;
        let stream = match current.as_ref() {
            Some(stream) => stream.clone(),
            None => {
                let stream = self.capture.capture_element(&self.request).await?;
                info!(
                    "Captured playback element at {}fps (element audio: {})",
                    self.request.frame_rate,
                    stream.audio.is_some()
                );
                *current = Some(stream.clone());
                stream
            }
        };
        drop(current);

        let sessions = self.manager.session_count().await;
        let failures = self.manager.attach_video_all(&stream).await;
        all_failed(sessions, failures.into_iter().map(|(_, e)| e).collect())
    }

    async fn stop_video_streaming(&self) -> Result<()> {
        let sessions = self.manager.session_count().await;
        let failures = self.manager.detach_video_all().await;
        if self.stream.lock().await.take().is_some() {
            debug!("Released captured stream");
        }
        all_failed(sessions, failures.into_iter().map(|(_, e)| e).collect())
    }
}

/// Fail only when every attempt failed; partial failure is degradation
fn all_failed(attempts: usize, mut failures: Vec<Error>) -> Result<()> {
    if attempts > 0 && failures.len() == attempts {
        return Err(failures.remove(0));
    }
    Ok(())
}

#[async_trait]
impl MediaActuator for SessionActuator {
    async fn perform(&self, action: Action) -> Result<()> {
        debug!("Performing {}", action);
        match action {
            Action::InitializeMicrophone => {
                self.manager.prepare_microphone().await;
                Ok(())
            }
            Action::ConnectPeers => self.connect_peers().await,
            Action::StartVideoStreaming => self.start_video_streaming().await,
            Action::StopVideoStreaming => self.stop_video_streaming().await,
            Action::PreserveMicrophone => {
                let repaired = self.manager.ensure_microphone_all().await;
                if repaired > 0 {
                    info!("Restored microphone on {} session(s)", repaired);
                }
                Ok(())
            }
            Action::DisconnectPeers => {
                self.stream.lock().await.take();
                self.manager.close_all().await
            }
        }
    }
}
