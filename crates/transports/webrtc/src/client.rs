//! Watch-party client facade
//!
//! [`WatchPartyClient`] wires the peer session manager, stream coordinator,
//! progressive loader and sync engine together for one participant. Inbound
//! relay messages go through [`WatchPartyClient::handle_server_message`];
//! host playback actions leave as `movie-control` messages.

use crate::clock::SharedClock;
use crate::config::CineSyncConfig;
use crate::coordinator::{MediaActuator, SessionActuator, StreamCoordinator, StreamState};
use crate::loader::{DecodeTarget, LoadOutcome, LoaderMetrics, MediaSource, PlaybackElement, ProgressiveLoader};
use crate::peer::{
    CaptureRequest, MediaCapture, PeerSessionManager, SessionBackends, TransportFactory,
};
use crate::signaling::{
    ClientMessage, MovieAction, MovieState, PeerSignal, RelayOutbound, ServerMessage,
    SignalingChannel,
};
use crate::sync::{PlaybackSyncEngine, SyncEvent, SyncStats, TimeSource};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Collaborators a [`WatchPartyClient`] is built from
#[derive(Clone)]
pub struct WatchPartyBackends {
    pub factory: Arc<dyn TransportFactory>,
    pub capture: Arc<dyn MediaCapture>,
    /// Outbound relay messages
    pub relay: Arc<dyn RelayOutbound>,
    /// Outbound negotiation payloads (normally the same relay connection)
    pub signaling: Arc<dyn SignalingChannel>,
    pub target: Arc<dyn DecodeTarget>,
    pub element: Arc<dyn PlaybackElement>,
    pub clock: SharedClock,
}

impl WatchPartyBackends {
    /// Backends sharing one relay connection for all outbound traffic
    pub fn new<R>(
        factory: Arc<dyn TransportFactory>,
        capture: Arc<dyn MediaCapture>,
        relay: Arc<R>,
        target: Arc<dyn DecodeTarget>,
        element: Arc<dyn PlaybackElement>,
        clock: SharedClock,
    ) -> Self
    where
        R: RelayOutbound + SignalingChannel + 'static,
    {
        Self {
            factory,
            capture,
            relay: Arc::clone(&relay) as Arc<dyn RelayOutbound>,
            signaling: relay as Arc<dyn SignalingChannel>,
            target,
            element,
            clock,
        }
    }
}

/// What this participant knows about its room
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomView {
    pub room: Option<String>,
    pub host: Option<String>,
    /// Everyone in the room, including us, in join order
    pub participants: Vec<String>,
}

/// Loaded file and its background buffering task
struct LoadedMedia {
    loader: Arc<ProgressiveLoader>,
    buffering: JoinHandle<()>,
}

impl Drop for LoadedMedia {
    fn drop(&mut self) {
        self.buffering.abort();
    }
}

/// One participant of a watch party
pub struct WatchPartyClient {
    user: String,
    config: CineSyncConfig,
    relay: Arc<dyn RelayOutbound>,
    manager: Arc<PeerSessionManager>,
    actuator: Arc<SessionActuator>,
    coordinator: StreamCoordinator,
    sync: Arc<PlaybackSyncEngine>,
    target: Arc<dyn DecodeTarget>,
    element: Arc<dyn PlaybackElement>,
    media: Mutex<Option<LoadedMedia>>,
    room: RwLock<RoomView>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WatchPartyClient {
    /// Build a client for `user`
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration does not validate.
    pub fn new(
        user: impl Into<String>,
        config: CineSyncConfig,
        backends: WatchPartyBackends,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let user = user.into();

        let manager = PeerSessionManager::new(
            config.peer.clone(),
            SessionBackends::new(
                backends.factory,
                Arc::clone(&backends.capture),
                backends.signaling,
            )
            .with_local_id(user.clone()),
        );
        let actuator = Arc::new(SessionActuator::new(
            Arc::clone(&manager),
            backends.capture,
            CaptureRequest {
                frame_rate: config.peer.capture_frame_rate,
                include_audio: config.peer.include_video_audio,
            },
        ));
        let coordinator = StreamCoordinator::new(Arc::clone(&actuator) as Arc<dyn MediaActuator>);
        let sync = Arc::new(PlaybackSyncEngine::new(
            config.sync.clone(),
            backends.clock,
            Arc::clone(&backends.element),
        ));

        info!("Watch-party client ready for {}", user);
        Ok(Arc::new(Self {
            user,
            config,
            relay: backends.relay,
            manager,
            actuator,
            coordinator,
            sync,
            target: backends.target,
            element: backends.element,
            media: Mutex::new(None),
            room: RwLock::new(RoomView::default()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn room(&self) -> RoomView {
        self.room.read().clone()
    }

    /// Whether we are the room's host-of-record
    pub fn is_host(&self) -> bool {
        self.room.read().host.as_deref() == Some(self.user.as_str())
    }

    pub fn state(&self) -> StreamState {
        self.coordinator.state()
    }

    pub fn coordinator(&self) -> &StreamCoordinator {
        &self.coordinator
    }

    pub fn manager(&self) -> &Arc<PeerSessionManager> {
        &self.manager
    }

    pub fn sync_engine(&self) -> &Arc<PlaybackSyncEngine> {
        &self.sync
    }

    /// Loader for the current file, if one is loaded
    pub fn loader(&self) -> Option<Arc<ProgressiveLoader>> {
        self.media.lock().as_ref().map(|m| Arc::clone(&m.loader))
    }

    pub fn loader_metrics(&self) -> Option<LoaderMetrics> {
        self.loader().map(|loader| loader.metrics())
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.sync_stats()
    }

    // ------------------------------------------------------------------
    // Room membership
    // ------------------------------------------------------------------

    /// Ask the relay to let us into `room`
    pub fn join(&self, room: &str) -> Result<()> {
        self.room.write().room = Some(room.to_string());
        self.relay.send_message(ClientMessage::Join {
            room: room.to_string(),
            user: self.user.clone(),
        })
    }

    /// Start periodic calibration, quality sampling and microphone checks
    pub fn start_background_tasks(&self, time_source: Arc<dyn TimeSource>) {
        let peer = &self.config.peer;
        let handles = [
            self.sync.spawn_calibration(time_source),
            self.manager
                .spawn_quality_monitor(Duration::from_millis(peer.quality_interval_ms)),
            self.manager
                .spawn_health_check(Duration::from_millis(peer.health_check_interval_ms)),
        ];
        self.tasks.lock().extend(handles);
    }

    /// Feed relay messages to this client until the channel closes
    pub fn spawn_message_loop(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(client) = weak.upgrade() else { break };
                if let Err(e) = client.handle_server_message(message).await {
                    warn!("Handling relay message failed: {}", e);
                }
            }
            debug!("Relay message loop ended");
        })
    }

    /// Route one message from the relay
    #[instrument(skip(self, message), fields(user = %self.user))]
    pub async fn handle_server_message(&self, message: ServerMessage) -> Result<()> {
        if let Some((from, signal)) = PeerSignal::from_server_message(&message) {
            return self.handle_peer_signal(&from, signal).await;
        }

        match message {
            ServerMessage::Joined {
                user,
                host,
                participants,
            } => {
                if user != self.user {
                    warn!("Ignoring join confirmation for {}", user);
                    return Ok(());
                }
                info!("Joined room as {} (host: {})", user, host);
                {
                    let mut room = self.room.write();
                    room.host = Some(host);
                    room.participants = participants;
                }
                self.actuator.set_roster(self.remote_participants());
                if self.coordinator.state() == StreamState::Idle {
                    self.coordinator.start_voice_chat().await?;
                }
                Ok(())
            }
            ServerMessage::ParticipantJoined { user } => {
                debug!("{} joined", user);
                {
                    let mut room = self.room.write();
                    if !room.participants.contains(&user) {
                        room.participants.push(user);
                    }
                }
                // The newcomer offers; we answer when it arrives
                self.actuator.set_roster(self.remote_participants());
                Ok(())
            }
            ServerMessage::ParticipantLeft { user, new_host } => {
                info!("{} left", user);
                {
                    let mut room = self.room.write();
                    room.participants.retain(|p| p != &user);
                    if let Some(host) = new_host {
                        info!("{} is now host", host);
                        room.host = Some(host);
                    }
                }
                self.actuator.remove_from_roster(&user);
                match self.manager.close_session(&user).await {
                    Ok(()) | Err(Error::SessionNotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            ServerMessage::MovieSync {
                action,
                movie_state,
                precision_timestamp,
                ..
            } => {
                self.apply_movie_sync(action, &movie_state, precision_timestamp)
                    .await
                    .map(|_| ())
            }
            ServerMessage::TimeSyncResponse { .. } => {
                debug!("Clock probe reply outside a calibration round");
                Ok(())
            }
            ServerMessage::Error { message } => {
                warn!("Relay rejected a request: {}", message);
                Ok(())
            }
            ServerMessage::Offer { .. }
            | ServerMessage::Answer { .. }
            | ServerMessage::IceCandidate { .. } => Ok(()),
        }
    }

    async fn handle_peer_signal(&self, from: &str, signal: PeerSignal) -> Result<()> {
        let is_offer = matches!(signal, PeerSignal::Offer(_));
        self.manager.handle_signal(from, signal).await?;

        // A participant who arrived mid-stream gets the video too
        if is_offer && self.coordinator.is_streaming() {
            self.actuator.admit_peer(from).await?;
        }
        Ok(())
    }

    /// Apply a stamped host action to the local element
    ///
    /// The host already applied its own action and skips the echo.
    pub async fn apply_movie_sync(
        &self,
        action: MovieAction,
        state: &MovieState,
        precision_timestamp: f64,
    ) -> Result<Option<SyncEvent>> {
        if self.is_host() {
            return Ok(None);
        }
        if action == MovieAction::Seek {
            if let Some(loader) = self.loader() {
                loader.seek(state.current_time).await?;
            }
        }
        self.sync.apply(action, state, precision_timestamp).await
    }

    fn remote_participants(&self) -> Vec<String> {
        self.room
            .read()
            .participants
            .iter()
            .filter(|p| **p != self.user)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Local file
    // ------------------------------------------------------------------

    /// Load a local file for playback, replacing any previous one
    ///
    /// Moves the coordinator through `video_loading` to `video_ready`. If
    /// the file cannot be played the coordinator returns to `voice_only`.
    #[instrument(skip(self, source), fields(file = %source.name()))]
    pub async fn load_file(&self, source: Arc<dyn MediaSource>) -> Result<LoadOutcome> {
        if matches!(
            self.coordinator.state(),
            StreamState::VideoLoading | StreamState::VideoReady | StreamState::Streaming
        ) {
            self.coordinator.reset_to_voice().await?;
        }
        self.unload_media();
        self.coordinator.load_video().await?;

        match self.open_loader(source).await {
            Ok((loader, outcome)) => {
                self.coordinator.video_ready().await?;
                let buffering = loader.spawn_background_buffering();
                *self.media.lock() = Some(LoadedMedia { loader, buffering });
                info!("File ready: {:?}", outcome);
                Ok(outcome)
            }
            Err(e) => {
                warn!("{}", e.user_message());
                if let Err(reset) = self.coordinator.reset_to_voice().await {
                    warn!("Could not return to voice chat: {}", reset);
                }
                Err(e)
            }
        }
    }

    async fn open_loader(
        &self,
        source: Arc<dyn MediaSource>,
    ) -> Result<(Arc<ProgressiveLoader>, LoadOutcome)> {
        let loader = Arc::new(
            ProgressiveLoader::open(
                source,
                Arc::clone(&self.target),
                Arc::clone(&self.element),
                self.config.loader.clone(),
            )
            .await?,
        );
        let outcome = loader.start().await?;
        Ok((loader, outcome))
    }

    fn unload_media(&self) {
        if let Some(media) = self.media.lock().take() {
            debug!("Releasing {}", media.loader.media_file().name);
        }
    }

    // ------------------------------------------------------------------
    // Host controls
    // ------------------------------------------------------------------

    fn require_host(&self) -> Result<()> {
        if self.is_host() {
            Ok(())
        } else {
            Err(Error::NotPermitted(format!(
                "{} is not the host of this room",
                self.user
            )))
        }
    }

    /// Current local playback snapshot
    pub fn movie_state(&self) -> MovieState {
        MovieState {
            is_playing: !self.element.is_paused(),
            current_time: self.element.current_time(),
            duration: self.element.duration(),
            file_name: self
                .media
                .lock()
                .as_ref()
                .map(|m| m.loader.media_file().name.clone()),
        }
    }

    fn broadcast(&self, action: MovieAction) -> Result<()> {
        self.relay.send_message(ClientMessage::MovieControl {
            action,
            movie_state: self.movie_state(),
        })
    }

    /// Start sending the loaded video to every participant
    pub async fn start_streaming(&self) -> Result<()> {
        self.require_host()?;
        self.coordinator.start_streaming().await?;
        self.broadcast(MovieAction::StartStreaming)
    }

    /// Stop sending video; voice chat continues
    pub async fn stop_streaming(&self) -> Result<()> {
        self.require_host()?;
        self.coordinator.stop_streaming().await?;
        self.broadcast(MovieAction::StopStreaming)
    }

    pub async fn play(&self) -> Result<()> {
        self.require_host()?;
        self.element.play().await?;
        self.broadcast(MovieAction::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.require_host()?;
        self.element.pause();
        self.broadcast(MovieAction::Pause)
    }

    /// Jump to `position` seconds and tell the room
    pub async fn seek(&self, position: f64) -> Result<()> {
        self.require_host()?;
        if let Some(loader) = self.loader() {
            loader.seek(position).await?;
        }
        self.element.seek(position).await?;
        self.broadcast(MovieAction::Seek)
    }

    /// Send a periodic position correction
    pub fn broadcast_sync(&self) -> Result<()> {
        self.require_host()?;
        self.broadcast(MovieAction::Sync)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Leave the party: stop tasks, release the file and close every session
    pub async fn teardown(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.unload_media();
        if self.coordinator.state() != StreamState::Idle {
            self.coordinator.teardown().await?;
        }
        self.sync.reset();
        *self.room.write() = RoomView::default();
        info!("{} left the party", self.user);
        Ok(())
    }
}

impl Drop for WatchPartyClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
