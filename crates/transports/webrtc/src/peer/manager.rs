//! Peer session management
//!
//! [`PeerSessionManager`] keeps one [`PeerSession`] per remote participant
//! and is the only writer of their track slots.
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!   open/attach/detach ─►      PeerSessionManager      ├─► SignalingChannel
//!   handle_signal      ─►  sessions: peer → PeerSession│   (offer/answer/ice)
//!                       └──────┬───────────────▲───────┘
//!                              │ add/remove    │ TaggedTransportEvent
//!                              ▼ replace       │ (state, ice candidates)
//!                       ┌──────────────────────┴───────┐
//!                       │  PeerTransport (per session) │
//!                       └──────────────────────────────┘
//! ```
//!
//! Every slot add/remove schedules a renegotiation. Renegotiations for one
//! peer hold the session's negotiation lock from offer creation until the
//! answer is applied, so they never overlap.
//!
//! Both sides may offer at once (symmetric restarts, simultaneous track
//! changes). Of the two participants the one with the lower id is polite:
//! it withdraws its own offer, answers the remote one and offers again
//! afterwards. The other side ignores the colliding offer and waits for its
//! answer.

use super::capture::{microphone_or_silence, CapturedStream, MediaCapture};
use super::lifecycle::{FailureDecision, RestartPolicy};
use super::quality::{ConnectionQuality, QualityLadder};
use super::session::{PeerSession, SessionSnapshot, SessionState};
use super::track::{LocalTrack, TrackRole, TrackSlot};
use super::transport::{
    PeerTransport, TaggedTransportEvent, TransportEvent, TransportEvents, TransportFactory,
    TransportState,
};
use crate::config::PeerConfig;
use crate::events::{EventBus, Subscription};
use crate::signaling::{PeerSignal, SignalingChannel};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Notifications from the session manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened {
        peer_id: String,
    },
    StateChanged {
        peer_id: String,
        from: SessionState,
        to: SessionState,
    },
    QualityChanged {
        peer_id: String,
        from: ConnectionQuality,
        to: ConnectionQuality,
    },
    Renegotiated {
        peer_id: String,
        count: u64,
    },
    RenegotiationFailed {
        peer_id: String,
        reason: String,
    },
    Restarted {
        peer_id: String,
        attempt: u32,
    },
    /// Transport failed for good; the session stays registered as failed
    Failed {
        peer_id: String,
        reason: String,
    },
    Closed {
        peer_id: String,
    },
    /// No microphone could be opened; sessions carry synthetic silence
    MicrophoneDegraded,
}

/// Collaborators the manager drives
#[derive(Clone)]
pub struct SessionBackends {
    pub factory: Arc<dyn TransportFactory>,
    pub capture: Arc<dyn MediaCapture>,
    pub signaling: Arc<dyn SignalingChannel>,
    /// Overrides the policy derived from `PeerConfig::restart_delay_ms`
    pub restart_policy: Option<RestartPolicy>,
    /// Our own participant id; decides who gives way on offer collisions
    pub local_id: Option<String>,
}

impl SessionBackends {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        capture: Arc<dyn MediaCapture>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self {
            factory,
            capture,
            signaling,
            restart_policy: None,
            local_id: None,
        }
    }

    /// Use an explicit restart policy
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }

    /// Identify the local participant
    ///
    /// Without it every offer collision is settled in the remote offer's
    /// favour, which only converges if the remote side knows its own id.
    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }
}

/// Owns every peer session of one participant
pub struct PeerSessionManager {
    config: PeerConfig,
    factory: Arc<dyn TransportFactory>,
    capture: Arc<dyn MediaCapture>,
    signaling: Arc<dyn SignalingChannel>,
    restart_policy: RestartPolicy,
    local_id: Option<String>,

    /// Arena of sessions
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,

    /// Serializes session creation so concurrent opens stay idempotent
    open_lock: Mutex<()>,

    /// Shared local microphone, opened lazily
    microphone: Mutex<Option<Arc<LocalTrack>>>,

    /// Participant muted themselves; health checks must not undo it
    microphone_muted: AtomicBool,

    events: EventBus<SessionEvent>,
    transport_tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PeerSessionManager {
    /// Create a manager and start its transport-event dispatcher
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: PeerConfig, backends: SessionBackends) -> Arc<Self> {
        let restart_policy = backends.restart_policy.unwrap_or_else(|| {
            RestartPolicy::with_delay(Duration::from_millis(config.restart_delay_ms))
        });
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            config,
            factory: backends.factory,
            capture: backends.capture,
            signaling: backends.signaling,
            restart_policy,
            local_id: backends.local_id,
            sessions: RwLock::new(HashMap::new()),
            open_lock: Mutex::new(()),
            microphone: Mutex::new(None),
            microphone_muted: AtomicBool::new(false),
            events: EventBus::new(),
            transport_tx,
            dispatcher: parking_lot::Mutex::new(None),
        });

        let handle = tokio::spawn(Self::dispatch_transport_events(
            Arc::downgrade(&manager),
            transport_rx,
        ));
        *manager.dispatcher.lock() = Some(handle);

        manager
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.events.subscribe()
    }

    /// Encoding ladder in use
    pub fn quality_ladder(&self) -> &QualityLadder {
        &self.config.quality_ladder
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Open a session, or return the live one already open for this peer
    ///
    /// The new session starts with the local microphone attached (synthetic
    /// silence if no microphone can be opened) and immediately offers.
    #[instrument(skip(self), fields(peer_id = %peer_id))]
    pub async fn open_session(self: &Arc<Self>, peer_id: &str) -> Result<Arc<PeerSession>> {
        let (session, created) = self.open_or_get(peer_id).await?;
        if created {
            self.schedule_renegotiation(&session);
        }
        Ok(session)
    }

    async fn open_or_get(self: &Arc<Self>, peer_id: &str) -> Result<(Arc<PeerSession>, bool)> {
        if let Some(session) = self.live_session(peer_id).await {
            return Ok((session, false));
        }

        let _guard = self.open_lock.lock().await;
        if let Some(session) = self.live_session(peer_id).await {
            return Ok((session, false));
        }

        // A failed or closed record is replaced by a fresh session
        let stale = self.sessions.write().await.remove(peer_id);
        if let Some(stale) = stale {
            debug!("Replacing {:?} session for {}", stale.state(), peer_id);
            self.release_session(&stale).await;
        }

        if self.sessions.read().await.len() >= self.config.max_peers as usize {
            return Err(Error::NotPermitted(format!(
                "Maximum peer limit reached ({})",
                self.config.max_peers
            )));
        }

        let session = self.create_session(peer_id).await?;
        self.sessions
            .write()
            .await
            .insert(peer_id.to_string(), Arc::clone(&session));

        info!("Opened session for peer {}", peer_id);
        self.events.emit(SessionEvent::Opened {
            peer_id: peer_id.to_string(),
        });
        Ok((session, true))
    }

    async fn create_session(&self, peer_id: &str) -> Result<Arc<PeerSession>> {
        let events = TransportEvents::new(peer_id, 0, self.transport_tx.clone());
        let transport = self.factory.create(peer_id, events).await?;
        let session = Arc::new(PeerSession::new(peer_id, Arc::clone(&transport)));

        let microphone = self.local_microphone().await;
        let sender = match transport
            .add_track(TrackRole::Microphone, Arc::clone(&microphone))
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };
        session.slots().await.insert(TrackSlot {
            role: TrackRole::Microphone,
            track: microphone,
            sender,
        })?;

        Ok(session)
    }

    /// Close a session and release its slots and transport
    #[instrument(skip(self), fields(peer_id = %peer_id))]
    pub async fn close_session(&self, peer_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(peer_id)
            .ok_or_else(|| Error::SessionNotFound(peer_id.to_string()))?;

        self.release_session(&session).await;
        info!("Closed session for peer {}", peer_id);
        self.events.emit(SessionEvent::Closed {
            peer_id: peer_id.to_string(),
        });
        Ok(())
    }

    /// Close every session
    pub async fn close_all(&self) -> Result<()> {
        let peer_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for peer_id in peer_ids {
            if let Err(e) = self.close_session(&peer_id).await {
                debug!("Session {} already gone: {}", peer_id, e);
            }
        }
        Ok(())
    }

    async fn release_session(&self, session: &PeerSession) {
        session.disarm_answer();
        let transport = session.transport().await;
        let drained = session.slots().await.drain();
        for slot in drained {
            if let Err(e) = transport.remove_track(&slot.sender).await {
                debug!("Releasing {} slot for {}: {}", slot.role, session.peer_id(), e);
            }
        }
        if let Err(e) = transport.close().await {
            warn!("Error closing transport for {}: {}", session.peer_id(), e);
        }
        session.set_state(SessionState::Closed);
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Session for a peer
    pub async fn session(&self, peer_id: &str) -> Result<Arc<PeerSession>> {
        self.sessions
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(peer_id.to_string()))
    }

    async fn live_session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions
            .read()
            .await
            .get(peer_id)
            .filter(|s| s.state().is_live())
            .cloned()
    }

    /// Session that can still carry media
    async fn active_session(&self, peer_id: &str) -> Result<Arc<PeerSession>> {
        let session = self.session(peer_id).await?;
        if !session.state().is_live() {
            return Err(Error::TransportFailed(
                session
                    .failure()
                    .unwrap_or_else(|| format!("session for {} is closed", peer_id)),
            ));
        }
        Ok(session)
    }

    /// Ids of all registered sessions
    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshots of all sessions, sorted by peer id
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<PeerSession>> = self.sessions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshots.push(session.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshots
    }

    /// Snapshot of one session
    pub async fn session_snapshot(&self, peer_id: &str) -> Result<SessionSnapshot> {
        Ok(self.session(peer_id).await?.snapshot().await)
    }

    /// Number of registered sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    // ------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------

    /// Open the local microphone ahead of any session
    pub async fn prepare_microphone(&self) -> Arc<LocalTrack> {
        self.local_microphone().await
    }

    async fn local_microphone(&self) -> Arc<LocalTrack> {
        let mut microphone = self.microphone.lock().await;
        if let Some(track) = microphone.as_ref() {
            return Arc::clone(track);
        }

        let (track, degraded) =
            microphone_or_silence(self.capture.as_ref(), &self.config.microphone).await;
        if degraded {
            self.events.emit(SessionEvent::MicrophoneDegraded);
        }
        if self.microphone_muted.load(Ordering::SeqCst) {
            track.set_enabled(false);
        }
        *microphone = Some(Arc::clone(&track));
        track
    }

    /// Mute or unmute the local microphone on every session
    pub async fn set_microphone_muted(&self, muted: bool) {
        self.microphone_muted.store(muted, Ordering::SeqCst);
        if let Some(track) = self.microphone.lock().await.as_ref() {
            track.set_enabled(!muted);
        }
    }

    /// Whether the participant muted themselves
    pub fn is_microphone_muted(&self) -> bool {
        self.microphone_muted.load(Ordering::SeqCst)
    }

    /// Attach captured video (and its own audio, if captured) to a session
    ///
    /// Adds `video` and `video-audio` slots and renegotiates. The microphone
    /// slot is never touched. Attaching the same stream twice is a no-op.
    #[instrument(skip(self, stream), fields(peer_id = %peer_id))]
    pub async fn attach_video(self: &Arc<Self>, peer_id: &str, stream: &CapturedStream) -> Result<()> {
        let session = self.active_session(peer_id).await?;
        let transport = session.transport().await;

        {
            let mut slots = session.slots().await;
            if let Some(existing) = slots.get(TrackRole::Video) {
                if existing.track.id() == stream.video.id() {
                    return Ok(());
                }
                return Err(Error::MediaTrackError(format!(
                    "video already attached to {}",
                    peer_id
                )));
            }

            let video_sender = transport
                .add_track(TrackRole::Video, Arc::clone(&stream.video))
                .await?;
            slots.insert(TrackSlot {
                role: TrackRole::Video,
                track: Arc::clone(&stream.video),
                sender: video_sender.clone(),
            })?;

            if let Some(audio) = &stream.audio {
                match transport
                    .add_track(TrackRole::VideoAudio, Arc::clone(audio))
                    .await
                {
                    Ok(sender) => {
                        slots.insert(TrackSlot {
                            role: TrackRole::VideoAudio,
                            track: Arc::clone(audio),
                            sender,
                        })?;
                    }
                    Err(e) => {
                        // Leave no half-attached video behind
                        slots.take(TrackRole::Video);
                        let _ = transport.remove_track(&video_sender).await;
                        return Err(e);
                    }
                }
            }

            let encoding = self.config.quality_ladder.encoding_for(session.quality());
            if let Err(e) = transport.set_encoding(&video_sender, encoding).await {
                warn!("Could not apply initial encoding for {}: {}", peer_id, e);
            }
        }

        info!("Attached video to {}", peer_id);
        self.schedule_renegotiation(&session);
        Ok(())
    }

    /// Attach video to every live session
    ///
    /// Returns the peers that failed, with their errors.
    pub async fn attach_video_all(self: &Arc<Self>, stream: &CapturedStream) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for peer_id in self.peer_ids().await {
            if let Err(e) = self.attach_video(&peer_id, stream).await {
                warn!("Attaching video to {} failed: {}", peer_id, e);
                failures.push((peer_id, e));
            }
        }
        failures
    }

    /// Remove the `video` and `video-audio` slots from a session
    ///
    /// Returns whether anything was removed.
    #[instrument(skip(self), fields(peer_id = %peer_id))]
    pub async fn detach_video(self: &Arc<Self>, peer_id: &str) -> Result<bool> {
        let session = self.session(peer_id).await?;
        let transport = session.transport().await;

        let removed = {
            let mut slots = session.slots().await;
            let mut removed = Vec::new();
            for role in [TrackRole::Video, TrackRole::VideoAudio] {
                if let Some(slot) = slots.take(role) {
                    removed.push(slot);
                }
            }
            removed
        };

        if removed.is_empty() {
            return Ok(false);
        }

        for slot in &removed {
            if let Err(e) = transport.remove_track(&slot.sender).await {
                warn!("Removing {} from {} failed: {}", slot.role, peer_id, e);
            }
        }

        info!("Detached video from {}", peer_id);
        if session.state().is_live() {
            self.schedule_renegotiation(&session);
        }
        Ok(true)
    }

    /// Detach video from every session
    ///
    /// A session closed meanwhile counts as detached. Returns the peers that
    /// failed, with their errors.
    pub async fn detach_video_all(self: &Arc<Self>) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for peer_id in self.peer_ids().await {
            match self.detach_video(&peer_id).await {
                Ok(_) => {}
                Err(Error::SessionNotFound(_)) => {
                    debug!("Session {} closed before video was detached", peer_id);
                }
                Err(e) => {
                    warn!("Detaching video from {} failed: {}", peer_id, e);
                    failures.push((peer_id, e));
                }
            }
        }
        failures
    }

    /// Swap the microphone track on one session without renegotiating
    #[instrument(skip(self, track), fields(peer_id = %peer_id))]
    pub async fn replace_microphone(&self, peer_id: &str, track: Arc<LocalTrack>) -> Result<()> {
        let session = self.active_session(peer_id).await?;
        let transport = session.transport().await;
        let mut slots = session.slots().await;

        let sender = slots
            .get(TrackRole::Microphone)
            .map(|slot| slot.sender.clone())
            .ok_or_else(|| {
                Error::MediaTrackError(format!("no microphone slot on {}", peer_id))
            })?;

        transport.replace_track(&sender, Arc::clone(&track)).await?;
        slots.replace_track(TrackRole::Microphone, track);
        debug!("Replaced microphone on {}", peer_id);
        Ok(())
    }

    /// Switch the shared microphone (device change) on every session
    pub async fn replace_microphone_all(self: &Arc<Self>, track: Arc<LocalTrack>) -> Result<()> {
        if self.microphone_muted.load(Ordering::SeqCst) {
            track.set_enabled(false);
        }
        *self.microphone.lock().await = Some(Arc::clone(&track));

        for peer_id in self.peer_ids().await {
            match self.replace_microphone(&peer_id, Arc::clone(&track)).await {
                Ok(()) => {}
                Err(Error::MediaTrackError(_)) => {
                    self.ensure_microphone(&peer_id).await?;
                }
                Err(e) => warn!("Replacing microphone on {} failed: {}", peer_id, e),
            }
        }
        Ok(())
    }

    /// Repair the microphone slot of one session
    ///
    /// Re-attaches a missing slot and re-enables a disabled track unless the
    /// participant muted. Returns whether a repair was made.
    pub async fn ensure_microphone(self: &Arc<Self>, peer_id: &str) -> Result<bool> {
        let session = self.active_session(peer_id).await?;
        let microphone = self.local_microphone().await;
        let muted = self.microphone_muted.load(Ordering::SeqCst);

        {
            let mut slots = session.slots().await;
            if let Some(slot) = slots.get(TrackRole::Microphone) {
                if muted || slot.track.is_enabled() {
                    return Ok(false);
                }
                slot.track.set_enabled(true);
                info!("Re-enabled microphone on {}", peer_id);
                return Ok(true);
            }

            let transport = session.transport().await;
            let sender = transport
                .add_track(TrackRole::Microphone, Arc::clone(&microphone))
                .await?;
            slots.insert(TrackSlot {
                role: TrackRole::Microphone,
                track: microphone,
                sender,
            })?;
        }

        info!("Re-attached missing microphone on {}", peer_id);
        self.schedule_renegotiation(&session);
        Ok(true)
    }

    /// Repair the microphone slot on every live session
    ///
    /// Returns the number of sessions repaired.
    pub async fn ensure_microphone_all(self: &Arc<Self>) -> usize {
        let mut repaired = 0;
        for peer_id in self.peer_ids().await {
            match self.ensure_microphone(&peer_id).await {
                Ok(true) => repaired += 1,
                Ok(false) => {}
                Err(e) => debug!("Microphone check skipped for {}: {}", peer_id, e),
            }
        }
        repaired
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    /// Queue an offer/answer round for a session
    pub fn schedule_renegotiation(self: &Arc<Self>, session: &Arc<PeerSession>) -> JoinHandle<Result<()>> {
        session.negotiation_queued();
        let manager = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let result = manager.renegotiate(&session).await;
            session.negotiation_finished();
            result
        })
    }

    async fn renegotiate(&self, session: &PeerSession) -> Result<()> {
        let _negotiation = session.lock_negotiation().await;
        let peer_id = session.peer_id().to_string();

        if !session.state().is_live() {
            return Ok(());
        }

        let result = self.offer_and_wait(session).await;
        session.disarm_answer();

        match result {
            Err(_) if session.take_offer_withdrawn() => {
                debug!("Withdrew offer to {} in favour of theirs", peer_id);
                Ok(())
            }
            Ok(()) => {
                let count = session.record_renegotiation();
                debug!("Negotiation #{} with {} complete", count, peer_id);
                self.events.emit(SessionEvent::Renegotiated { peer_id, count });
                Ok(())
            }
            Err(e) => {
                warn!("Negotiation with {} failed: {}", peer_id, e);
                self.events.emit(SessionEvent::RenegotiationFailed {
                    peer_id,
                    reason: e.to_string(),
                });
                Err(match e {
                    Error::RenegotiationFailed(_) => e,
                    other => Error::RenegotiationFailed(other.to_string()),
                })
            }
        }
    }

    async fn offer_and_wait(&self, session: &PeerSession) -> Result<()> {
        // Armed first so a colliding remote offer sees ours from the start
        let answer_rx = session.arm_answer();
        let transport = session.transport().await;
        let offer = transport.create_offer().await?;
        if !session.is_negotiating() {
            return Err(Error::RenegotiationFailed("offer withdrawn".to_string()));
        }

        if session.state() == SessionState::New {
            self.update_state(session, SessionState::Connecting);
        }
        self.signaling
            .send(session.peer_id(), PeerSignal::Offer(offer))
            .await?;

        let timeout = Duration::from_millis(self.config.negotiation_timeout_ms);
        let answer = tokio::time::timeout(timeout, answer_rx)
            .await
            .map_err(|_| {
                Error::RenegotiationFailed(format!(
                    "no answer from {} within {}ms",
                    session.peer_id(),
                    timeout.as_millis()
                ))
            })?
            .map_err(|_| Error::RenegotiationFailed("negotiation cancelled".to_string()))?;

        transport.set_remote_answer(&answer).await
    }

    /// Whether we give way when our offer collides with one from `peer_id`
    fn is_polite_towards(&self, peer_id: &str) -> bool {
        self.local_id
            .as_deref()
            .is_none_or(|local| local < peer_id)
    }

    /// Take the negotiation lock to answer a remote offer
    ///
    /// Returns `None` when our own offer in flight wins the collision. The
    /// flag tells whether an offer of ours was withdrawn to make way.
    async fn lock_for_answer<'a>(&self, session: &'a PeerSession) -> Option<(MutexGuard<'a, ()>, bool)> {
        let mut withdrew = false;
        loop {
            let armed = session.offer_armed();
            if session.is_negotiating() {
                if !self.is_polite_towards(session.peer_id()) {
                    return None;
                }
                withdrew |= session.withdraw_offer();
            }
            tokio::select! {
                negotiation = session.lock_negotiation() => return Some((negotiation, withdrew)),
                _ = armed => {}
            }
        }
    }

    /// Handle a negotiation payload relayed from a participant
    ///
    /// An offer from an unknown participant opens a session (without an
    /// offer of our own) and answers it. Colliding offers are settled as
    /// described in the module docs.
    #[instrument(skip(self, signal), fields(peer_id = %from, kind = signal.kind()))]
    pub async fn handle_signal(self: &Arc<Self>, from: &str, signal: PeerSignal) -> Result<()> {
        match signal {
            PeerSignal::Offer(sdp) => {
                let (session, _) = self.open_or_get(from).await?;
                let Some((negotiation, mut offer_again)) = self.lock_for_answer(&session).await else {
                    info!("Ignoring offer from {} that collided with ours", from);
                    return Ok(());
                };

                // A local offer still set here was withdrawn or never answered
                let mut transport = session.transport().await;
                if let Err(e) = transport.rollback().await {
                    debug!("Answering {} on a fresh transport: {}", from, e);
                    transport = self.rebuild_transport(&session).await?;
                    offer_again = true;
                }

                let answer = transport.create_answer(&sdp).await?;
                if session.state() == SessionState::New {
                    self.update_state(&session, SessionState::Connecting);
                }
                self.signaling.send(from, PeerSignal::Answer(answer)).await?;
                drop(negotiation);

                // Our own changes still need an offer of their own
                if offer_again {
                    self.schedule_renegotiation(&session);
                }
                Ok(())
            }
            PeerSignal::Answer(sdp) => {
                let session = self.session(from).await?;
                if !session.deliver_answer(sdp) {
                    warn!("Ignoring answer from {} with no offer outstanding", from);
                }
                Ok(())
            }
            PeerSignal::IceCandidate(candidate) => {
                let session = self.session(from).await?;
                session.transport().await.add_ice_candidate(&candidate).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport events and restarts
    // ------------------------------------------------------------------

    async fn dispatch_transport_events(
        manager: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<TaggedTransportEvent>,
    ) {
        while let Some(tagged) = rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.on_transport_event(tagged).await;
        }
        debug!("Transport event dispatcher stopped");
    }

    async fn on_transport_event(self: &Arc<Self>, tagged: TaggedTransportEvent) {
        let Ok(session) = self.session(&tagged.peer_id).await else {
            return;
        };
        if tagged.generation != session.generation() {
            debug!(
                "Dropping event from stale transport gen {} for {}",
                tagged.generation, tagged.peer_id
            );
            return;
        }

        match tagged.event {
            TransportEvent::IceCandidate(candidate) => {
                if let Err(e) = self
                    .signaling
                    .send(&tagged.peer_id, PeerSignal::IceCandidate(candidate))
                    .await
                {
                    warn!("Failed to send ICE candidate to {}: {}", tagged.peer_id, e);
                }
            }
            TransportEvent::StateChanged(TransportState::Failed) => {
                self.on_transport_failed(&session, tagged.generation);
            }
            TransportEvent::StateChanged(state) => {
                if session.state() == SessionState::Closed {
                    return;
                }
                if state == TransportState::Connected {
                    session.restarts.on_connected();
                }
                self.update_state(&session, SessionState::from_transport(state));
            }
        }
    }

    fn on_transport_failed(self: &Arc<Self>, session: &Arc<PeerSession>, generation: u64) {
        match session.restarts.on_failure(&self.restart_policy) {
            FailureDecision::Restart(attempt) => {
                warn!(
                    "Transport for {} failed, restarting in {:?} (attempt {})",
                    session.peer_id(),
                    self.restart_policy.delay,
                    attempt
                );
                self.update_state(session, SessionState::Connecting);

                let manager = Arc::clone(self);
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    tokio::time::sleep(manager.restart_policy.delay).await;
                    if session.generation() != generation || !session.state().is_live() {
                        return;
                    }
                    if let Err(e) = manager.restart_session(&session, attempt).await {
                        manager.surface_failure(&session, e.to_string());
                    }
                });
            }
            FailureDecision::Surface => {
                self.surface_failure(
                    session,
                    format!("transport to {} failed after restart", session.peer_id()),
                );
            }
        }
    }

    /// Tear down the transport and reopen it, keeping the session and slots
    async fn restart_session(self: &Arc<Self>, session: &Arc<PeerSession>, attempt: u32) -> Result<()> {
        let peer_id = session.peer_id().to_string();
        // An offer on the dead transport will never be answered
        session.disarm_answer();
        let negotiation = session.lock_negotiation().await;
        self.rebuild_transport(session).await?;

        info!("Restarted transport for {} (attempt {})", peer_id, attempt);
        self.update_state(session, SessionState::New);
        self.events.emit(SessionEvent::Restarted { peer_id, attempt });

        drop(negotiation);
        self.schedule_renegotiation(session);
        Ok(())
    }

    /// Swap in a new transport carrying the session's slots
    ///
    /// The caller holds the session's negotiation lock.
    async fn rebuild_transport(&self, session: &PeerSession) -> Result<Arc<dyn PeerTransport>> {
        let peer_id = session.peer_id();
        let generation = session.next_generation();
        let events = TransportEvents::new(peer_id, generation, self.transport_tx.clone());
        let transport = self.factory.create(peer_id, events).await?;

        {
            let mut slots = session.slots().await;
            for role in slots.roles() {
                let Some(track) = slots.get(role).map(|slot| Arc::clone(&slot.track)) else {
                    continue;
                };
                let sender = transport.add_track(role, track).await?;
                slots.set_sender(role, sender);
            }
            if let Some(video) = slots.get(TrackRole::Video) {
                let encoding = self.config.quality_ladder.encoding_for(session.quality());
                if let Err(e) = transport.set_encoding(&video.sender, encoding).await {
                    debug!("Encoding not applied to new transport for {}: {}", peer_id, e);
                }
            }
        }

        let old = session.set_transport(Arc::clone(&transport)).await;
        if let Err(e) = old.close().await {
            debug!("Closing replaced transport for {}: {}", peer_id, e);
        }
        Ok(transport)
    }

    fn surface_failure(&self, session: &PeerSession, reason: String) {
        let error = Error::TransportFailed(reason);
        warn!("Session {} failed: {}", session.peer_id(), error);

        let from = session.state();
        session.mark_failed(error.to_string());
        session.disarm_answer();
        if from != SessionState::Failed {
            self.events.emit(SessionEvent::StateChanged {
                peer_id: session.peer_id().to_string(),
                from,
                to: SessionState::Failed,
            });
        }
        self.events.emit(SessionEvent::Failed {
            peer_id: session.peer_id().to_string(),
            reason: error.to_string(),
        });
    }

    fn update_state(&self, session: &PeerSession, to: SessionState) {
        let from = session.set_state(to);
        if from != to {
            debug!("Session {} {:?} -> {:?}", session.peer_id(), from, to);
            self.events.emit(SessionEvent::StateChanged {
                peer_id: session.peer_id().to_string(),
                from,
                to,
            });
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Sample every session's transport and re-apply video encodings
    ///
    /// Returns the sessions whose quality class changed.
    pub async fn sample_quality(&self) -> Vec<(String, ConnectionQuality)> {
        let sessions: Vec<Arc<PeerSession>> = self.sessions.read().await.values().cloned().collect();
        let mut changed = Vec::new();

        for session in sessions {
            if !session.state().is_live() {
                continue;
            }
            let transport = session.transport().await;
            let stats = match transport.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!("No stats for {}: {}", session.peer_id(), e);
                    continue;
                }
            };

            let quality = ConnectionQuality::classify(&stats);
            let previous = session.set_quality(quality);
            if previous == quality {
                continue;
            }

            info!(
                "Connection to {} is now {:?} (rtt {:?}ms, loss {:.1}%)",
                session.peer_id(),
                quality,
                stats.rtt_ms,
                stats.packet_loss_rate * 100.0
            );
            let video_sender = session
                .slots()
                .await
                .get(TrackRole::Video)
                .map(|slot| slot.sender.clone());
            if let Some(sender) = video_sender {
                let encoding = self.config.quality_ladder.encoding_for(quality);
                if let Err(e) = transport.set_encoding(&sender, encoding).await {
                    warn!("Failed to re-encode video for {}: {}", session.peer_id(), e);
                }
            }

            self.events.emit(SessionEvent::QualityChanged {
                peer_id: session.peer_id().to_string(),
                from: previous,
                to: quality,
            });
            changed.push((session.peer_id().to_string(), quality));
        }
        changed
    }

    /// Periodically sample connection quality
    pub fn spawn_quality_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sample_quality().await;
            }
        })
    }

    /// Periodically repair microphone slots
    pub fn spawn_health_check(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let repaired = manager.ensure_microphone_all().await;
                if repaired > 0 {
                    info!("Health check repaired {} microphone slot(s)", repaired);
                }
            }
        })
    }

    /// Stop the transport-event dispatcher
    pub fn shutdown(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
