//! Per-participant session record
//!
//! A [`PeerSession`] owns its transport and its track slots. The transport
//! handle can be swapped by a restart while the session identity and the
//! slots survive.

use super::lifecycle::RestartTracker;
use super::quality::ConnectionQuality;
use super::track::{TrackRole, TrackSlots};
use super::transport::{PeerTransport, TransportState};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::{oneshot, Mutex, MutexGuard, Notify, RwLock};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    /// Map a transport state onto the session lifecycle
    ///
    /// A disconnected transport may still recover, so it counts as connecting.
    pub fn from_transport(state: TransportState) -> Self {
        match state {
            TransportState::New => SessionState::New,
            TransportState::Connecting | TransportState::Disconnected => SessionState::Connecting,
            TransportState::Connected => SessionState::Connected,
            TransportState::Failed => SessionState::Failed,
            TransportState::Closed => SessionState::Closed,
        }
    }

    /// Whether the session can still carry media
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub peer_id: String,
    pub state: SessionState,
    pub quality: ConnectionQuality,
    pub roles: Vec<TrackRole>,
    pub microphone_enabled: bool,
    pub microphone_synthetic: bool,
    pub renegotiations: u64,
    pub restarts: u32,
}

/// One remote participant's session
pub struct PeerSession {
    peer_id: String,
    transport: RwLock<Arc<dyn PeerTransport>>,
    generation: AtomicU64,
    slots: Mutex<TrackSlots>,
    state: SyncMutex<SessionState>,
    quality: SyncMutex<ConnectionQuality>,
    failure: SyncMutex<Option<String>>,

    /// Held for the whole offer/answer round
    negotiation: Mutex<()>,
    pending_answer: SyncMutex<Option<oneshot::Sender<String>>>,
    offer_armed: Notify,
    offer_withdrawn: AtomicBool,
    queued_negotiations: AtomicUsize,
    negotiations_idle: Notify,
    renegotiations: AtomicU64,

    pub(crate) restarts: RestartTracker,
}

impl PeerSession {
    pub(crate) fn new(peer_id: impl Into<String>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            peer_id: peer_id.into(),
            transport: RwLock::new(transport),
            generation: AtomicU64::new(0),
            slots: Mutex::new(TrackSlots::default()),
            state: SyncMutex::new(SessionState::New),
            quality: SyncMutex::new(ConnectionQuality::default()),
            failure: SyncMutex::new(None),
            negotiation: Mutex::new(()),
            pending_answer: SyncMutex::new(None),
            offer_armed: Notify::new(),
            offer_withdrawn: AtomicBool::new(false),
            queued_negotiations: AtomicUsize::new(0),
            negotiations_idle: Notify::new(),
            renegotiations: AtomicU64::new(0),
            restarts: RestartTracker::new(),
        }
    }

    /// Remote participant id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current transport handle
    pub async fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&*self.transport.read().await)
    }

    pub(crate) async fn set_transport(&self, transport: Arc<dyn PeerTransport>) -> Arc<dyn PeerTransport> {
        std::mem::replace(&mut *self.transport.write().await, transport)
    }

    /// Transport generation; bumped by every restart
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Lock the track slots
    pub async fn slots(&self) -> MutexGuard<'_, TrackSlots> {
        self.slots.lock().await
    }

    /// Lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Set the lifecycle state, returning the previous one
    pub(crate) fn set_state(&self, state: SessionState) -> SessionState {
        std::mem::replace(&mut *self.state.lock(), state)
    }

    /// Last classified connection quality
    pub fn quality(&self) -> ConnectionQuality {
        *self.quality.lock()
    }

    pub(crate) fn set_quality(&self, quality: ConnectionQuality) -> ConnectionQuality {
        std::mem::replace(&mut *self.quality.lock(), quality)
    }

    /// Reason the session failed, if it has
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
        self.set_state(SessionState::Failed);
    }

    /// Completed renegotiations
    pub fn renegotiations(&self) -> u64 {
        self.renegotiations.load(Ordering::SeqCst)
    }

    pub(crate) fn record_renegotiation(&self) -> u64 {
        self.renegotiations.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) async fn lock_negotiation(&self) -> MutexGuard<'_, ()> {
        self.negotiation.lock().await
    }

    /// Whether an offer of ours is in flight
    pub fn is_negotiating(&self) -> bool {
        self.pending_answer.lock().is_some()
    }

    pub(crate) fn arm_answer(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        *self.pending_answer.lock() = Some(tx);
        self.offer_armed.notify_waiters();
        rx
    }

    /// Resolves when the next offer round arms
    pub(crate) fn offer_armed(&self) -> Notified<'_> {
        self.offer_armed.notified()
    }

    /// Abandon the offer in flight so a colliding remote offer can be answered
    ///
    /// Returns false when no offer was in flight.
    pub(crate) fn withdraw_offer(&self) -> bool {
        let withdrawn = self.pending_answer.lock().take().is_some();
        if withdrawn {
            self.offer_withdrawn.store(true, Ordering::SeqCst);
        }
        withdrawn
    }

    /// Whether the last offer was withdrawn; clears the mark
    pub(crate) fn take_offer_withdrawn(&self) -> bool {
        self.offer_withdrawn.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn disarm_answer(&self) {
        self.pending_answer.lock().take();
    }

    /// Hand an inbound answer to the waiting negotiation
    ///
    /// Returns false when no offer is outstanding.
    pub(crate) fn deliver_answer(&self, sdp: String) -> bool {
        match self.pending_answer.lock().take() {
            Some(tx) => tx.send(sdp).is_ok(),
            None => false,
        }
    }

    pub(crate) fn negotiation_queued(&self) {
        self.queued_negotiations.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn negotiation_finished(&self) {
        if self.queued_negotiations.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.negotiations_idle.notify_waiters();
        }
    }

    /// Wait until every scheduled renegotiation has finished
    pub async fn wait_negotiations_idle(&self) {
        loop {
            let notified = self.negotiations_idle.notified();
            if self.queued_negotiations.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Read-only view
    pub async fn snapshot(&self) -> SessionSnapshot {
        let slots = self.slots.lock().await;
        let microphone = slots.get(TrackRole::Microphone);
        SessionSnapshot {
            peer_id: self.peer_id.clone(),
            state: self.state(),
            quality: self.quality(),
            roles: slots.roles(),
            microphone_enabled: microphone.map(|s| s.track.is_enabled()).unwrap_or(false),
            microphone_synthetic: microphone.map(|s| s.track.is_synthetic()).unwrap_or(false),
            renegotiations: self.renegotiations(),
            restarts: self.restarts.attempts(),
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}
