//! Shared fakes for integration tests
//!
//! Scripted stand-ins for every backend seam: transports, capture, the
//! relay's outbound path, the decode pipeline, the playback element and the
//! trusted clock.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cinesync_webrtc::clock::{Clock, ManualClock};
use cinesync_webrtc::loader::{DecodeTarget, MediaSource, PlaybackElement, TimeRange};
use cinesync_webrtc::peer::{
    CaptureRequest, CapturedStream, LocalTrack, MediaCapture, MicrophoneOptions,
    PeerSessionManager, PeerTransport, SenderId, TrackKind, TrackOrigin, TrackRole,
    TransportEvent, TransportEvents, TransportFactory, TransportState, TransportStats,
    VideoEncoding,
};
use cinesync_webrtc::signaling::{ClientMessage, PeerSignal, RelayOutbound, SignalingChannel};
use cinesync_webrtc::sync::TimeSource;
use cinesync_webrtc::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Initialize tracing for tests (safe to call repeatedly)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Scripted peer transport
pub struct FakeTransport {
    peer_id: String,
    events: TransportEvents,
    senders: Mutex<HashMap<SenderId, (TrackRole, Arc<LocalTrack>)>>,
    encodings: Mutex<HashMap<SenderId, VideoEncoding>>,
    offers: AtomicUsize,
    answers_applied: AtomicUsize,
    answers_created: AtomicUsize,
    /// Local offer set and not yet answered (have-local-offer)
    negotiating: AtomicBool,
    overlaps: AtomicUsize,
    rollbacks: AtomicUsize,
    can_roll_back: bool,
    removal_gate: Mutex<Option<Arc<Semaphore>>>,
    removals_waiting: AtomicUsize,
    remote_candidates: Mutex<Vec<String>>,
    stats: Mutex<TransportStats>,
    state: Mutex<TransportState>,
    closed: AtomicBool,
}

impl FakeTransport {
    fn new(peer_id: &str, events: TransportEvents, can_roll_back: bool) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            events,
            senders: Mutex::new(HashMap::new()),
            encodings: Mutex::new(HashMap::new()),
            offers: AtomicUsize::new(0),
            answers_applied: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            negotiating: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            can_roll_back,
            removal_gate: Mutex::new(None),
            removals_waiting: AtomicUsize::new(0),
            remote_candidates: Mutex::new(Vec::new()),
            stats: Mutex::new(TransportStats::with_rtt(50.0, 0.0)),
            state: Mutex::new(TransportState::New),
            closed: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Report a connection state change to the manager
    pub fn emit_state(&self, state: TransportState) {
        *self.state.lock() = state;
        self.events.emit(TransportEvent::StateChanged(state));
    }

    /// Report a locally gathered ICE candidate
    pub fn emit_candidate(&self, candidate: &str) {
        self.events
            .emit(TransportEvent::IceCandidate(candidate.to_string()));
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    /// Roles currently being sent
    pub fn roles(&self) -> Vec<TrackRole> {
        let mut roles: Vec<TrackRole> = self.senders.lock().values().map(|(r, _)| *r).collect();
        roles.sort_by_key(|r| TrackRole::ALL.iter().position(|x| x == r));
        roles
    }

    pub fn track_count(&self) -> usize {
        self.senders.lock().len()
    }

    /// Encoding applied to the video sender, if any
    pub fn video_encoding(&self) -> Option<VideoEncoding> {
        let senders = self.senders.lock();
        let video = senders
            .iter()
            .find(|(_, (role, _))| *role == TrackRole::Video)
            .map(|(id, _)| id.clone())?;
        self.encodings.lock().get(&video).copied()
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers_applied(&self) -> usize {
        self.answers_applied.load(Ordering::SeqCst)
    }

    /// Answers produced for remote offers
    pub fn answers_created(&self) -> usize {
        self.answers_created.load(Ordering::SeqCst)
    }

    /// Local offers withdrawn by rollback
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Whether a local offer is awaiting its answer
    pub fn has_local_offer(&self) -> bool {
        self.negotiating.load(Ordering::SeqCst)
    }

    /// Park every `remove_track` until the returned gate gets permits
    pub fn hold_removals(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.removal_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Removals currently parked at the gate or past it
    pub fn removals_waiting(&self) -> usize {
        self.removals_waiting.load(Ordering::SeqCst)
    }

    /// Offers created while a previous offer was still unanswered
    pub fn overlapping_offers(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<String> {
        self.remote_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, role: TrackRole, track: Arc<LocalTrack>) -> Result<SenderId> {
        let sender = SenderId::generate();
        self.senders.lock().insert(sender.clone(), (role, track));
        Ok(sender)
    }

    async fn remove_track(&self, sender: &SenderId) -> Result<()> {
        let gate = self.removal_gate.lock().clone();
        if let Some(gate) = gate {
            self.removals_waiting.fetch_add(1, Ordering::SeqCst);
            let _permit = gate.acquire().await;
        }
        self.encodings.lock().remove(sender);
        self.senders
            .lock()
            .remove(sender)
            .map(|_| ())
            .ok_or_else(|| Error::MediaTrackError(format!("unknown sender {}", sender)))
    }

    async fn replace_track(&self, sender: &SenderId, track: Arc<LocalTrack>) -> Result<()> {
        let mut senders = self.senders.lock();
        let entry = senders
            .get_mut(sender)
            .ok_or_else(|| Error::MediaTrackError(format!("unknown sender {}", sender)))?;
        entry.1 = track;
        Ok(())
    }

    async fn set_encoding(&self, sender: &SenderId, encoding: VideoEncoding) -> Result<()> {
        self.encodings.lock().insert(sender.clone(), encoding);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        if self.negotiating.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("offer-{}-{}-{}", self.peer_id, self.generation(), n))
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String> {
        if self.negotiating.load(Ordering::SeqCst) {
            return Err(Error::SdpError(format!(
                "remote offer for {} in have-local-offer",
                self.peer_id
            )));
        }
        self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("answer-to-{}", offer_sdp))
    }

    async fn set_remote_answer(&self, _answer_sdp: &str) -> Result<()> {
        self.negotiating.store(false, Ordering::SeqCst);
        self.answers_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if !self.negotiating.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.can_roll_back {
            return Err(Error::SdpError("rollback not supported".to_string()));
        }
        self.negotiating.store(false, Ordering::SeqCst);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        self.remote_candidates.lock().push(candidate.to_string());
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(self.stats.lock().clone())
    }

    async fn state(&self) -> TransportState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = TransportState::Closed;
        Ok(())
    }
}

/// Factory handing out [`FakeTransport`]s and remembering them
#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    no_rollback: bool,
}

impl FakeTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transports that refuse to roll back a local offer
    pub fn without_rollback() -> Arc<Self> {
        Arc::new(Self {
            no_rollback: true,
            ..Self::default()
        })
    }

    /// Every transport created for `peer_id`, oldest first
    pub fn transports_for(&self, peer_id: &str) -> Vec<Arc<FakeTransport>> {
        self.created
            .lock()
            .iter()
            .filter(|t| t.peer_id == peer_id)
            .cloned()
            .collect()
    }

    /// Most recent transport for `peer_id`
    pub fn latest(&self, peer_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports_for(peer_id).pop()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport::new(peer_id, events, !self.no_rollback));
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// =============================================================================
// Capture
// =============================================================================

/// Capture backend with an optional microphone
pub struct FakeCapture {
    has_microphone: bool,
    element_captures: AtomicUsize,
}

impl FakeCapture {
    pub fn with_microphone() -> Arc<Self> {
        Arc::new(Self {
            has_microphone: true,
            element_captures: AtomicUsize::new(0),
        })
    }

    pub fn without_microphone() -> Arc<Self> {
        Arc::new(Self {
            has_microphone: false,
            element_captures: AtomicUsize::new(0),
        })
    }

    pub fn element_captures(&self) -> usize {
        self.element_captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn microphone(&self, options: &MicrophoneOptions) -> Result<Arc<LocalTrack>> {
        if !self.has_microphone {
            return Err(Error::NoLocalAudio("no input devices".to_string()));
        }
        Ok(Arc::new(LocalTrack::new(
            TrackKind::Audio,
            "fake-microphone",
            TrackOrigin::Microphone {
                device_id: options.device_id.clone(),
            },
        )))
    }

    async fn capture_element(&self, request: &CaptureRequest) -> Result<CapturedStream> {
        self.element_captures.fetch_add(1, Ordering::SeqCst);
        let video = Arc::new(LocalTrack::new(
            TrackKind::Video,
            "fake-element-video",
            TrackOrigin::PlaybackElement,
        ));
        let audio = request.include_audio.then(|| {
            Arc::new(LocalTrack::new(
                TrackKind::Audio,
                "fake-element-audio",
                TrackOrigin::PlaybackElement,
            ))
        });
        Ok(CapturedStream { video, audio })
    }
}

// =============================================================================
// Signaling
// =============================================================================

/// Outbound path that records everything sent
pub struct RecordingSignaling {
    signals: Mutex<Vec<(String, PeerSignal)>>,
    messages: Mutex<Vec<ClientMessage>>,
    tx: mpsc::UnboundedSender<(String, PeerSignal)>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<(String, PeerSignal)>>>,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            signals: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    pub fn signals(&self) -> Vec<(String, PeerSignal)> {
        self.signals.lock().clone()
    }

    /// Offers sent to `peer_id`
    pub fn offers_to(&self, peer_id: &str) -> usize {
        self.signals
            .lock()
            .iter()
            .filter(|(to, s)| to == peer_id && matches!(s, PeerSignal::Offer(_)))
            .count()
    }

    /// Relay messages sent, excluding negotiation payloads
    pub fn messages(&self) -> Vec<ClientMessage> {
        self.messages.lock().clone()
    }

    /// Live stream of negotiation payloads; only the first call gets it
    pub fn take_signal_stream(&self) -> Option<mpsc::UnboundedReceiver<(String, PeerSignal)>> {
        self.rx.lock().take()
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, to: &str, signal: PeerSignal) -> Result<()> {
        self.signals.lock().push((to.to_string(), signal.clone()));
        let _ = self.tx.send((to.to_string(), signal));
        Ok(())
    }
}

impl RelayOutbound for RecordingSignaling {
    fn send_message(&self, message: ClientMessage) -> Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}

/// Answer every offer the manager sends, as a remote peer would
pub fn spawn_auto_answer(
    manager: &Arc<PeerSessionManager>,
    signaling: &RecordingSignaling,
) -> JoinHandle<()> {
    let manager = Arc::downgrade(manager);
    let mut stream = signaling
        .take_signal_stream()
        .expect("signal stream already taken");
    tokio::spawn(async move {
        while let Some((to, signal)) = stream.recv().await {
            let PeerSignal::Offer(sdp) = signal else { continue };
            let Some(manager) = manager.upgrade() else { break };
            let _ = manager
                .handle_signal(&to, PeerSignal::Answer(format!("answer-to-{}", sdp)))
                .await;
        }
    })
}

// =============================================================================
// Decode pipeline and playback element
// =============================================================================

/// Decode buffer that counts appends
pub struct FakeDecodeTarget {
    appends: AtomicUsize,
    bytes: AtomicUsize,
    /// Report enough data once this many appends landed
    pub enough_after: Option<usize>,
    /// Reject every append as undecodable
    pub reject: bool,
    pub duration: Option<f64>,
    buffered: Mutex<Vec<TimeRange>>,
}

impl Default for FakeDecodeTarget {
    fn default() -> Self {
        Self {
            appends: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            enough_after: Some(1),
            reject: false,
            duration: Some(100.0),
            buffered: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDecodeTarget {
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn set_buffered(&self, ranges: Vec<TimeRange>) {
        *self.buffered.lock() = ranges;
    }
}

#[async_trait]
impl DecodeTarget for FakeDecodeTarget {
    async fn append(&self, chunk: Bytes) -> Result<()> {
        if self.reject {
            return Err(Error::DecodeFatal("codec not supported".to_string()));
        }
        self.bytes.fetch_add(chunk.len(), Ordering::SeqCst);
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn buffered(&self) -> Vec<TimeRange> {
        self.buffered.lock().clone()
    }

    fn has_enough_data(&self) -> bool {
        self.enough_after
            .is_some_and(|n| self.appends.load(Ordering::SeqCst) >= n)
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }
}

/// Player with a settable position
pub struct FakeElement {
    position: Mutex<f64>,
    paused: AtomicBool,
    seeks: Mutex<Vec<f64>>,
    plays: AtomicUsize,
    blob: Mutex<Option<String>>,
    /// Delay before a seek completes
    pub seek_delay: Option<Duration>,
}

impl Default for FakeElement {
    fn default() -> Self {
        Self {
            position: Mutex::new(0.0),
            paused: AtomicBool::new(true),
            seeks: Mutex::new(Vec::new()),
            plays: AtomicUsize::new(0),
            blob: Mutex::new(None),
            seek_delay: None,
        }
    }
}

impl FakeElement {
    pub fn set_position(&self, seconds: f64) {
        *self.position.lock() = seconds;
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.seeks.lock().clone()
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    /// Name of the source playing as a blob, if any
    pub fn blob(&self) -> Option<String> {
        self.blob.lock().clone()
    }
}

#[async_trait]
impl PlaybackElement for FakeElement {
    fn current_time(&self) -> f64 {
        *self.position.lock()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn duration(&self) -> Option<f64> {
        Some(100.0)
    }

    async fn play(&self) -> Result<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn seek(&self, time: f64) -> Result<()> {
        if let Some(delay) = self.seek_delay {
            tokio::time::sleep(delay).await;
        }
        self.seeks.lock().push(time);
        *self.position.lock() = time;
        Ok(())
    }

    async fn load_blob(&self, source: Arc<dyn MediaSource>) -> Result<()> {
        *self.blob.lock() = Some(source.name().to_string());
        Ok(())
    }
}

// =============================================================================
// Trusted clock
// =============================================================================

/// Remote clock running `offset_ms` ahead of a shared manual clock
///
/// Each probe takes `one_way_ms` in each direction.
pub struct FakeTimeSource {
    clock: Arc<ManualClock>,
    pub offset_ms: f64,
    one_way_ms: Mutex<Vec<f64>>,
    probes: AtomicUsize,
}

impl FakeTimeSource {
    /// Source whose successive probes take the given one-way delays
    pub fn new(clock: Arc<ManualClock>, offset_ms: f64, one_way_ms: Vec<f64>) -> Self {
        Self {
            clock,
            offset_ms,
            one_way_ms: Mutex::new(one_way_ms),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeSource for FakeTimeSource {
    async fn probe(&self, _client_time: f64) -> Result<f64> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst);
        let one_way = {
            let delays = self.one_way_ms.lock();
            if delays.is_empty() {
                0.0
            } else {
                delays[n % delays.len()]
            }
        };
        self.clock.advance(one_way);
        let remote = self.clock.now_ms() + self.offset_ms;
        self.clock.advance(one_way);
        Ok(remote)
    }
}

// =============================================================================
// Media files
// =============================================================================

fn bmff_box(kind: &[u8; 4], size: usize) -> Vec<u8> {
    let mut b = (size as u32).to_be_bytes().to_vec();
    b.extend_from_slice(kind);
    b.resize(size, 0);
    b
}

/// MP4 layout with the index atom ahead of the media data
pub fn mp4_index_first(total: usize) -> Vec<u8> {
    let mut data = bmff_box(b"ftyp", 24);
    data.extend(bmff_box(b"moov", 64));
    data.extend(bmff_box(b"mdat", total - 24 - 64));
    data
}

/// MP4 layout with the index atom after the media data
pub fn mp4_index_last(total: usize) -> Vec<u8> {
    let mut data = bmff_box(b"ftyp", 24);
    data.extend(bmff_box(b"mdat", total - 24 - 64));
    data.extend(bmff_box(b"moov", 64));
    data
}
