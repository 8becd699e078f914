//! webrtc-rs transport backend
//!
//! Each [`LocalTrack`] maps to one `TrackLocalStaticSample` shared by every
//! peer connection that sends it, so a media pump writes a sample once and
//! webrtc-rs fans it out.
//!
//! webrtc-rs cannot reconfigure a live sender, so encodings chosen by
//! quality adaptation are kept as hints per sample track. The encoder feeding
//! a track reads [`RtcTransportFactory::encoding_hint`]: the most
//! conservative encoding any peer receiving that track currently needs.

use super::quality::{TransportStats, VideoEncoding};
use super::track::{LocalTrack, SenderId, TrackKind, TrackRole};
use super::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory, TransportState};
use crate::config::PeerConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Sample tracks keyed by local track id
type SampleTracks = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;

/// Encoding hints keyed by local track id, one per sender carrying the track
type EncodingHints = Arc<Mutex<HashMap<String, HashMap<SenderId, VideoEncoding>>>>;

/// Builds webrtc-rs peer connections
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    sample_tracks: SampleTracks,
    encoding_hints: EncodingHints,
}

impl RtcTransportFactory {
    /// Create a factory with the STUN/TURN servers from config
    pub fn new(config: &PeerConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
            }))
            .collect();

        Self {
            ice_servers,
            sample_tracks: Arc::new(Mutex::new(HashMap::new())),
            encoding_hints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sample track a media pump writes into for this local track
    pub fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        sample_track_for(&self.sample_tracks, track)
    }

    /// Forget sample tracks no longer sent anywhere
    pub fn release_sample_track(&self, track: &LocalTrack) {
        self.sample_tracks.lock().remove(track.id());
    }

    /// Encoding the pump for `track` should produce
    ///
    /// One encoder feeds every peer sending the track, so this is the lowest
    /// bitrate any of them asked for. `None` until a sender gets an encoding.
    pub fn encoding_hint(&self, track: &LocalTrack) -> Option<VideoEncoding> {
        self.encoding_hints
            .lock()
            .get(track.id())?
            .values()
            .copied()
            .min_by_key(|e| e.max_bitrate_kbps)
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn sample_track_for(tracks: &SampleTracks, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    let mut tracks = tracks.lock();
    Arc::clone(tracks.entry(track.id().to_string()).or_insert_with(|| {
        Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            format!("cinesync-{}", track.label()),
        ))
    }))
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    #[instrument(skip(self, events), fields(peer_id = %peer_id))]
    async fn create(&self, peer_id: &str, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let transport = RtcPeerTransport::connect(
            peer_id,
            self.ice_servers.clone(),
            Arc::clone(&self.sample_tracks),
            Arc::clone(&self.encoding_hints),
            events,
        )
        .await?;
        Ok(Arc::new(transport))
    }
}

/// Round-trip time and worst loss from a stats report
///
/// The nominated candidate pair gives the RTT; RTCP receiver reports from
/// the remote side give loss (and an RTT fallback before ICE nominates).
fn summarize_stats<'a>(reports: impl IntoIterator<Item = &'a StatsReportType>) -> (Option<f64>, f64) {
    let mut pair_rtt_ms = None;
    let mut remote_rtt_ms = None;
    let mut loss: f64 = 0.0;

    for stat in reports {
        match stat {
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                pair_rtt_ms = Some(pair.current_round_trip_time * 1000.0);
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                loss = loss.max(remote.fraction_lost);
                if let Some(rtt) = remote.round_trip_time {
                    remote_rtt_ms = Some(rtt * 1000.0);
                }
            }
            _ => {}
        }
    }

    (pair_rtt_ms.or(remote_rtt_ms), loss.clamp(0.0, 1.0))
}

struct RtcSender {
    role: TrackRole,
    track_id: String,
    sender: Arc<RTCRtpSender>,
}

/// One webrtc-rs peer connection
pub struct RtcPeerTransport {
    peer_id: String,
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    state: Arc<RwLock<TransportState>>,
    senders: RwLock<HashMap<SenderId, RtcSender>>,
    sample_tracks: SampleTracks,
    encoding_hints: EncodingHints,
}

impl RtcPeerTransport {
    async fn connect(
        peer_id: &str,
        ice_servers: Vec<RTCIceServer>,
        sample_tracks: SampleTracks,
        encoding_hints: EncodingHints,
        events: TransportEvents,
    ) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Creating peer connection: peer_id={}, connection_id={}, generation={}",
            peer_id,
            connection_id,
            events.generation()
        );

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        let state = Arc::new(RwLock::new(TransportState::New));

        let state_events = events.clone();
        let state_clone = Arc::clone(&state);
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = state_events.clone();
                let state = Arc::clone(&state_clone);
                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => TransportState::New,
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => return,
                    };

                    let mut guard = state.write().await;
                    if *guard != new_state {
                        debug!(
                            "Peer {} transport {:?} -> {:?}",
                            events.peer_id(),
                            *guard,
                            new_state
                        );
                        *guard = new_state;
                        events.emit(TransportEvent::StateChanged(new_state));
                    }
                })
            },
        ));

        let candidate_events = events;
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate
                    .to_json()
                    .map_err(|e| e.to_string())
                    .and_then(|init| serde_json::to_string(&init).map_err(|e| e.to_string()))
                {
                    Ok(json) => events.emit(TransportEvent::IceCandidate(json)),
                    Err(e) => warn!("Dropping local ICE candidate for {}: {}", events.peer_id(), e),
                }
            })
        }));

        Ok(Self {
            peer_id: peer_id.to_string(),
            connection_id,
            peer_connection,
            state,
            senders: RwLock::new(HashMap::new()),
            sample_tracks,
            encoding_hints,
        })
    }

    /// Connection instance id
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn forget_hint(&self, track_id: &str, sender: &SenderId) -> Option<VideoEncoding> {
        let mut hints = self.encoding_hints.lock();
        let per_track = hints.get_mut(track_id)?;
        let removed = per_track.remove(sender);
        if per_track.is_empty() {
            hints.remove(track_id);
        }
        removed
    }

    async fn rtp_sender(&self, sender: &SenderId) -> Result<Arc<RTCRtpSender>> {
        self.senders
            .read()
            .await
            .get(sender)
            .map(|s| Arc::clone(&s.sender))
            .ok_or_else(|| Error::MediaTrackError(format!("unknown sender {}", sender)))
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, role: TrackRole, track: Arc<LocalTrack>) -> Result<SenderId> {
        let sample_track = sample_track_for(&self.sample_tracks, &track);
        let rtp_sender = self
            .peer_connection
            .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add {} track: {}", role, e)))?;

        let sender_id = SenderId::generate();
        self.senders.write().await.insert(
            sender_id.clone(),
            RtcSender {
                role,
                track_id: track.id().to_string(),
                sender: rtp_sender,
            },
        );
        debug!("Added {} track to peer {}", role, self.peer_id);
        Ok(sender_id)
    }

    async fn remove_track(&self, sender: &SenderId) -> Result<()> {
        let removed = self.senders.write().await.remove(sender);
        let Some(removed) = removed else {
            return Err(Error::MediaTrackError(format!("unknown sender {}", sender)));
        };
        self.forget_hint(&removed.track_id, sender);
        self.peer_connection
            .remove_track(&removed.sender)
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to remove {} track: {}", removed.role, e))
            })?;
        debug!("Removed {} track from peer {}", removed.role, self.peer_id);
        Ok(())
    }

    async fn replace_track(&self, sender: &SenderId, track: Arc<LocalTrack>) -> Result<()> {
        let rtp_sender = self.rtp_sender(sender).await?;
        let sample_track = sample_track_for(&self.sample_tracks, &track);
        rtp_sender
            .replace_track(Some(sample_track as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {}", e)))?;

        // The hint follows the sender onto its new track
        if let Some(entry) = self.senders.write().await.get_mut(sender) {
            let previous = std::mem::replace(&mut entry.track_id, track.id().to_string());
            if let Some(encoding) = self.forget_hint(&previous, sender) {
                self.encoding_hints
                    .lock()
                    .entry(entry.track_id.clone())
                    .or_default()
                    .insert(sender.clone(), encoding);
            }
        }
        Ok(())
    }

    async fn set_encoding(&self, sender: &SenderId, encoding: VideoEncoding) -> Result<()> {
        let senders = self.senders.read().await;
        let entry = senders
            .get(sender)
            .ok_or_else(|| Error::MediaTrackError(format!("unknown sender {}", sender)))?;
        self.encoding_hints
            .lock()
            .entry(entry.track_id.clone())
            .or_default()
            .insert(sender.clone(), encoding);
        debug!(
            "Peer {} {} encoding: {}kbps, scale 1/{}",
            self.peer_id, entry.role, encoding.max_bitrate_kbps, encoding.scale_resolution_down_by
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting offer".to_string()))?;

        debug!("Created SDP offer for peer {}", self.peer_id);
        Ok(local_desc.sdp)
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting answer".to_string()))?;

        debug!("Created SDP answer for peer {}", self.peer_id);
        Ok(local_desc.sdp)
    }

    async fn set_remote_answer(&self, answer_sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        if self.peer_connection.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Ok(());
        }
        let Some(pending) = self.peer_connection.pending_local_description().await else {
            return Ok(());
        };

        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.peer_connection
            .set_local_description(rollback)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to roll back offer: {}", e)))?;

        debug!("Rolled back unanswered offer to peer {}", self.peer_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate).map_err(|e| {
            Error::IceCandidateError(format!("Failed to parse ICE candidate: {}", e))
        })?;

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.peer_connection.get_stats().await;
        let (rtt_ms, packet_loss_rate) = summarize_stats(report.reports.values());

        Ok(TransportStats {
            rtt_ms,
            packet_loss_rate,
            jitter_ms: 0.0,
            sampled_at: Instant::now(),
        })
    }

    async fn state(&self) -> TransportState {
        *self.state.read().await
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.peer_id);
        *self.state.write().await = TransportState::Closed;
        let senders: Vec<(SenderId, RtcSender)> = self.senders.write().await.drain().collect();
        for (id, sender) in &senders {
            self.forget_hint(&sender.track_id, id);
        }
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServerConfig;
    use crate::peer::TrackOrigin;
    use webrtc::stats::{RTCStatsType, RemoteInboundRTPStats};

    fn remote_inbound(ssrc: u32, fraction_lost: f64, round_trip_time: Option<f64>) -> StatsReportType {
        StatsReportType::RemoteInboundRTP(RemoteInboundRTPStats {
            timestamp: tokio::time::Instant::now(),
            stats_type: RTCStatsType::RemoteInboundRTP,
            id: format!("remote-inbound-{}", ssrc),
            ssrc,
            kind: "video".to_string(),
            packets_received: 900,
            packets_lost: 100,
            local_id: format!("outbound-{}", ssrc),
            round_trip_time,
            total_round_trip_time: 0.0,
            fraction_lost,
            round_trip_time_measurements: 1,
        })
    }

    async fn transport(factory: &RtcTransportFactory, peer_id: &str) -> Arc<dyn PeerTransport> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        factory
            .create(peer_id, TransportEvents::new(peer_id, 0, tx))
            .await
            .unwrap()
    }

    #[test]
    fn test_ice_servers_from_config() {
        let mut config = PeerConfig::default();
        config.turn_servers.push(TurnServerConfig {
            url: "turn:turn.example.com:3478".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        });
        let factory = RtcTransportFactory::new(&config);
        assert_eq!(factory.ice_servers.len(), 2);
        assert_eq!(factory.ice_servers[1].username, "user");
    }

    #[test]
    fn test_sample_track_shared_per_local_track() {
        let factory = RtcTransportFactory::new(&PeerConfig::default());
        let mic = LocalTrack::silent_audio();
        let a = factory.sample_track(&mic);
        let b = factory.sample_track(&mic);
        assert!(Arc::ptr_eq(&a, &b));

        factory.release_sample_track(&mic);
        let c = factory.sample_track(&mic);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_codec_per_kind() {
        assert_eq!(codec_for(TrackKind::Audio).mime_type, "audio/opus");
        assert_eq!(codec_for(TrackKind::Video).clock_rate, 90000);
    }

    #[test]
    fn test_stats_report_worst_remote_loss() {
        let reports = [
            remote_inbound(1, 0.02, Some(0.120)),
            remote_inbound(2, 0.09, None),
        ];
        let (rtt_ms, loss) = summarize_stats(reports.iter());
        assert_eq!(loss, 0.09);
        assert!((rtt_ms.unwrap() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_without_receiver_reports() {
        let (rtt_ms, loss) = summarize_stats(std::iter::empty());
        assert_eq!(rtt_ms, None);
        assert_eq!(loss, 0.0);
    }

    #[tokio::test]
    async fn test_encoding_hint_follows_most_constrained_peer() {
        let factory = RtcTransportFactory::new(&PeerConfig::default());
        let video = Arc::new(LocalTrack::new(
            TrackKind::Video,
            "movie",
            TrackOrigin::PlaybackElement,
        ));
        assert_eq!(factory.encoding_hint(&video), None);

        let bob = transport(&factory, "bob").await;
        let carol = transport(&factory, "carol").await;
        let to_bob = bob.add_track(TrackRole::Video, Arc::clone(&video)).await.unwrap();
        let to_carol = carol.add_track(TrackRole::Video, Arc::clone(&video)).await.unwrap();

        let fast = VideoEncoding {
            max_bitrate_kbps: 1500,
            scale_resolution_down_by: 1.0,
        };
        let slow = VideoEncoding {
            max_bitrate_kbps: 300,
            scale_resolution_down_by: 2.0,
        };
        bob.set_encoding(&to_bob, fast).await.unwrap();
        carol.set_encoding(&to_carol, slow).await.unwrap();
        assert_eq!(factory.encoding_hint(&video), Some(slow));

        carol.remove_track(&to_carol).await.unwrap();
        assert_eq!(factory.encoding_hint(&video), Some(fast));

        bob.close().await.unwrap();
        carol.close().await.unwrap();
        assert_eq!(factory.encoding_hint(&video), None);
    }

    #[tokio::test]
    async fn test_rollback_of_unanswered_offer() {
        let factory = RtcTransportFactory::new(&PeerConfig::default());
        let transport = transport(&factory, "peer-1").await;

        // Nothing to roll back yet
        transport.rollback().await.unwrap();

        transport
            .add_track(TrackRole::Microphone, LocalTrack::silent_audio())
            .await
            .unwrap();
        transport.create_offer().await.unwrap();
        match transport.rollback().await {
            // Stable again, so a fresh offer can be made
            Ok(()) => {
                let offer = transport.create_offer().await.unwrap();
                assert!(offer.contains("m=audio"));
            }
            // The session manager answers on a fresh transport instead
            Err(e) => assert!(matches!(e, Error::SdpError(_)), "{}", e),
        }
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_contains_added_tracks() {
        let factory = RtcTransportFactory::new(&PeerConfig::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = factory
            .create("peer-1", TransportEvents::new("peer-1", 0, tx))
            .await
            .unwrap();

        transport
            .add_track(TrackRole::Microphone, LocalTrack::silent_audio())
            .await
            .unwrap();
        let offer = transport.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));

        transport.close().await.unwrap();
        assert_eq!(transport.state().await, TransportState::Closed);
    }
}
