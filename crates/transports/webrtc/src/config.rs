//! Configuration types for the watch-party core

use crate::peer::capture::MicrophoneOptions;
use crate::peer::quality::QualityLadder;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CineSyncConfig {
    /// Peer session settings
    pub peer: PeerConfig,

    /// Progressive loader settings
    pub loader: LoaderConfig,

    /// Playback sync settings
    pub sync: SyncConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Peer session manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum peers in the mesh (default: 10, max: 16)
    pub max_peers: u32,

    /// Delay before the single automatic restart of a failed transport
    pub restart_delay_ms: u64,

    /// Timeout for one offer/answer round (default: 10s, range 2-10s)
    pub negotiation_timeout_ms: u64,

    /// Quality sampling interval
    pub quality_interval_ms: u64,

    /// Microphone health-check interval
    pub health_check_interval_ms: u64,

    /// Target frame rate when capturing the playback element
    pub capture_frame_rate: u32,

    /// Send the movie's own audio alongside the captured video
    pub include_video_audio: bool,

    /// Microphone capture options
    pub microphone: MicrophoneOptions,

    /// Video encoding per connection quality
    pub quality_ladder: QualityLadder,
}

/// Progressive loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Bytes probed at the head of the file for format and index atom
    pub probe_head_bytes: u64,

    /// Bytes probed at the tail of the file for a trailing index atom
    pub probe_tail_bytes: u64,

    /// Files without a leading index below this size load as a single unit
    pub single_unit_threshold_bytes: u64,

    /// Chunk size for bounded loading of large files without a leading index
    pub large_chunk_bytes: u64,

    /// Maximum large chunks tried before falling back to blob playback
    pub max_large_chunks: usize,

    /// Buffered-time-ahead the background buffer tries to keep
    pub target_buffer_secs: f64,

    /// Background buffering check interval
    pub buffer_check_interval_ms: u64,
}

/// Playback sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between calibration rounds (default: 30s)
    pub calibration_interval_ms: u64,

    /// Probes per calibration round (default: 5)
    pub probes_per_calibration: usize,

    /// Per-probe timeout (range 2-10s)
    pub probe_timeout_ms: u64,

    /// Clock samples retained (max 10)
    pub clock_history: usize,

    /// Sync events retained (max 50)
    pub event_history: usize,

    /// Events considered for drift reporting
    pub drift_window: usize,

    /// Position error that triggers a corrective seek
    pub drift_threshold_ms: f64,

    /// Minimum remaining latency compensation worth delaying a start for
    pub start_delay_threshold_ms: f64,

    /// Bound on the wait for a seek-completed signal
    pub seek_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_peers: 10,
            restart_delay_ms: 2000,
            negotiation_timeout_ms: 10_000,
            quality_interval_ms: 5000,
            health_check_interval_ms: 10_000,
            capture_frame_rate: 30,
            include_video_audio: true,
            microphone: MicrophoneOptions::default(),
            quality_ladder: QualityLadder::default(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            probe_head_bytes: 10 * 1024,
            probe_tail_bytes: 2 * 1024 * 1024,
            single_unit_threshold_bytes: 100 * 1024 * 1024,
            large_chunk_bytes: 16 * 1024 * 1024,
            max_large_chunks: 3,
            target_buffer_secs: 30.0,
            buffer_check_interval_ms: 500,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            calibration_interval_ms: 30_000,
            probes_per_calibration: 5,
            probe_timeout_ms: 5000,
            clock_history: 10,
            event_history: 50,
            drift_window: 5,
            drift_threshold_ms: 100.0,
            start_delay_threshold_ms: 5.0,
            seek_timeout_ms: 1000,
        }
    }
}

impl CineSyncConfig {
    /// Parse configuration from TOML, filling omitted fields with defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `max_peers` is not in range 1-16
    /// - `negotiation_timeout_ms` or `probe_timeout_ms` is not in range 2000-10000
    /// - loader chunk sizes or probe sizes are zero
    /// - sync history bounds exceed 10 samples / 50 events
    pub fn validate(&self) -> Result<()> {
        let peer = &self.peer;
        if peer.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }
        if peer.max_peers == 0 || peer.max_peers > 16 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-16, got {}",
                peer.max_peers
            )));
        }
        if !(2000..=10_000).contains(&peer.negotiation_timeout_ms) {
            return Err(Error::InvalidConfig(format!(
                "negotiation_timeout_ms must be in range 2000-10000, got {}",
                peer.negotiation_timeout_ms
            )));
        }
        if peer.capture_frame_rate == 0 || peer.capture_frame_rate > 60 {
            return Err(Error::InvalidConfig(format!(
                "capture_frame_rate must be in range 1-60, got {}",
                peer.capture_frame_rate
            )));
        }
        peer.quality_ladder.validate()?;

        let loader = &self.loader;
        if loader.probe_head_bytes == 0 || loader.probe_tail_bytes == 0 {
            return Err(Error::InvalidConfig(
                "probe sizes must be non-zero".to_string(),
            ));
        }
        if loader.large_chunk_bytes == 0 || loader.max_large_chunks == 0 {
            return Err(Error::InvalidConfig(
                "large chunk size and count must be non-zero".to_string(),
            ));
        }
        if loader.target_buffer_secs <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "target_buffer_secs must be positive, got {}",
                loader.target_buffer_secs
            )));
        }

        let sync = &self.sync;
        if !(2000..=10_000).contains(&sync.probe_timeout_ms) {
            return Err(Error::InvalidConfig(format!(
                "probe_timeout_ms must be in range 2000-10000, got {}",
                sync.probe_timeout_ms
            )));
        }
        if sync.probes_per_calibration == 0 {
            return Err(Error::InvalidConfig(
                "probes_per_calibration must be at least 1".to_string(),
            ));
        }
        if sync.clock_history == 0 || sync.clock_history > 10 {
            return Err(Error::InvalidConfig(format!(
                "clock_history must be in range 1-10, got {}",
                sync.clock_history
            )));
        }
        if sync.event_history == 0 || sync.event_history > 50 {
            return Err(Error::InvalidConfig(format!(
                "event_history must be in range 1-50, got {}",
                sync.event_history
            )));
        }
        if sync.drift_window == 0 || sync.drift_window > sync.event_history {
            return Err(Error::InvalidConfig(format!(
                "drift_window must be in range 1-{}, got {}",
                sync.event_history, sync.drift_window
            )));
        }

        Ok(())
    }

    /// Preset for tight sync on good networks
    ///
    /// Shorter restart delay and faster quality sampling; recalibrates the
    /// clock every 15 seconds.
    ///
    /// # Example
    ///
    /// ```
    /// use cinesync_webrtc::CineSyncConfig;
    ///
    /// let config = CineSyncConfig::low_latency_preset();
    /// assert!(config.validate().is_ok());
    /// assert_eq!(config.sync.calibration_interval_ms, 15_000);
    /// ```
    pub fn low_latency_preset() -> Self {
        let mut config = Self::default();
        config.peer.restart_delay_ms = 1000;
        config.peer.quality_interval_ms = 2000;
        config.peer.negotiation_timeout_ms = 5000;
        config.sync.calibration_interval_ms = 15_000;
        config.sync.probe_timeout_ms = 2000;
        config.loader.target_buffer_secs = 15.0;
        config
    }

    /// Preset for large files on slower links
    ///
    /// Larger buffering target and film-rate (24 fps) capture.
    ///
    /// # Example
    ///
    /// ```
    /// use cinesync_webrtc::CineSyncConfig;
    ///
    /// let config = CineSyncConfig::high_quality_preset();
    /// assert_eq!(config.loader.target_buffer_secs, 60.0);
    /// ```
    pub fn high_quality_preset() -> Self {
        let mut config = Self::default();
        config.peer.capture_frame_rate = 24;
        config.peer.quality_interval_ms = 10_000;
        config.loader.target_buffer_secs = 60.0;
        config
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.peer.turn_servers = turn_servers;
        self
    }

    /// Set the maximum number of peers
    pub fn with_max_peers(mut self, max_peers: u32) -> Self {
        self.peer.max_peers = max_peers;
        self
    }

    /// Set the restart delay for failed transports
    pub fn with_restart_delay_ms(mut self, delay_ms: u64) -> Self {
        self.peer.restart_delay_ms = delay_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CineSyncConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_stun_servers_fails() {
        let mut config = CineSyncConfig::default();
        config.peer.stun_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_max_peers_fails() {
        let mut config = CineSyncConfig::default();
        config.peer.max_peers = 0;
        assert!(config.validate().is_err());

        config.peer.max_peers = 17;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_history_bounds() {
        let mut config = CineSyncConfig::default();
        config.sync.clock_history = 11;
        assert!(config.validate().is_err());

        let mut config = CineSyncConfig::default();
        config.sync.event_history = 51;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_probe_timeout_range() {
        let mut config = CineSyncConfig::default();
        config.sync.probe_timeout_ms = 1000;
        assert!(config.validate().is_err());
        config.sync.probe_timeout_ms = 10_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CineSyncConfig::from_toml_str(
            r#"
            [peer]
            max_peers = 4
            restart_delay_ms = 500

            [sync]
            calibration_interval_ms = 10000
            "#,
        )
        .unwrap();

        assert_eq!(config.peer.max_peers, 4);
        assert_eq!(config.peer.restart_delay_ms, 500);
        assert_eq!(config.sync.calibration_interval_ms, 10_000);
        assert_eq!(config.sync.probes_per_calibration, 5);
        assert_eq!(config.loader.max_large_chunks, 3);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = CineSyncConfig::from_toml_str("[peer]\nmax_peers = 0\n").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_config_serialization() {
        let config = CineSyncConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: CineSyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.peer.stun_servers, deserialized.peer.stun_servers);
        assert_eq!(
            config.loader.large_chunk_bytes,
            deserialized.loader.large_chunk_bytes
        );
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(CineSyncConfig::low_latency_preset().validate().is_ok());
        assert!(CineSyncConfig::high_quality_preset().validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = CineSyncConfig::low_latency_preset()
            .with_max_peers(5)
            .with_restart_delay_ms(10)
            .with_turn_servers(vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "pass".to_string(),
            }]);
        assert!(config.validate().is_ok());
        assert_eq!(config.peer.max_peers, 5);
        assert_eq!(config.peer.restart_delay_ms, 10);
        assert_eq!(config.peer.turn_servers.len(), 1);
    }
}
