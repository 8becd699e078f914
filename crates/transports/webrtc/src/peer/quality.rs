//! Connection quality classification and the video encoding ladder
//!
//! Each session is sampled periodically; the resulting class selects the
//! encoding applied to that session's video sender.
//!
//! ```text
//!   TransportStats ──► ConnectionQuality::classify ──► QualityLadder::encoding_for
//!   (rtt, loss)          Excellent/Fast/Medium/Slow      (bitrate cap, downscale)
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Transport statistics sampled for quality classification
#[derive(Debug, Clone)]
pub struct TransportStats {
    /// Round-trip time in milliseconds, if measured yet
    pub rtt_ms: Option<f64>,
    /// Packet loss rate (0.0 - 1.0)
    pub packet_loss_rate: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Timestamp when sampled
    pub sampled_at: Instant,
}

impl Default for TransportStats {
    fn default() -> Self {
        Self {
            rtt_ms: None,
            packet_loss_rate: 0.0,
            jitter_ms: 0.0,
            sampled_at: Instant::now(),
        }
    }
}

impl TransportStats {
    /// Stats with a measured round trip
    pub fn with_rtt(rtt_ms: f64, packet_loss_rate: f64) -> Self {
        Self {
            rtt_ms: Some(rtt_ms),
            packet_loss_rate,
            ..Default::default()
        }
    }
}

/// Connection quality class
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Slow,
    Medium,
    #[default]
    Fast,
    Excellent,
}

impl ConnectionQuality {
    /// Classify from sampled stats
    ///
    /// Thresholds (rtt / loss): excellent < 100ms / 1%, fast < 200ms / 3%,
    /// medium < 400ms / 8%, anything worse is slow. An unmeasured round trip
    /// is judged on loss alone.
    pub fn classify(stats: &TransportStats) -> Self {
        let rtt = stats.rtt_ms.unwrap_or(0.0);
        let loss = stats.packet_loss_rate;

        if rtt < 100.0 && loss < 0.01 {
            ConnectionQuality::Excellent
        } else if rtt < 200.0 && loss < 0.03 {
            ConnectionQuality::Fast
        } else if rtt < 400.0 && loss < 0.08 {
            ConnectionQuality::Medium
        } else {
            ConnectionQuality::Slow
        }
    }
}

/// Encoding parameters applied to a video sender
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoEncoding {
    /// Bitrate cap in kbps
    pub max_bitrate_kbps: u32,
    /// Resolution divisor (1.0 = native)
    pub scale_resolution_down_by: f64,
}

/// Encoding per quality class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityLadder {
    pub excellent: VideoEncoding,
    pub fast: VideoEncoding,
    pub medium: VideoEncoding,
    pub slow: VideoEncoding,
}

impl Default for QualityLadder {
    fn default() -> Self {
        Self {
            excellent: VideoEncoding {
                max_bitrate_kbps: 2500,
                scale_resolution_down_by: 1.0,
            },
            fast: VideoEncoding {
                max_bitrate_kbps: 1500,
                scale_resolution_down_by: 1.0,
            },
            medium: VideoEncoding {
                max_bitrate_kbps: 800,
                scale_resolution_down_by: 1.5,
            },
            slow: VideoEncoding {
                max_bitrate_kbps: 400,
                scale_resolution_down_by: 2.0,
            },
        }
    }
}

impl QualityLadder {
    /// Encoding for a quality class
    pub fn encoding_for(&self, quality: ConnectionQuality) -> VideoEncoding {
        match quality {
            ConnectionQuality::Excellent => self.excellent,
            ConnectionQuality::Fast => self.fast,
            ConnectionQuality::Medium => self.medium,
            ConnectionQuality::Slow => self.slow,
        }
    }

    /// Validate ladder rungs
    ///
    /// Every rung needs a non-zero bitrate and a divisor of at least 1.0,
    /// and bitrates must not increase as quality drops.
    pub fn validate(&self) -> Result<()> {
        let rungs = [
            ("excellent", self.excellent),
            ("fast", self.fast),
            ("medium", self.medium),
            ("slow", self.slow),
        ];
        for (name, rung) in rungs {
            if rung.max_bitrate_kbps == 0 {
                return Err(Error::InvalidConfig(format!(
                    "quality_ladder.{} bitrate must be non-zero",
                    name
                )));
            }
            if rung.scale_resolution_down_by < 1.0 {
                return Err(Error::InvalidConfig(format!(
                    "quality_ladder.{} scale must be >= 1.0, got {}",
                    name, rung.scale_resolution_down_by
                )));
            }
        }
        for pair in rungs.windows(2) {
            if pair[1].1.max_bitrate_kbps > pair[0].1.max_bitrate_kbps {
                return Err(Error::InvalidConfig(format!(
                    "quality_ladder.{} bitrate exceeds quality_ladder.{}",
                    pair[1].0, pair[0].0
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(
            ConnectionQuality::classify(&TransportStats::with_rtt(50.0, 0.0)),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            ConnectionQuality::classify(&TransportStats::with_rtt(150.0, 0.02)),
            ConnectionQuality::Fast
        );
        assert_eq!(
            ConnectionQuality::classify(&TransportStats::with_rtt(300.0, 0.0)),
            ConnectionQuality::Medium
        );
        assert_eq!(
            ConnectionQuality::classify(&TransportStats::with_rtt(50.0, 0.10)),
            ConnectionQuality::Slow
        );
    }

    #[test]
    fn test_unmeasured_rtt_uses_loss() {
        let stats = TransportStats {
            packet_loss_rate: 0.05,
            ..Default::default()
        };
        assert_eq!(ConnectionQuality::classify(&stats), ConnectionQuality::Medium);
    }

    #[test]
    fn test_quality_ordering() {
        assert!(ConnectionQuality::Excellent > ConnectionQuality::Slow);
        assert!(ConnectionQuality::Fast > ConnectionQuality::Medium);
    }

    #[test]
    fn test_ladder_lookup() {
        let ladder = QualityLadder::default();
        assert_eq!(
            ladder.encoding_for(ConnectionQuality::Slow).max_bitrate_kbps,
            400
        );
        assert_eq!(
            ladder
                .encoding_for(ConnectionQuality::Medium)
                .scale_resolution_down_by,
            1.5
        );
    }

    #[test]
    fn test_ladder_validation() {
        assert!(QualityLadder::default().validate().is_ok());

        let mut ladder = QualityLadder::default();
        ladder.slow.max_bitrate_kbps = 0;
        assert!(ladder.validate().is_err());

        let mut ladder = QualityLadder::default();
        ladder.medium.scale_resolution_down_by = 0.5;
        assert!(ladder.validate().is_err());

        let mut ladder = QualityLadder::default();
        ladder.slow.max_bitrate_kbps = 3000;
        assert!(ladder.validate().is_err());
    }
}
