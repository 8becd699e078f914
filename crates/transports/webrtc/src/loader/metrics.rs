//! Loader metrics

use serde::Serialize;
use std::time::Duration;

/// Snapshot of loader progress
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderMetrics {
    pub chunks_loaded: usize,
    pub average_chunk_load_ms: f64,
    /// Delivered share of the file, 0 to 100
    pub buffered_percent: f64,
    /// Buffered-time-ahead against the target window, 0 to 100
    pub buffer_health: u8,
    pub stall_count: u32,
    pub seek_count: u32,
}

/// Running counters behind [`LoaderMetrics`]
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    chunks_loaded: usize,
    total_load: Duration,
    stall_count: u32,
    seek_count: u32,
    starved: bool,
}

impl MetricsRecorder {
    pub fn record_chunk(&mut self, elapsed: Duration) {
        self.chunks_loaded += 1;
        self.total_load += elapsed;
    }

    /// Track playback running dry; each entry into starvation is one stall
    pub fn observe_starved(&mut self, starved: bool) {
        if starved && !self.starved {
            self.stall_count += 1;
        }
        self.starved = starved;
    }

    pub fn record_seek(&mut self) {
        self.seek_count += 1;
    }

    pub fn snapshot(&self, buffered_percent: f64, ahead_secs: f64, target_secs: f64) -> LoaderMetrics {
        let average_chunk_load_ms = if self.chunks_loaded == 0 {
            0.0
        } else {
            self.total_load.as_secs_f64() * 1000.0 / self.chunks_loaded as f64
        };

        LoaderMetrics {
            chunks_loaded: self.chunks_loaded,
            average_chunk_load_ms,
            buffered_percent,
            buffer_health: buffer_health(ahead_secs, target_secs),
            stall_count: self.stall_count,
            seek_count: self.seek_count,
        }
    }
}

/// Score buffered-time-ahead against the target, 0 to 100
pub fn buffer_health(ahead_secs: f64, target_secs: f64) -> u8 {
    if target_secs <= 0.0 {
        return 100;
    }
    (ahead_secs / target_secs * 100.0).clamp(0.0, 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_load_time() {
        let mut m = MetricsRecorder::default();
        m.record_chunk(Duration::from_millis(10));
        m.record_chunk(Duration::from_millis(30));
        m.record_seek();
        let snap = m.snapshot(25.0, 15.0, 30.0);
        assert_eq!(snap.chunks_loaded, 2);
        assert!((snap.average_chunk_load_ms - 20.0).abs() < 1e-9);
        assert_eq!(snap.buffer_health, 50);
        assert_eq!(snap.seek_count, 1);
    }

    #[test]
    fn test_stalls_count_rising_edges() {
        let mut m = MetricsRecorder::default();
        m.observe_starved(true);
        m.observe_starved(true);
        m.observe_starved(false);
        m.observe_starved(true);
        assert_eq!(m.snapshot(0.0, 0.0, 30.0).stall_count, 2);
    }

    #[test]
    fn test_buffer_health_clamps() {
        assert_eq!(buffer_health(90.0, 30.0), 100);
        assert_eq!(buffer_health(0.0, 30.0), 0);
        assert_eq!(buffer_health(5.0, 0.0), 100);
    }
}
