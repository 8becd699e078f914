//! Clock offset and latency estimation
//!
//! Estimates the offset between the local clock and the relay's trusted
//! clock from round-trip probes. Latency is the median round trip over the
//! retained history. The offset is taken from the single sample with the
//! lowest round trip, since that sample's midpoint assumption is the
//! tightest; samples are not averaged.

use serde::Serialize;
use std::collections::VecDeque;

/// Maximum number of samples retained
pub const MAX_CLOCK_SAMPLES: usize = 10;

/// One round-trip probe against the trusted clock (all times in ms)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSample {
    pub round_trip_time: f64,
    pub local_send_time: f64,
    pub remote_time: f64,
    pub local_receive_time: f64,
}

impl ClockSample {
    pub fn new(local_send_time: f64, remote_time: f64, local_receive_time: f64) -> Self {
        Self {
            round_trip_time: local_receive_time - local_send_time,
            local_send_time,
            remote_time,
            local_receive_time,
        }
    }

    /// Offset implied by this sample, assuming a symmetric path
    pub fn offset(&self) -> f64 {
        self.remote_time - (self.local_send_time + self.round_trip_time / 2.0)
    }
}

/// Bounded clock model
#[derive(Debug, Clone)]
pub struct ClockModel {
    capacity: usize,
    samples: VecDeque<ClockSample>,
    offset: f64,
    latency: f64,
}

impl Default for ClockModel {
    fn default() -> Self {
        Self::new(MAX_CLOCK_SAMPLES)
    }
}

impl ClockModel {
    /// Model keeping at most `capacity` samples (clamped to 1..=10)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CLOCK_SAMPLES);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            offset: 0.0,
            latency: 0.0,
        }
    }

    /// Add a sample and recompute offset and latency
    pub fn record(&mut self, sample: ClockSample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.recompute();
    }

    fn recompute(&mut self) {
        let mut rtts: Vec<f64> = self.samples.iter().map(|s| s.round_trip_time).collect();
        self.latency = median(&mut rtts).unwrap_or(0.0);

        if let Some(offset) = self.best_sample().map(ClockSample::offset) {
            self.offset = offset;
        }
    }

    /// Trusted clock minus local clock, in ms
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Median round-trip time, in ms
    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// Sample the current offset was taken from
    pub fn best_sample(&self) -> Option<&ClockSample> {
        // First minimum wins on ties so the estimate is stable
        self.samples.iter().fold(None, |best: Option<&ClockSample>, s| match best {
            Some(b) if b.round_trip_time <= s.round_trip_time => Some(b),
            _ => Some(s),
        })
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ClockSample> {
        self.samples.iter()
    }

    pub fn is_calibrated(&self) -> bool {
        !self.samples.is_empty()
    }

    /// Convert a local timestamp to trusted time
    pub fn trusted_time(&self, local_ms: f64) -> f64 {
        local_ms + self.offset
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        self.samples.clear();
        self.offset = 0.0;
        self.latency = 0.0;
    }
}

/// Median of `values`; sorts in place
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(send: f64, rtt: f64, true_offset: f64) -> ClockSample {
        ClockSample::new(send, send + rtt / 2.0 + true_offset, send + rtt)
    }

    #[test]
    fn test_median_latency_and_min_rtt_offset() {
        let mut model = ClockModel::default();
        // Each sample carries a distinct skew so the chosen one is identifiable
        for (i, rtt) in [40.0, 42.0, 38.0, 41.0, 39.0].into_iter().enumerate() {
            let mut s = sample(1000.0 * i as f64, rtt, 500.0);
            s.remote_time += i as f64;
            model.record(s);
        }
        assert_eq!(model.latency(), 40.0);
        // 38ms sample is index 2
        assert_eq!(model.offset(), 502.0);
        assert_eq!(model.best_sample().map(|s| s.round_trip_time), Some(38.0));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut model = ClockModel::new(50);
        for i in 0..25 {
            model.record(sample(i as f64 * 100.0, 20.0, 0.0));
        }
        assert_eq!(model.sample_count(), MAX_CLOCK_SAMPLES);
    }

    #[test]
    fn test_known_offset_is_recovered() {
        let mut model = ClockModel::default();
        for (i, rtt) in [80.0, 60.0, 95.0, 55.0, 70.0, 65.0].into_iter().enumerate() {
            model.record(sample(10_000.0 + 500.0 * i as f64, rtt, -1234.5));
        }
        assert!((model.offset() - -1234.5).abs() < 1e-6);
        assert_eq!(model.trusted_time(2000.0), 2000.0 - 1234.5);
    }

    #[test]
    fn test_even_median() {
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn test_reset() {
        let mut model = ClockModel::default();
        model.record(sample(0.0, 10.0, 5.0));
        assert!(model.is_calibrated());
        model.reset();
        assert!(!model.is_calibrated());
        assert_eq!(model.offset(), 0.0);
    }
}
