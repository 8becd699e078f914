//! Delivered byte ranges and buffered-time-ahead

use super::element::TimeRange;
use std::ops::Range;

/// Byte ranges already delivered to the decode buffer
///
/// Ranges are kept sorted and merged. The set never shrinks.
#[derive(Debug, Clone, Default)]
pub struct BufferWindow {
    total: u64,
    ranges: Vec<Range<u64>>,
}

impl BufferWindow {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ranges: Vec::new(),
        }
    }

    /// Record a delivered range
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end < merged.start || r.start > merged.end {
                kept.push(r);
            } else {
                merged = merged.start.min(r.start)..merged.end.max(r.end);
            }
        }
        kept.push(merged);
        kept.sort_by_key(|r| r.start);
        self.ranges = kept;
    }

    /// Whether `range` has been delivered in full
    pub fn contains(&self, range: &Range<u64>) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start <= range.start && r.end >= range.end)
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// Delivered share of the file, 0 to 100
    pub fn buffered_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.delivered_bytes() as f64 / self.total as f64 * 100.0).min(100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.contains(&(0..self.total))
    }
}

/// Seconds buffered contiguously ahead of `position`
pub fn buffered_ahead(ranges: &[TimeRange], position: f64) -> f64 {
    ranges
        .iter()
        .filter(|r| r.contains(position))
        .map(|r| r.end - position)
        .fold(0.0, f64::max)
}
