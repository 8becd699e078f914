//! Local time sources
//!
//! Everything that reads "now" goes through [`Clock`] so calibration and
//! sync math can be driven deterministically in tests.

use parking_lot::Mutex;
use std::sync::Arc;

/// Source of local wall-clock time in milliseconds
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch, with sub-millisecond precision
    fn now_ms(&self) -> f64;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by `SystemTime`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
            * 1000.0
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Mutex::new(start_ms),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, ms: f64) {
        *self.now.lock() += ms;
    }

    /// Jump to an absolute time
    pub fn set(&self, ms: f64) {
        *self.now.lock() = ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock()
    }
}
