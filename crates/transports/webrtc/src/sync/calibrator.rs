//! Clock calibration rounds

use super::clock_model::{ClockModel, ClockSample};
use crate::clock::SharedClock;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Trusted remote clock
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Send a probe stamped with `client_time` (local ms) and resolve to
    /// the remote time (ms) at which it was answered
    async fn probe(&self, client_time: f64) -> Result<f64>;
}

/// Outcome of one calibration round
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRound {
    pub accepted: usize,
    pub skipped: usize,
    pub offset_ms: f64,
    pub latency_ms: f64,
}

/// Runs probe rounds into a shared [`ClockModel`]
pub struct Calibrator {
    clock: SharedClock,
    model: Arc<Mutex<ClockModel>>,
    probes: usize,
    probe_timeout: Duration,
}

impl Calibrator {
    pub fn new(
        clock: SharedClock,
        model: Arc<Mutex<ClockModel>>,
        probes: usize,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            clock,
            model,
            probes,
            probe_timeout,
        }
    }

    /// Issue one round of probes
    ///
    /// Probes that time out or fail are skipped and never enter history.
    ///
    /// # Errors
    ///
    /// `SyncTimeout` when no probe in the round was answered.
    pub async fn run_round(&self, source: &dyn TimeSource) -> Result<CalibrationRound> {
        let mut accepted = 0;
        let mut skipped = 0;

        for n in 0..self.probes {
            let sent = self.clock.now_ms();
            match tokio::time::timeout(self.probe_timeout, source.probe(sent)).await {
                Ok(Ok(remote)) => {
                    let sample = ClockSample::new(sent, remote, self.clock.now_ms());
                    debug!(
                        "Probe {}: rtt={:.1}ms offset={:.1}ms",
                        n,
                        sample.round_trip_time,
                        sample.offset()
                    );
                    self.model.lock().record(sample);
                    accepted += 1;
                }
                Ok(Err(e)) => {
                    warn!("Clock probe {} failed: {}", n, e);
                    skipped += 1;
                }
                Err(_) => {
                    warn!(
                        "Clock probe {} timed out after {:?}, skipping",
                        n, self.probe_timeout
                    );
                    skipped += 1;
                }
            }
        }

        if accepted == 0 && self.probes > 0 {
            return Err(Error::SyncTimeout(format!(
                "none of {} clock probes answered",
                self.probes
            )));
        }

        let model = self.model.lock();
        Ok(CalibrationRound {
            accepted,
            skipped,
            offset_ms: model.offset(),
            latency_ms: model.latency(),
        })
    }
}
