//! Playback synchronization engine
//!
//! Turns stamped host actions into local playback adjustments:
//!
//! ```text
//!   elapsed             = trusted_now - host_action_time
//!   target_position     = host_position + elapsed          (play)
//!   latency_compensation = latency / 2
//! ```
//!
//! Positions are seconds; clock values are milliseconds.

use super::calibrator::{CalibrationRound, Calibrator, TimeSource};
use super::clock_model::ClockModel;
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::events::{EventBus, Subscription};
use crate::loader::PlaybackElement;
use crate::signaling::protocol::{MovieAction, MovieState};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// One applied sync action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub action: MovieAction,
    /// Position the element was driven to, in seconds
    pub target_time: f64,
    /// Trusted time when the action was applied, in ms
    pub trusted_time: f64,
    /// Local position minus target before correction, in ms
    pub drift: f64,
    /// Estimated one-way latency uncertainty, in ms
    pub accuracy: f64,
}

/// Sync quality bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncQuality {
    Excellent,
    Good,
    Fair,
}

/// Drift over the most recent sync events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub average_drift: f64,
    pub average_accuracy: f64,
    pub needs_correction: bool,
    pub quality: SyncQuality,
    pub samples: usize,
}

impl DriftReport {
    /// Summarize `events` against a correction threshold in ms
    pub fn from_events<'a>(
        events: impl IntoIterator<Item = &'a SyncEvent>,
        threshold_ms: f64,
    ) -> Self {
        let (mut drift, mut accuracy, mut samples) = (0.0, 0.0, 0usize);
        for e in events {
            drift += e.drift.abs();
            accuracy += e.accuracy;
            samples += 1;
        }
        let (average_drift, average_accuracy) = if samples == 0 {
            (0.0, 0.0)
        } else {
            (drift / samples as f64, accuracy / samples as f64)
        };

        let quality = if average_drift < 50.0 {
            SyncQuality::Excellent
        } else if average_drift < 100.0 {
            SyncQuality::Good
        } else {
            SyncQuality::Fair
        };

        Self {
            average_drift,
            average_accuracy,
            needs_correction: average_drift > threshold_ms,
            quality,
            samples,
        }
    }
}

/// Snapshot of the engine's clock and drift state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub offset_ms: f64,
    pub latency_ms: f64,
    pub clock_samples: usize,
    pub events: usize,
    pub drift: DriftReport,
}

/// Computed targets for a host action
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPlan {
    /// Trusted time since the host acted, in ms
    pub elapsed_ms: f64,
    /// Position the host is at now, in seconds
    pub target_position: f64,
    /// Half the measured round trip, in ms
    pub latency_compensation_ms: f64,
}

impl SyncPlan {
    /// Remaining wait before starting playback, if worth waiting for
    pub fn start_delay(&self, threshold_ms: f64) -> Option<Duration> {
        let wait = self.latency_compensation_ms - self.elapsed_ms;
        (wait > threshold_ms).then(|| Duration::from_micros((wait * 1000.0).round() as u64))
    }
}

/// Keeps the local element in lock-step with the host
pub struct PlaybackSyncEngine {
    config: SyncConfig,
    clock: SharedClock,
    element: Arc<dyn PlaybackElement>,
    model: Arc<Mutex<ClockModel>>,
    calibrator: Calibrator,
    history: Mutex<VecDeque<SyncEvent>>,
    events: EventBus<SyncEvent>,
}

impl PlaybackSyncEngine {
    pub fn new(config: SyncConfig, clock: SharedClock, element: Arc<dyn PlaybackElement>) -> Self {
        let model = Arc::new(Mutex::new(ClockModel::new(config.clock_history)));
        let calibrator = Calibrator::new(
            Arc::clone(&clock),
            Arc::clone(&model),
            config.probes_per_calibration,
            Duration::from_millis(config.probe_timeout_ms),
        );
        Self {
            config,
            clock,
            element,
            model,
            calibrator,
            history: Mutex::new(VecDeque::new()),
            events: EventBus::new(),
        }
    }

    /// Run one calibration round against `source`
    pub async fn calibrate(&self, source: &dyn TimeSource) -> Result<CalibrationRound> {
        let round = self.calibrator.run_round(source).await?;
        info!(
            "Clock calibrated: offset={:.1}ms latency={:.1}ms ({} probes, {} skipped)",
            round.offset_ms, round.latency_ms, round.accepted, round.skipped
        );
        Ok(round)
    }

    /// Recalibrate on the configured interval, starting immediately
    pub fn spawn_calibration(self: &Arc<Self>, source: Arc<dyn TimeSource>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.calibration_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else { break };
                if let Err(e) = engine.calibrate(source.as_ref()).await {
                    warn!("Calibration round failed: {}", e);
                }
            }
        })
    }

    /// Local time adjusted by the calibrated offset, in ms
    pub fn trusted_now(&self) -> f64 {
        self.model.lock().trusted_time(self.clock.now_ms())
    }

    pub fn offset_ms(&self) -> f64 {
        self.model.lock().offset()
    }

    pub fn latency_ms(&self) -> f64 {
        self.model.lock().latency()
    }

    pub fn is_calibrated(&self) -> bool {
        self.model.lock().is_calibrated()
    }

    /// Compute targets for a host action stamped at `host_action_time`
    pub fn plan(&self, host_action_time: f64, host_position: f64) -> SyncPlan {
        let elapsed_ms = self.trusted_now() - host_action_time;
        SyncPlan {
            elapsed_ms,
            target_position: host_position + elapsed_ms / 1000.0,
            latency_compensation_ms: self.latency_ms() / 2.0,
        }
    }

    /// Subscribe to applied sync events
    pub fn subscribe(&self) -> Subscription<SyncEvent> {
        self.events.subscribe()
    }

    /// Jump the element, bounded by the seek timeout
    async fn seek_element(&self, position: f64) -> Result<()> {
        let timeout = Duration::from_millis(self.config.seek_timeout_ms);
        match tokio::time::timeout(timeout, self.element.seek(position)).await {
            Ok(result) => result,
            Err(_) => Err(Error::SyncTimeout(format!(
                "seek to {:.3}s did not complete within {:?}",
                position, timeout
            ))),
        }
    }

    fn exceeds_threshold(&self, drift_ms: f64) -> bool {
        drift_ms.abs() > self.config.drift_threshold_ms
    }

    /// Start playback in step with a host play action
    #[instrument(skip(self))]
    pub async fn play(&self, host_action_time: f64, host_position: f64) -> Result<SyncEvent> {
        let plan = self.plan(host_action_time, host_position);
        let drift = (self.element.current_time() - plan.target_position) * 1000.0;

        if self.exceeds_threshold(drift) {
            debug!("Drift {:.1}ms, jumping to {:.3}s", drift, plan.target_position);
            if let Err(e) = self.seek_element(plan.target_position).await {
                warn!("Correction seek before play failed: {}", e);
            }
        }

        if let Some(delay) = plan.start_delay(self.config.start_delay_threshold_ms) {
            debug!("Delaying start by {:?} for latency compensation", delay);
            tokio::time::sleep(delay).await;
        }

        self.element.play().await?;
        Ok(self.record(MovieAction::Play, plan.target_position, drift))
    }

    /// Pause and settle on the host's position
    #[instrument(skip(self))]
    pub async fn pause(&self, host_action_time: f64, host_position: f64) -> Result<SyncEvent> {
        self.element.pause();
        let drift = (self.element.current_time() - host_position) * 1000.0;

        if self.exceeds_threshold(drift) {
            debug!("Paused {:.1}ms off host, correcting", drift);
            if let Err(e) = self.seek_element(host_position).await {
                warn!("Correction seek after pause failed: {}", e);
            }
        }
        Ok(self.record(MovieAction::Pause, host_position, drift))
    }

    /// Jump to exactly the host's position
    ///
    /// # Errors
    ///
    /// `SyncTimeout` if the seek-completed signal does not arrive in time.
    #[instrument(skip(self))]
    pub async fn seek(&self, host_position: f64) -> Result<SyncEvent> {
        self.seek_element(host_position).await?;
        let drift = (self.element.current_time() - host_position) * 1000.0;
        Ok(self.record(MovieAction::Seek, host_position, drift))
    }

    /// Apply a stamped movie-sync broadcast
    ///
    /// Streaming start/stop carry no playback adjustment and return `None`.
    pub async fn apply(
        &self,
        action: MovieAction,
        state: &MovieState,
        precision_timestamp: f64,
    ) -> Result<Option<SyncEvent>> {
        let position = state.current_time;
        let event = match action {
            MovieAction::Play => self.play(precision_timestamp, position).await?,
            MovieAction::Pause => self.pause(precision_timestamp, position).await?,
            MovieAction::Seek => self.seek(position).await?,
            MovieAction::Sync if state.is_playing => {
                let mut event = self.play(precision_timestamp, position).await?;
                event.action = MovieAction::Sync;
                event
            }
            MovieAction::Sync => {
                let mut event = self.pause(precision_timestamp, position).await?;
                event.action = MovieAction::Sync;
                event
            }
            MovieAction::StartStreaming | MovieAction::StopStreaming => return Ok(None),
        };
        Ok(Some(event))
    }

    fn record(&self, action: MovieAction, target_time: f64, drift: f64) -> SyncEvent {
        let event = SyncEvent {
            action,
            target_time,
            trusted_time: self.trusted_now(),
            drift,
            accuracy: self.latency_ms() / 2.0,
        };
        self.push_event(event.clone());
        self.events.emit(event.clone());
        event
    }

    pub(crate) fn push_event(&self, event: SyncEvent) {
        let mut history = self.history.lock();
        if history.len() >= self.config.event_history.max(1) {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Retained sync events, oldest first
    pub fn history(&self) -> Vec<SyncEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// Drift over the last few events
    pub fn drift_report(&self) -> DriftReport {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(self.config.drift_window);
        DriftReport::from_events(history.iter().skip(skip), self.config.drift_threshold_ms)
    }

    pub fn sync_stats(&self) -> SyncStats {
        let (offset_ms, latency_ms, clock_samples) = {
            let model = self.model.lock();
            (model.offset(), model.latency(), model.sample_count())
        };
        SyncStats {
            offset_ms,
            latency_ms,
            clock_samples,
            events: self.history.lock().len(),
            drift: self.drift_report(),
        }
    }

    /// Forget clock samples and sync history
    pub fn reset(&self) {
        self.model.lock().reset();
        self.history.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(drift: f64) -> SyncEvent {
        SyncEvent {
            action: MovieAction::Play,
            target_time: 0.0,
            trusted_time: 0.0,
            drift,
            accuracy: 10.0,
        }
    }

    #[test]
    fn test_drift_report_excellent() {
        let events: Vec<_> = [20.0, 30.0, 25.0, 40.0, 35.0].map(event).to_vec();
        let report = DriftReport::from_events(&events, 100.0);
        assert_eq!(report.quality, SyncQuality::Excellent);
        assert!(!report.needs_correction);
        assert!((report.average_drift - 30.0).abs() < 1e-9);
        assert_eq!(report.samples, 5);
    }

    #[test]
    fn test_drift_report_buckets() {
        let good: Vec<_> = [60.0, -80.0].map(event).to_vec();
        assert_eq!(DriftReport::from_events(&good, 100.0).quality, SyncQuality::Good);

        let fair: Vec<_> = [150.0, -120.0].map(event).to_vec();
        let report = DriftReport::from_events(&fair, 100.0);
        assert_eq!(report.quality, SyncQuality::Fair);
        assert!(report.needs_correction);
    }

    #[test]
    fn test_start_delay() {
        let plan = SyncPlan {
            elapsed_ms: 5.0,
            target_position: 10.0,
            latency_compensation_ms: 25.0,
        };
        assert_eq!(plan.start_delay(5.0), Some(Duration::from_millis(20)));

        let late = SyncPlan {
            elapsed_ms: 24.0,
            ..plan
        };
        assert_eq!(late.start_delay(5.0), None);
    }
}
