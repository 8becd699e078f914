//! Cross-client playback synchronization
//!
//! Calibrates the local clock against the relay's trusted clock and turns
//! stamped host actions into compensated play, pause and seek operations on
//! the local playback element.

pub mod calibrator;
pub mod clock_model;
pub mod engine;

pub use calibrator::{CalibrationRound, Calibrator, TimeSource};
pub use clock_model::{ClockModel, ClockSample, MAX_CLOCK_SAMPLES};
pub use engine::{DriftReport, PlaybackSyncEngine, SyncEvent, SyncPlan, SyncQuality, SyncStats};
