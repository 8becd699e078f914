//! Decode pipeline and playback element seams
//!
//! [`DecodeTarget`] is the incremental decode buffer chunks are appended to.
//! [`PlaybackElement`] is the player whose position the sync engine drives
//! and that can fall back to playing a whole file as an opaque blob.

use super::source::MediaSource;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Buffered media time range in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Incremental decode buffer
#[async_trait]
pub trait DecodeTarget: Send + Sync {
    /// Append one chunk; resolves when the append has completed
    ///
    /// # Errors
    ///
    /// `DecodeFatal` when the pipeline cannot continue with this file.
    async fn append(&self, chunk: Bytes) -> Result<()>;

    /// Media time ranges decoded so far
    fn buffered(&self) -> Vec<TimeRange>;

    /// Whether enough data is buffered to begin playback
    fn has_enough_data(&self) -> bool;

    /// Media duration in seconds once known
    fn duration(&self) -> Option<f64>;
}

/// Player controlled by the sync engine
#[async_trait]
pub trait PlaybackElement: Send + Sync {
    /// Current playback position in seconds
    fn current_time(&self) -> f64;

    fn is_paused(&self) -> bool;

    /// Media duration in seconds once known
    fn duration(&self) -> Option<f64>;

    async fn play(&self) -> Result<()>;

    fn pause(&self);

    /// Jump to `time`; resolves on the seek-completed signal
    async fn seek(&self, time: f64) -> Result<()>;

    /// Play a whole file directly, bypassing the decode buffer
    async fn load_blob(&self, source: Arc<dyn MediaSource>) -> Result<()>;
}
