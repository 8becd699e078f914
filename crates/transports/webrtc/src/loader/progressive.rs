//! Progressive loading of one local media file
//!
//! ```text
//!            probe head + tail
//!                   │
//!          ┌────────┴─────────┐
//!   index-at-start      index-at-end / not-found
//!          │              │                 │
//!     Sequential     size < threshold   size >= threshold
//!   (chunks from 0)   SingleUnit        BoundedLarge (≤ N large chunks)
//!          │              │                 │
//!          └──────── DecodeFatal / never enough data ──► Blob
//! ```

use super::append_queue::AppendQueue;
use super::atom::{locate_index, IndexLocation};
use super::element::{DecodeTarget, PlaybackElement};
use super::format::{detect, ContainerFormat};
use super::metrics::{LoaderMetrics, MetricsRecorder};
use super::source::MediaSource;
use super::window::{buffered_ahead, BufferWindow};
use crate::config::LoaderConfig;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Chunk size used for sequential and on-demand loading
pub fn chunk_size_for(size: u64) -> u64 {
    if size <= 256 * MIB {
        2 * MIB
    } else if size <= 2 * GIB {
        4 * MIB
    } else {
        8 * MIB
    }
}

/// Probed description of the file being loaded
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub name: String,
    pub size: u64,
    pub format: ContainerFormat,
    pub index: IndexLocation,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

impl MediaFile {
    fn new(name: String, size: u64, format: ContainerFormat, index: IndexLocation) -> Self {
        let chunk_size = chunk_size_for(size);
        Self {
            name,
            size,
            format,
            index,
            chunk_size,
            total_chunks: size.div_ceil(chunk_size),
        }
    }

    /// Byte range of chunk `index`
    pub fn chunk_range(&self, index: u64) -> Range<u64> {
        let start = (index * self.chunk_size).min(self.size);
        start..(start + self.chunk_size).min(self.size)
    }

    /// Chunk holding media time `time`, given the total duration
    pub fn chunk_for_time(&self, time: f64, duration: f64) -> u64 {
        if duration <= 0.0 || self.total_chunks == 0 {
            return 0;
        }
        let fraction = (time / duration).clamp(0.0, 1.0);
        ((fraction * self.total_chunks as f64).floor() as u64).min(self.total_chunks - 1)
    }
}

/// How the file is fed to the decode target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadStrategy {
    /// Chunked append from byte 0
    Sequential,
    /// Whole file appended at once
    SingleUnit,
    /// A few large leading chunks, hoping the decoder can start
    BoundedLarge,
    /// File handed to the playback element as an opaque blob
    Blob,
}

/// Result of the initial load
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Decode target has enough data to start playback
    Ready,
    /// Entire file delivered to the decode target
    Complete,
    /// Playback fell back to the opaque blob path
    Blob { reason: String },
}

/// Result of requesting one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Loaded,
    AlreadyLoaded,
    InFlight,
    /// Index past the last chunk
    OutOfRange,
    /// Loading is bypassed in blob mode
    Bypassed,
}

/// Result of one background buffering check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTick {
    /// Buffered-time-ahead already meets the target
    Satisfied,
    /// Loaded the given chunk
    Loaded(u64),
    /// Nothing left to load
    Exhausted,
}

#[derive(Default)]
struct ChunkTable {
    loaded: HashSet<u64>,
    in_flight: HashSet<u64>,
}

/// Feeds a local media file to a decode target in chunks
pub struct ProgressiveLoader {
    config: LoaderConfig,
    file: MediaFile,
    source: Arc<dyn MediaSource>,
    target: Arc<dyn DecodeTarget>,
    element: Arc<dyn PlaybackElement>,
    queue: AppendQueue,
    strategy: Mutex<LoadStrategy>,
    window: Mutex<BufferWindow>,
    chunks: Mutex<ChunkTable>,
    metrics: Mutex<MetricsRecorder>,
}

/// Last `tail_len` bytes of the source, reading only what `head` lacks
async fn read_tail(source: &dyn MediaSource, head: &Bytes, tail_len: u64) -> Result<Bytes> {
    let size = source.size();
    let start = size - tail_len;
    let covered = head.len() as u64;
    if start >= covered {
        return source.read_range(start, tail_len).await;
    }

    let overlap = head.slice(start as usize..);
    if covered >= size {
        return Ok(overlap);
    }
    let rest = source.read_range(covered, size - covered).await?;
    let mut tail = BytesMut::with_capacity(overlap.len() + rest.len());
    tail.extend_from_slice(&overlap);
    tail.extend_from_slice(&rest);
    Ok(tail.freeze())
}

impl ProgressiveLoader {
    /// Probe the file and choose a loading strategy
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` if the container can't be identified.
    #[instrument(skip_all, fields(file = %source.name()))]
    pub async fn open(
        source: Arc<dyn MediaSource>,
        target: Arc<dyn DecodeTarget>,
        element: Arc<dyn PlaybackElement>,
        config: LoaderConfig,
    ) -> Result<Self> {
        let size = source.size();
        if size == 0 {
            return Err(Error::UnsupportedFormat(format!(
                "{} is empty",
                source.name()
            )));
        }

        let head = source.read_range(0, config.probe_head_bytes.min(size)).await?;
        let tail = read_tail(source.as_ref(), &head, config.probe_tail_bytes.min(size)).await?;

        let format = detect(&head, source.type_hint())?;
        let index = locate_index(format, &head, &tail);
        let file = MediaFile::new(source.name().to_string(), size, format, index);

        let strategy = match index {
            IndexLocation::Start => LoadStrategy::Sequential,
            _ if size < config.single_unit_threshold_bytes => LoadStrategy::SingleUnit,
            _ => LoadStrategy::BoundedLarge,
        };

        info!(
            "Opened {} ({} bytes, {}, {:?}): {:?}, {} chunks of {} bytes",
            file.name, size, format, index, strategy, file.total_chunks, file.chunk_size
        );

        let queue = AppendQueue::new(Arc::clone(&target));
        Ok(Self {
            config,
            file,
            source,
            target,
            element,
            queue,
            strategy: Mutex::new(strategy),
            window: Mutex::new(BufferWindow::new(size)),
            chunks: Mutex::new(ChunkTable::default()),
            metrics: Mutex::new(MetricsRecorder::default()),
        })
    }

    pub fn media_file(&self) -> &MediaFile {
        &self.file
    }

    pub fn strategy(&self) -> LoadStrategy {
        *self.strategy.lock()
    }

    pub fn is_blob(&self) -> bool {
        self.strategy() == LoadStrategy::Blob
    }

    /// Run the initial load for the chosen strategy
    ///
    /// Decode failures fall back to blob playback; only a failing blob
    /// fallback is returned as an error.
    #[instrument(skip(self), fields(file = %self.file.name))]
    pub async fn start(&self) -> Result<LoadOutcome> {
        let result = match self.strategy() {
            LoadStrategy::Sequential => self.load_sequential().await,
            LoadStrategy::SingleUnit => self.load_single_unit().await,
            LoadStrategy::BoundedLarge => self.load_bounded_large().await,
            LoadStrategy::Blob => return Ok(LoadOutcome::Blob {
                reason: "blob playback already selected".to_string(),
            }),
        };

        match result {
            Err(Error::DecodeFatal(reason)) => self.fall_back_to_blob(reason).await,
            other => other,
        }
    }

    async fn load_sequential(&self) -> Result<LoadOutcome> {
        for index in 0..self.file.total_chunks {
            self.load_chunk(index).await?;
            if self.target.has_enough_data() {
                debug!("Enough data after chunk {}", index);
                return Ok(LoadOutcome::Ready);
            }
        }
        Ok(LoadOutcome::Complete)
    }

    async fn load_single_unit(&self) -> Result<LoadOutcome> {
        self.deliver(0..self.file.size).await?;
        let mut chunks = self.chunks.lock();
        chunks.loaded.extend(0..self.file.total_chunks);
        Ok(LoadOutcome::Complete)
    }

    async fn load_bounded_large(&self) -> Result<LoadOutcome> {
        let large = self.config.large_chunk_bytes.max(1);
        for attempt in 0..self.config.max_large_chunks as u64 {
            let start = attempt * large;
            if start >= self.file.size {
                break;
            }
            let range = start..(start + large).min(self.file.size);

            if let Err(e) = self.deliver(range).await {
                warn!("Large chunk {} failed: {}", attempt, e);
                return Err(Error::DecodeFatal(self.index_hint(&e.to_string())));
            }
            if self.target.has_enough_data() {
                info!("Decoder started after {} large chunk(s)", attempt + 1);
                return Ok(LoadOutcome::Ready);
            }
        }
        Err(Error::DecodeFatal(self.index_hint(&format!(
            "not enough data after {} large chunk(s)",
            self.config.max_large_chunks
        ))))
    }

    fn index_hint(&self, detail: &str) -> String {
        match self.file.index {
            IndexLocation::End => format!("{}; moov atom is at the end of the file", detail),
            IndexLocation::NotFound => format!("{}; no index atom found", detail),
            IndexLocation::Start => detail.to_string(),
        }
    }

    async fn fall_back_to_blob(&self, reason: String) -> Result<LoadOutcome> {
        warn!("Falling back to blob playback: {}", reason);
        *self.strategy.lock() = LoadStrategy::Blob;
        self.element
            .load_blob(Arc::clone(&self.source))
            .await
            .map_err(|e| {
                Error::DecodeFatal(format!("{}; blob playback also failed: {}", reason, e))
            })?;
        Ok(LoadOutcome::Blob { reason })
    }

    /// Read a byte range and append it through the single-writer queue
    async fn deliver(&self, range: Range<u64>) -> Result<()> {
        let started = Instant::now();
        let data = self
            .source
            .read_range(range.start, range.end - range.start)
            .await?;
        self.queue.append(data).await?;
        self.window.lock().insert(range);
        self.metrics.lock().record_chunk(started.elapsed());
        Ok(())
    }

    /// Load chunk `index` unless it's already loaded or in flight
    #[instrument(skip(self))]
    pub async fn load_chunk(&self, index: u64) -> Result<ChunkOutcome> {
        if self.is_blob() {
            return Ok(ChunkOutcome::Bypassed);
        }
        if index >= self.file.total_chunks {
            return Ok(ChunkOutcome::OutOfRange);
        }
        let range = self.file.chunk_range(index);

        {
            let mut chunks = self.chunks.lock();
            if chunks.loaded.contains(&index) || self.window.lock().contains(&range) {
                chunks.loaded.insert(index);
                return Ok(ChunkOutcome::AlreadyLoaded);
            }
            if !chunks.in_flight.insert(index) {
                return Ok(ChunkOutcome::InFlight);
            }
        }

        let result = self.deliver(range).await;

        let mut chunks = self.chunks.lock();
        chunks.in_flight.remove(&index);
        result?;
        chunks.loaded.insert(index);
        Ok(ChunkOutcome::Loaded)
    }

    /// Load the chunk holding `time` and its immediate neighbors
    #[instrument(skip(self))]
    pub async fn seek(&self, time: f64) -> Result<Vec<(u64, ChunkOutcome)>> {
        self.metrics.lock().record_seek();
        if self.is_blob() {
            return Ok(Vec::new());
        }

        let Some(duration) = self.duration() else {
            debug!("Seek before duration is known, nothing to prefetch");
            return Ok(Vec::new());
        };
        let center = self.file.chunk_for_time(time, duration);
        let first = center.saturating_sub(1);
        let last = (center + 1).min(self.file.total_chunks.saturating_sub(1));

        let mut outcomes = Vec::new();
        for index in first..=last {
            match self.load_chunk(index).await {
                Ok(outcome) => outcomes.push((index, outcome)),
                Err(Error::DecodeFatal(reason)) => {
                    self.fall_back_to_blob(reason).await?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    fn duration(&self) -> Option<f64> {
        self.target
            .duration()
            .or_else(|| self.element.duration())
            .filter(|d| *d > 0.0)
    }

    fn ahead(&self) -> f64 {
        buffered_ahead(&self.target.buffered(), self.element.current_time())
    }

    /// One background buffering step
    pub async fn buffer_tick(&self) -> Result<BufferTick> {
        if self.is_blob() || self.window.lock().is_complete() {
            return Ok(BufferTick::Exhausted);
        }

        let ahead = self.ahead();
        let playing = !self.element.is_paused();
        self.metrics.lock().observe_starved(playing && ahead <= 0.0);
        if ahead >= self.config.target_buffer_secs {
            return Ok(BufferTick::Satisfied);
        }

        let from = self
            .duration()
            .map(|d| self.file.chunk_for_time(self.element.current_time(), d))
            .unwrap_or(0);
        let next = {
            let chunks = self.chunks.lock();
            (from..self.file.total_chunks)
                .find(|i| !chunks.loaded.contains(i) && !chunks.in_flight.contains(i))
        };
        let Some(index) = next else {
            return Ok(BufferTick::Exhausted);
        };

        match self.load_chunk(index).await {
            Ok(_) => Ok(BufferTick::Loaded(index)),
            Err(Error::DecodeFatal(reason)) => {
                self.fall_back_to_blob(reason).await?;
                Ok(BufferTick::Exhausted)
            }
            Err(e) => Err(e),
        }
    }

    /// Keep buffering ahead of the playhead while playing
    ///
    /// The task ends when the file is exhausted or the loader is dropped.
    pub fn spawn_background_buffering(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.buffer_check_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(loader) = weak.upgrade() else { break };
                if loader.element.is_paused() {
                    continue;
                }
                match loader.buffer_tick().await {
                    Ok(BufferTick::Exhausted) => {
                        debug!("Background buffering finished");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Background buffering step failed: {}", e),
                }
            }
        })
    }

    /// Current loader metrics
    pub fn metrics(&self) -> LoaderMetrics {
        let percent = self.window.lock().buffered_percent();
        let ahead = self.ahead();
        self.metrics
            .lock()
            .snapshot(percent, ahead, self.config.target_buffer_secs)
    }
}
