//! Progressive loader against files on disk

mod harness;

use cinesync_webrtc::config::LoaderConfig;
use cinesync_webrtc::loader::progressive::{BufferTick, ChunkOutcome, LoadStrategy};
use cinesync_webrtc::loader::{
    DecodeTarget, FileSource, LoadOutcome, MediaSource, PlaybackElement, ProgressiveLoader,
    TimeRange,
};
use cinesync_webrtc::Error;
use harness::{
    eventually, init_test_tracing, mp4_index_first, mp4_index_last, FakeDecodeTarget,
    FakeElement,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MIB: usize = 1024 * 1024;

struct Loaded {
    loader: Arc<ProgressiveLoader>,
    target: Arc<FakeDecodeTarget>,
    element: Arc<FakeElement>,
}

async fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

async fn open_file(
    path: &Path,
    target: FakeDecodeTarget,
    config: LoaderConfig,
) -> cinesync_webrtc::Result<Loaded> {
    init_test_tracing();
    let source = Arc::new(FileSource::open(path).await?);
    let target = Arc::new(target);
    let element = Arc::new(FakeElement::default());
    let loader = ProgressiveLoader::open(
        source as Arc<dyn MediaSource>,
        Arc::clone(&target) as Arc<dyn DecodeTarget>,
        Arc::clone(&element) as Arc<dyn PlaybackElement>,
        config,
    )
    .await?;
    Ok(Loaded {
        loader: Arc::new(loader),
        target,
        element,
    })
}

fn fast_buffering() -> LoaderConfig {
    LoaderConfig {
        buffer_check_interval_ms: 10,
        ..LoaderConfig::default()
    }
}

#[tokio::test]
async fn test_file_with_leading_index_starts_after_first_chunk() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "movie.mp4", &mp4_index_first(5 * MIB)).await;

    let l = open_file(&path, FakeDecodeTarget::default(), LoaderConfig::default())
        .await
        .unwrap();
    assert_eq!(l.loader.strategy(), LoadStrategy::Sequential);
    assert_eq!(l.loader.media_file().name, "movie.mp4");
    assert_eq!(l.loader.media_file().total_chunks, 3);

    assert_eq!(l.loader.start().await.unwrap(), LoadOutcome::Ready);
    assert_eq!(l.target.appends(), 1);
    assert_eq!(l.target.bytes(), 2 * MIB);

    let metrics = l.loader.metrics();
    assert_eq!(metrics.chunks_loaded, 1);
    assert_eq!(metrics.buffered_percent, 40.0);
}

#[tokio::test]
async fn test_unrecognized_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "notes.txt", &vec![b'x'; 4096]).await;

    let result = open_file(&path, FakeDecodeTarget::default(), LoaderConfig::default()).await;
    assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
}

#[tokio::test]
async fn test_missing_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let result = open_file(
        &dir.path().join("gone.mp4"),
        FakeDecodeTarget::default(),
        LoaderConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(Error::IoError(_))));
}

#[tokio::test]
async fn test_trailing_index_without_decoder_start_plays_as_blob() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "big.mp4", &mp4_index_last(256 * 1024)).await;
    let mut target = FakeDecodeTarget::default();
    target.enough_after = None;
    let config = LoaderConfig {
        probe_head_bytes: 1024,
        probe_tail_bytes: 1024,
        single_unit_threshold_bytes: 64 * 1024,
        large_chunk_bytes: 16 * 1024,
        ..LoaderConfig::default()
    };

    let l = open_file(&path, target, config).await.unwrap();
    assert_eq!(l.loader.strategy(), LoadStrategy::BoundedLarge);

    let outcome = l.loader.start().await.unwrap();
    assert!(
        matches!(outcome, LoadOutcome::Blob { ref reason } if reason.contains("end of the file"))
    );
    assert_eq!(l.target.appends(), 3);
    assert_eq!(l.element.blob().as_deref(), Some("big.mp4"));

    // Blob playback owns the file from here on
    assert!(l.loader.seek(50.0).await.unwrap().is_empty());
    assert_eq!(l.loader.load_chunk(0).await.unwrap(), ChunkOutcome::Bypassed);
    assert_eq!(l.loader.buffer_tick().await.unwrap(), BufferTick::Exhausted);
}

#[tokio::test]
async fn test_buffer_ticks_fill_the_file_while_playing() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "movie.mp4", &mp4_index_first(5 * MIB)).await;
    let l = open_file(&path, FakeDecodeTarget::default(), LoaderConfig::default())
        .await
        .unwrap();
    l.loader.start().await.unwrap();
    l.element.play().await.unwrap();

    assert_eq!(l.loader.buffer_tick().await.unwrap(), BufferTick::Loaded(1));
    assert_eq!(l.loader.buffer_tick().await.unwrap(), BufferTick::Loaded(2));
    assert_eq!(l.loader.buffer_tick().await.unwrap(), BufferTick::Exhausted);

    let metrics = l.loader.metrics();
    assert_eq!(metrics.chunks_loaded, 3);
    assert_eq!(metrics.buffered_percent, 100.0);
    // Nothing decoded ahead of the playhead during those ticks
    assert_eq!(metrics.stall_count, 1);
}

#[tokio::test]
async fn test_buffer_tick_rests_when_far_enough_ahead() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "movie.mp4", &mp4_index_first(5 * MIB)).await;
    let l = open_file(&path, FakeDecodeTarget::default(), LoaderConfig::default())
        .await
        .unwrap();
    l.loader.start().await.unwrap();
    l.target.set_buffered(vec![TimeRange::new(0.0, 45.0)]);
    l.element.set_position(5.0);

    assert_eq!(l.loader.buffer_tick().await.unwrap(), BufferTick::Satisfied);
    let metrics = l.loader.metrics();
    assert_eq!(metrics.buffer_health, 100);
    assert_eq!(metrics.chunks_loaded, 1);
}

#[tokio::test]
async fn test_background_buffering_waits_for_playback() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "movie.mp4", &mp4_index_first(5 * MIB)).await;
    let l = open_file(&path, FakeDecodeTarget::default(), fast_buffering())
        .await
        .unwrap();
    l.loader.start().await.unwrap();

    let task = l.loader.spawn_background_buffering();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(l.target.appends(), 1);

    l.element.play().await.unwrap();
    let target = Arc::clone(&l.target);
    assert!(eventually(Duration::from_secs(2), || target.appends() == 3).await);
    assert!(eventually(Duration::from_secs(2), || task.is_finished()).await);
}

#[tokio::test]
async fn test_background_buffering_stops_with_the_loader() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "movie.mp4", &mp4_index_first(5 * MIB)).await;
    let l = open_file(&path, FakeDecodeTarget::default(), fast_buffering())
        .await
        .unwrap();
    l.loader.start().await.unwrap();

    let task = l.loader.spawn_background_buffering();
    drop(l.loader);
    assert!(eventually(Duration::from_secs(2), || task.is_finished()).await);
}
