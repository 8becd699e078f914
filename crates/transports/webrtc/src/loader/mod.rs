//! Progressive media loader
//!
//! Feeds one local media file into a decode pipeline incrementally,
//! without knowing its index up front. Format and index location are
//! probed from the head and tail of the file; the loading strategy follows
//! from them, with blob playback as the last resort.

pub mod append_queue;
pub mod atom;
pub mod element;
pub mod format;
pub mod metrics;
pub mod progressive;
pub mod source;
pub mod window;

pub use append_queue::AppendQueue;
pub use atom::IndexLocation;
pub use element::{DecodeTarget, PlaybackElement, TimeRange};
pub use format::ContainerFormat;
pub use metrics::LoaderMetrics;
pub use progressive::{
    chunk_size_for, BufferTick, ChunkOutcome, LoadOutcome, LoadStrategy, MediaFile,
    ProgressiveLoader,
};
pub use source::{FileSource, MediaSource, MemorySource};
pub use window::BufferWindow;
