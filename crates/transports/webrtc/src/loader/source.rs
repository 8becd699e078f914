//! Random-access media input

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Mutex;

/// A local media file readable by byte range
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Display name (usually the file name)
    fn name(&self) -> &str;

    /// Total size in bytes
    fn size(&self) -> u64;

    /// Declared MIME type or file extension, if any
    fn type_hint(&self) -> Option<&str>;

    /// Read `len` bytes starting at `offset`, clamped to the end of the source
    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes>;
}

/// File on local disk
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
    hint: Option<String>,
    file: Mutex<File>,
}

impl FileSource {
    /// Open a file for range reads
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let hint = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());

        Ok(Self {
            path,
            name,
            size,
            hint,
            file: Mutex::new(file),
        })
    }

    /// Path this source reads from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MediaSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn type_hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let len = clamp_len(self.size, offset, len)?;
        let mut buf = BytesMut::zeroed(len as usize);

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }
}

/// In-memory source
///
/// ```
/// use cinesync_webrtc::loader::{MediaSource, MemorySource};
///
/// # tokio_test::block_on(async {
/// let source = MemorySource::new("clip.webm", vec![1u8, 2, 3, 4], None);
/// let bytes = source.read_range(1, 2).await.unwrap();
/// assert_eq!(&bytes[..], &[2u8, 3][..]);
/// assert_eq!(source.read_count(), 1);
/// # });
/// ```
pub struct MemorySource {
    name: String,
    hint: Option<String>,
    data: Bytes,
    reads: AtomicUsize,
    bytes_read: AtomicU64,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>, hint: Option<&str>) -> Self {
        Self {
            name: name.into(),
            hint: hint.map(str::to_string),
            data: data.into(),
            reads: AtomicUsize::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    /// Number of range reads served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Total bytes handed out by range reads
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn type_hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let len = clamp_len(self.size(), offset, len)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.bytes_read.fetch_add(len, Ordering::SeqCst);
        let start = offset as usize;
        Ok(self.data.slice(start..start + len as usize))
    }
}

fn clamp_len(size: u64, offset: u64, len: u64) -> Result<u64> {
    if offset > size {
        return Err(Error::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("offset {} beyond end of {}-byte source", offset, size),
        )));
    }
    Ok(len.min(size - offset))
}
