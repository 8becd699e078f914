//! Single-writer append queue
//!
//! One worker task owns the decode target's append side. Callers enqueue a
//! chunk and await its outcome; the next append is not issued until the
//! previous one has completed or failed.

use super::element::DecodeTarget;
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct AppendJob {
    chunk: Bytes,
    done: oneshot::Sender<Result<()>>,
}

/// Serialized appends to one decode target
pub struct AppendQueue {
    tx: mpsc::UnboundedSender<AppendJob>,
    pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl AppendQueue {
    /// Spawn the append worker for `target`
    pub fn new(target: Arc<dyn DecodeTarget>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AppendJob>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = Arc::clone(&pending);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let len = job.chunk.len();
                let result = target.append(job.chunk).await;
                if let Err(e) = &result {
                    warn!("Append of {} bytes failed: {}", len, e);
                } else {
                    debug!("Appended {} bytes", len);
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
                // Caller may have given up waiting
                let _ = job.done.send(result);
            }
        });

        Self {
            tx,
            pending,
            worker,
        }
    }

    /// Queue a chunk and wait for its append to finish
    pub async fn append(&self, chunk: Bytes) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(AppendJob { chunk, done }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::DecodeFatal("append queue closed".to_string()));
        }
        result
            .await
            .map_err(|_| Error::DecodeFatal("append worker stopped".to_string()))?
    }

    /// Appends queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Drop for AppendQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
