//! Side copies of intermediate XML.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Chunks a snapshot may fall behind the stream it copies.
pub const SNAPSHOT_CAPACITY: usize = 256;

/// A best-effort copy of a byte stream into a file.
///
/// Opening or writing the file never fails the stream being copied: the
/// first error is logged and the rest of the copy is dropped. A snapshot
/// whose file cannot keep up with the stream is abandoned and its partial
/// file removed.
#[derive(Debug)]
pub struct Snapshot {
    tx: Option<mpsc::Sender<Bytes>>,
    abandoned: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Snapshot {
    /// Start copying into `path`. Must be called inside a tokio runtime.
    pub fn create(path: PathBuf) -> Self {
        Self::with_capacity(path, SNAPSHOT_CAPACITY)
    }

    pub(crate) fn with_capacity(path: PathBuf, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = abandoned.clone();
        let task = tokio::spawn(async move {
            let mut file = match tokio::fs::File::create(&path).await {
                Ok(file) => file,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot create snapshot, skipping");
                    return;
                }
            };
            let mut written = 0u64;
            while let Some(chunk) = rx.recv().await {
                if let Err(err) = file.write_all(&chunk).await {
                    warn!(path = %path.display(), error = %err, "snapshot write failed, dropping the rest");
                    return;
                }
                written += chunk.len() as u64;
            }
            if flag.load(Ordering::Acquire) {
                drop(file);
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %err, "cannot remove abandoned snapshot");
                }
                return;
            }
            if let Err(err) = file.flush().await {
                warn!(path = %path.display(), error = %err, "snapshot flush failed");
                return;
            }
            debug!(path = %path.display(), bytes = written, "snapshot written");
        });
        Self {
            tx: Some(tx),
            abandoned,
            task,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let Some(tx) = &self.tx else { return };
        if chunk.is_empty() {
            return;
        }
        match tx.try_send(Bytes::copy_from_slice(chunk)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("snapshot writer fell behind, dropping snapshot");
                self.abandoned.store(true, Ordering::Release);
                self.tx = None;
            }
            // The receiver is gone only after a logged failure.
            Err(TrySendError::Closed(_)) => self.tx = None,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Wait for everything pushed so far to reach the file.
    pub async fn finish(self) {
        let Snapshot { tx, task, .. } = self;
        drop(tx);
        if let Err(err) = task.await {
            warn!(error = %err, "snapshot task failed");
        }
    }
}

/// Snapshot path for an XML stage boundary: `<stem>.xml` next to `path`.
pub fn snapshot_path(path: &Path) -> PathBuf {
    let mut stem = path.file_stem().unwrap_or(path.as_os_str()).to_os_string();
    stem.push(".xml");
    path.with_file_name(stem)
}

/// Writer that copies everything written through it into a [`Snapshot`].
#[derive(Debug)]
pub struct TeeWriter<W> {
    inner: W,
    snapshot: Option<Snapshot>,
}

impl<W> TeeWriter<W> {
    pub fn new(inner: W, snapshot: Option<Snapshot>) -> Self {
        Self { inner, snapshot }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Finish the snapshot and hand back the inner writer.
    pub async fn finish(self) -> W {
        if let Some(snapshot) = self.snapshot {
            snapshot.finish().await;
        }
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TeeWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let (Poll::Ready(Ok(n)), Some(snapshot)) = (&poll, &mut this.snapshot) {
            snapshot.push(&buf[..*n]);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
