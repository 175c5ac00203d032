//! In-memory byte pipe between two pipeline stages.
//!
//! A pipe is a bounded channel of byte chunks plus one close-reason slot per
//! direction. Either end can close with an error; the other end then fails
//! with that same error on its next read or write instead of seeing a clean
//! end of stream.

use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Why the other end of a pipe closed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PipeError(Arc<str>);

impl PipeError {
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self(message.into())
    }

    /// Flatten an error and its causes into one message.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            let text = cause.to_string();
            if !message.contains(&text) {
                message.push_str(": ");
                message.push_str(&text);
            }
            source = cause.source();
        }
        Self::new(message)
    }

    pub fn message(&self) -> &str {
        &self.0
    }

    fn into_io(self, kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, self)
    }
}

/// Whether `err`, or anything in its source chain, is an error received
/// through a pipe rather than one that originated locally.
pub fn is_pipe_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<PipeError>() {
            return true;
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if carries_pipe_error(io_err) {
                return true;
            }
        }
        if let Some(quick_xml::Error::Io(io_err)) = err.downcast_ref::<quick_xml::Error>() {
            if carries_pipe_error(io_err) {
                return true;
            }
        }
        current = err.source();
    }
    false
}

fn carries_pipe_error(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<PipeError>())
}

#[derive(Debug, Default)]
struct Shared {
    /// Set by the writer on close; `None` inside means a clean end.
    writer_closed: Mutex<Option<Option<PipeError>>>,
    reader_error: Mutex<Option<PipeError>>,
}

impl Shared {
    fn close_writer(&self, err: Option<PipeError>) {
        let mut slot = self
            .writer_closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn writer_result(&self) -> Option<Option<PipeError>> {
        self.writer_closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn close_reader(&self, err: PipeError) {
        let mut slot = self
            .reader_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn reader_error(&self) -> Option<PipeError> {
        self.reader_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Create a pipe holding at most `capacity` chunks in flight.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared::default());
    (
        PipeWriter {
            tx: PollSender::new(tx),
            shared: shared.clone(),
        },
        PipeReader {
            rx,
            chunk: Bytes::new(),
            shared,
            closed: false,
        },
    )
}

/// Writing end of a [`pipe`].
///
/// Dropping the writer without [`close`](PipeWriter::close) or
/// `shutdown` fails the reader.
#[derive(Debug)]
pub struct PipeWriter {
    tx: PollSender<Bytes>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Close the pipe, with `err` if the writing stage failed.
    pub fn close(&mut self, err: Option<PipeError>) {
        self.shared.close_writer(err);
        self.tx.close();
    }

    fn broken(&self) -> io::Error {
        self.shared
            .reader_error()
            .unwrap_or_else(|| PipeError::new("pipe reader closed"))
            .into_io(io::ErrorKind::BrokenPipe)
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.shared.reader_error() {
            return Poll::Ready(Err(err.into_io(io::ErrorKind::BrokenPipe)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(self.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(self.broken()));
        }
        if self.tx.send_item(Bytes::copy_from_slice(buf)).is_err() {
            return Poll::Ready(Err(self.broken()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close(None);
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared
            .close_writer(Some(PipeError::new("pipe writer dropped before finishing")));
    }
}

/// Reading end of a [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    chunk: Bytes,
    shared: Arc<Shared>,
    closed: bool,
}

impl PipeReader {
    /// Stop reading; the writer's next write fails with `err`.
    pub fn close(&mut self, err: PipeError) {
        self.shared.close_reader(err);
        self.closed = true;
        self.rx.close();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "read from a closed pipe",
            )));
        }
        while self.chunk.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(chunk) => self.chunk = chunk,
                None => {
                    return Poll::Ready(match self.shared.writer_result() {
                        Some(None) => Ok(()),
                        Some(Some(err)) => Err(err.into_io(io::ErrorKind::Other)),
                        None => Err(PipeError::new("pipe writer vanished")
                            .into_io(io::ErrorKind::UnexpectedEof)),
                    });
                }
            }
        }
        let n = self.chunk.len().min(buf.remaining());
        let chunk = self.chunk.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared
            .close_reader(PipeError::new("pipe reader dropped before finishing"));
    }
}
