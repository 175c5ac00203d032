//! The `Converter` capability and the request plumbing shared by every
//! implementation.
//!
//! A converter turns a form module into its XML serialization or back. Two
//! implementations exist:
//!
//! - [`WorkerPool`](crate::worker::WorkerPool): a supervised pool of local
//!   converter processes.
//! - [`RemoteConverter`]: an already running converter endpoint.
//!
//! Both spool the source stream to a temp file first, so a failed attempt
//! can be replayed against another worker without holding the document in
//! memory, and both hand the answer back through [`deliver`], which removes
//! transient artifacts whatever the outcome.

mod http;
mod remote;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::worker::{WorkerError, WorkerResult};

pub use http::HttpEndpoint;
pub use remote::RemoteConverter;

/// Result type for converter operations.
pub type ConvertResult<T> = Result<T, WorkerError>;

/// Something that converts between form modules and XML.
///
/// Implementations must honour `cancel` at every suspension point and must
/// never leave transient files behind.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `src` (of type `mime`) and write the result to `dst`.
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncRead + Send + Unpin),
        mime: MimeType,
    ) -> ConvertResult<()>;

    /// Convert the file at `src` into the file at `dst`.
    async fn convert_files(
        &self,
        cancel: &CancellationToken,
        dst: &Path,
        src: &Path,
    ) -> ConvertResult<()>;
}

// ============================================================================
// Mime types
// ============================================================================

/// Format hint of a conversion payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MimeType {
    /// Binary form module (`.fmb`).
    Form,
    /// XML serialization of a form module.
    Xml,
}

impl MimeType {
    pub const FORM: &'static str = "application/x-oracle-forms";
    pub const XML: &'static str = "application/xml";

    pub fn as_str(self) -> &'static str {
        match self {
            MimeType::Form => Self::FORM,
            MimeType::Xml => Self::XML,
        }
    }

    /// File extension used for payloads of this type, dot included.
    pub fn extension(self) -> &'static str {
        match self {
            MimeType::Form => ".fmb",
            MimeType::Xml => ".xml",
        }
    }

    /// The type a conversion of this type produces.
    pub fn opposite(self) -> Self {
        match self {
            MimeType::Form => MimeType::Xml,
            MimeType::Xml => MimeType::Form,
        }
    }

    /// Guess the type from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "fmb" => Some(MimeType::Form),
            "xml" => Some(MimeType::Xml),
            _ => None,
        }
    }

    /// Guess the type from the first bytes of a payload.
    ///
    /// Anything that does not open with an XML declaration is taken to be a
    /// binary form.
    pub fn sniff(prefix: &[u8]) -> Self {
        let prefix = prefix.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(prefix);
        let start = prefix
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(prefix.len());
        if prefix[start..].starts_with(b"<?xml") {
            MimeType::Xml
        } else {
            MimeType::Form
        }
    }

    /// Parse a `Content-Type` header value, parameters ignored.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let essence = value.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            Self::FORM => Some(MimeType::Form),
            Self::XML | "text/xml" => Some(MimeType::Xml),
            _ => None,
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_content_type(s).ok_or_else(|| format!("unknown mime type: {s}"))
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Attempt bound and linear backoff for converter calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call; zero is treated as one.
    pub max_retries: u32,
    /// Sleep after attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_step: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// Sleep the backoff for `attempt`, or fail early on cancellation.
    pub async fn pause(&self, cancel: &CancellationToken, attempt: u32) -> WorkerResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            _ = tokio::time::sleep(self.backoff(attempt)) => Ok(()),
        }
    }
}

/// Run `op` until it succeeds, fails for good, or attempts run out.
pub async fn with_retries<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut op: F,
) -> WorkerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WorkerResult<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            result = op() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retriable() || attempt >= attempts => return Err(err),
            Err(err) => {
                warn!(attempt, error = %err, "conversion attempt failed, retrying");
                policy.pause(cancel, attempt).await?;
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// A conversion payload staged on disk.
///
/// The spooled file is removed when the request is dropped.
#[derive(Debug)]
pub struct ConversionRequest {
    payload: TempPath,
    mime: MimeType,
    len: u64,
}

impl ConversionRequest {
    /// Copy `src` into a temp file under `work_dir`.
    ///
    /// The file carries the extension of `mime`, which is how a piped worker
    /// picks the conversion direction.
    pub async fn spool(
        cancel: &CancellationToken,
        src: &mut (dyn AsyncRead + Send + Unpin),
        mime: MimeType,
        work_dir: &Path,
    ) -> WorkerResult<Self> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(WorkerError::Spool)?;
        let (file, payload) = tempfile::Builder::new()
            .prefix("forms2xml-")
            .suffix(mime.extension())
            .tempfile_in(work_dir)
            .map_err(WorkerError::Spool)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let len = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            copied = tokio::io::copy(src, &mut file) => copied.map_err(WorkerError::Spool)?,
        };
        file.flush().await.map_err(WorkerError::Spool)?;
        debug!(path = %payload.display(), len, %mime, "spooled conversion payload");

        Ok(Self { payload, mime, len })
    }

    pub fn payload(&self) -> &Path {
        &self.payload
    }

    pub fn mime(&self) -> MimeType {
        self.mime
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// What a worker hands back for a conversion.
pub enum ConvertResponse {
    /// The converted document as a byte stream.
    Inline(Pin<Box<dyn AsyncRead + Send>>),
    /// The converted document was materialized at this path; the receiver
    /// owns it and must remove it.
    Artifact(PathBuf),
}

impl fmt::Debug for ConvertResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertResponse::Inline(_) => f.write_str("Inline(..)"),
            ConvertResponse::Artifact(path) => f.debug_tuple("Artifact").field(path).finish(),
        }
    }
}

/// Stream a response into `dst`.
///
/// Artifacts are removed afterwards, also when copying fails or the caller
/// cancels.
pub async fn deliver(
    cancel: &CancellationToken,
    response: ConvertResponse,
    dst: &mut (dyn AsyncWrite + Send + Unpin),
) -> WorkerResult<u64> {
    match response {
        ConvertResponse::Inline(mut body) => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(WorkerError::Cancelled),
                copied = copy_flush(&mut body, dst) => copied.map_err(WorkerError::Deliver),
            }
        }
        ConvertResponse::Artifact(path) => {
            let copied = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(WorkerError::Cancelled),
                copied = copy_artifact(&path, dst) => copied.map_err(WorkerError::Deliver),
            };
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %err, "failed to remove conversion artifact");
            }
            copied
        }
    }
}

async fn copy_artifact(
    path: &Path,
    dst: &mut (dyn AsyncWrite + Send + Unpin),
) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    copy_flush(&mut file, dst).await
}

async fn copy_flush<R>(src: &mut R, dst: &mut (dyn AsyncWrite + Send + Unpin)) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let copied = tokio::io::copy(src, dst).await?;
    dst.flush().await?;
    Ok(copied)
}
