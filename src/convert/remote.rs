//! Converter backed by an already running endpoint.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    deliver, with_retries, ConversionRequest, ConvertResult, Converter, HttpEndpoint, MimeType,
    RetryPolicy,
};

/// A [`Converter`] talking to a remote converter service.
///
/// There is no process to supervise, so a failed attempt is simply retried
/// against the same endpoint with linear backoff.
///
/// # Example
///
/// ```ignore
/// use forms2xml::convert::{Converter, MimeType, RemoteConverter, RetryPolicy};
///
/// let remote = RemoteConverter::new("http://localhost:8008", RetryPolicy::default(), std::env::temp_dir())?;
/// remote.convert(&cancel, &mut xml_out, &mut fmb_in, MimeType::Form).await?;
/// ```
#[derive(Debug, Clone)]
pub struct RemoteConverter {
    endpoint: HttpEndpoint,
    retry: RetryPolicy,
    work_dir: PathBuf,
}

impl RemoteConverter {
    pub fn new(url: &str, retry: RetryPolicy, work_dir: PathBuf) -> ConvertResult<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(url)?,
            retry,
            work_dir,
        })
    }

    pub fn endpoint(&self) -> &HttpEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Converter for RemoteConverter {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncRead + Send + Unpin),
        mime: MimeType,
    ) -> ConvertResult<()> {
        let request = ConversionRequest::spool(cancel, src, mime, &self.work_dir).await?;
        let response =
            with_retries(cancel, &self.retry, || self.endpoint.convert(&request)).await?;
        let copied = deliver(cancel, response, dst).await?;
        debug!(url = %self.endpoint.url(), %mime, copied, "remote conversion finished");
        Ok(())
    }

    async fn convert_files(
        &self,
        cancel: &CancellationToken,
        dst: &Path,
        src: &Path,
    ) -> ConvertResult<()> {
        with_retries(cancel, &self.retry, || self.endpoint.convert_files(dst, src)).await
    }
}
