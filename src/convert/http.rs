//! Request/response protocol of a networked converter.
//!
//! - `POST /` with the raw payload, `Content-Type` set to the payload's mime
//!   type and `Accept: */*`. A status of 400 or above is a failure carrying
//!   the body as detail. A `Location: file://...` header points at a
//!   transient artifact holding the result; otherwise the body is the result.
//! - `GET /?src=..&dst=..` converts between two files the converter can see,
//!   answering `201 Created` on success.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, StatusCode, Url};
use tokio_util::io::{ReaderStream, StreamReader};

use super::{ConversionRequest, ConvertResponse};
use crate::worker::{WorkerError, WorkerResult};

/// A converter endpoint reachable over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: Client,
    url: Url,
}

impl HttpEndpoint {
    /// Create an endpoint for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the HTTP client cannot
    /// be built.
    pub fn new(url: &str) -> WorkerResult<Self> {
        let url = Url::parse(url)
            .map_err(|err| WorkerError::InvalidEndpoint(format!("{url}: {err}")))?;
        let client = Client::builder().build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send one conversion request.
    pub async fn convert(&self, request: &ConversionRequest) -> WorkerResult<ConvertResponse> {
        let file = tokio::fs::File::open(request.payload())
            .await
            .map_err(WorkerError::Spool)?;

        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, request.mime().as_str())
            .header(ACCEPT, "*/*")
            .header(CONTENT_LENGTH, request.len())
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let detail = response.text().await.unwrap_or_default();
            return Err(WorkerError::conversion(status.to_string(), detail));
        }

        if let Some(location) = response.headers().get(LOCATION) {
            let location = location.to_str().map_err(|err| {
                WorkerError::conversion(status.to_string(), format!("unreadable location: {err}"))
            })?;
            let path = location.strip_prefix("file://").unwrap_or(location);
            return Ok(ConvertResponse::Artifact(PathBuf::from(path)));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(ConvertResponse::Inline(Box::pin(StreamReader::new(body))))
    }

    /// Ask the endpoint to convert `src` into `dst`.
    pub async fn convert_files(&self, dst: &Path, src: &Path) -> WorkerResult<()> {
        let response = self
            .client
            .get(self.url.clone())
            .query(&[("src", src.to_string_lossy()), ("dst", dst.to_string_lossy())])
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let detail = response.text().await.unwrap_or_default();
            return Err(WorkerError::conversion(status.to_string(), detail));
        }
        Ok(())
    }
}
