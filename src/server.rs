//! HTTP front end for converters.
//!
//! `POST /` converts the request body and answers with the converted
//! document; `GET /status` reports pool statistics.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::convert::{Converter, MimeType};
use crate::worker::{PoolStats, WorkerPool};

/// State shared across handlers.
pub struct AppState {
    /// Converts forms to XML.
    pub decoder: Arc<dyn Converter>,
    /// Converts XML to forms.
    pub encoder: Arc<dyn Converter>,
    /// Present when conversions run on local workers.
    pub pool: Option<Arc<WorkerPool>>,
    /// Cancelled when the server shuts down.
    pub cancel: CancellationToken,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(convert))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve until `state.cancel` fires.
pub async fn serve(listen: &str, state: Arc<AppState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let cancel = state.cancel.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// The payload type: `Content-Type` when it names one, else sniffed.
fn request_mime(headers: &HeaderMap, body: &[u8]) -> MimeType {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(MimeType::from_content_type)
        .unwrap_or_else(|| MimeType::sniff(&body[..body.len().min(512)]))
}

/// POST / - convert the body in the direction its type implies
async fn convert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mime = request_mime(&headers, &body);
    let converter = match mime {
        MimeType::Form => &state.decoder,
        MimeType::Xml => &state.encoder,
    };

    let cancel = state.cancel.child_token();
    let mut src: &[u8] = &body;
    let mut out = Vec::new();
    match converter.convert(&cancel, &mut out, &mut src, mime).await {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime.opposite().as_str())],
            out,
        )
            .into_response(),
        Err(err) => {
            error!(%mime, error = %err, "conversion request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("ERROR: {err}"),
            )
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pool: Option<PoolStats>,
}

/// GET /status - pool statistics
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        pool: state.pool.as_ref().map(|pool| pool.stats()),
    })
}
