//! Capturing reverse proxy.
//!
//! # Responsibilities
//! - Accept client traffic and forward it unchanged to one upstream
//! - Feed each transaction into its own `CaptureDecoder`
//! - Hand completed entries to the shared archive writer
//!
//! # Design Decisions
//! - Request bodies are buffered (bounded) so the decoder sees the whole
//!   body before the upstream answers; response bodies stream through
//! - Decoding runs on the blocking pool since multipart uploads hit disk
//! - A failed capture never changes what the client receives

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Request, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use chrono::Utc;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::archive::model::{BodyContent, Header};
use crate::archive::ArchiveWriter;
use crate::capture::decoder::CaptureDecoder;
use crate::capture::error::CaptureError;
use crate::capture::events::{RequestEvent, RequestHead, ResponseEvent, ResponseHead};
use crate::config::CaptureConfig;
use crate::observability::metrics;

/// Headers that describe one hop, not the message.
const HOP_HEADERS: [header::HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::UPGRADE,
];

/// Handler state.
#[derive(Clone)]
pub struct CaptureState {
    pub client: Client<HttpConnector, Body>,
    pub config: Arc<CaptureConfig>,
    pub writer: Arc<ArchiveWriter>,
}

pub struct CaptureProxy {
    router: Router,
}

impl CaptureProxy {
    pub fn new(config: CaptureConfig, writer: Arc<ArchiveWriter>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let state = CaptureState {
            client,
            config: Arc::new(config),
            writer,
        };
        Self {
            router: Self::build_router(state, timeout),
        }
    }

    #[allow(deprecated)]
    fn build_router(state: CaptureState, timeout: Duration) -> Router {
        Router::new()
            .route("/", any(capture_handler))
            .route("/{*path}", any(capture_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(timeout))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` fires, then finish in-flight exchanges.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Capture proxy listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("Capture proxy stopped");
        Ok(())
    }
}

fn version_label(version: Version) -> String {
    format!("{version:?}")
}

fn to_headers(map: &HeaderMap) -> Vec<Header> {
    map.iter()
        .map(|(name, value)| {
            Header::new(name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned())
        })
        .collect()
}

fn upstream_uri(upstream: &str, uri: &Uri) -> Result<Uri, axum::http::Error> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Ok(Uri::builder()
        .scheme("http")
        .authority(upstream)
        .path_and_query(path)
        .build()?)
}

/// Drive the request side of a decoder with a fully buffered body.
fn feed_request(
    mut decoder: CaptureDecoder,
    head: RequestHead,
    body: Bytes,
) -> Result<CaptureDecoder, CaptureError> {
    decoder.on_request(RequestEvent::Head(head))?;
    if !body.is_empty() {
        decoder.on_request(RequestEvent::Chunk(body))?;
    }
    decoder.on_request(RequestEvent::End)?;
    Ok(decoder)
}

async fn capture_handler(State(state): State<CaptureState>, request: Request<Body>) -> Response {
    let started_ms = Utc::now().timestamp_millis();
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(uri = %parts.uri, error = %e, "Request body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let head = RequestHead {
        method: parts.method.to_string(),
        uri: parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        version: version_label(parts.version),
        headers: to_headers(&parts.headers),
    };

    let decoder = CaptureDecoder::new(&state.config, started_ms);
    let decoding = {
        let body = body.clone();
        tokio::task::spawn_blocking(move || feed_request(decoder, head, body))
    };

    let uri = match upstream_uri(&state.config.upstream, &parts.uri) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(upstream = %state.config.upstream, error = %e, "Bad upstream address");
            return (StatusCode::BAD_GATEWAY, "Bad upstream address").into_response();
        }
    };

    let mut forward = Request::builder().method(parts.method.clone()).uri(uri);
    if let Some(headers) = forward.headers_mut() {
        for (name, value) in parts.headers.iter() {
            if !HOP_HEADERS.contains(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }
    let forward = match forward.body(Body::from(body)) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(error = %e, "Could not build upstream request");
            return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
        }
    };

    let response = match state.client.request(forward).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(uri = %parts.uri, error = %e, "Upstream error");
            return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
        }
    };

    let (resp_parts, resp_body) = response.into_parts();
    let response_head = ResponseHead {
        status: resp_parts.status.as_u16(),
        version: version_label(resp_parts.version),
        headers: to_headers(&resp_parts.headers),
    };

    match decoding.await {
        Ok(Ok(decoder)) => record(&state, decoder, response_head),
        Ok(Err(e)) => tracing::error!(uri = %parts.uri, error = %e, "Capture decoder misuse"),
        Err(e) => tracing::error!(uri = %parts.uri, error = %e, "Capture task failed"),
    }

    Response::from_parts(resp_parts, Body::new(resp_body))
}

fn record(state: &CaptureState, mut decoder: CaptureDecoder, head: ResponseHead) {
    let completed = decoder
        .on_response(ResponseEvent::Head(head))
        .and_then(|()| decoder.on_response(ResponseEvent::End))
        .and_then(|()| decoder.complete());

    match completed {
        Ok(entry) => {
            let body_kind = match entry.body().map(|b| &b.content) {
                Some(BodyContent::Text(_)) => "text",
                Some(BodyContent::Params(_)) => "params",
                None => "none",
            };
            tracing::debug!(
                method = %entry.request().method,
                uri = %entry.request().uri,
                status = entry.response().status,
                body = body_kind,
                "Transaction captured"
            );
            metrics::record_capture(body_kind);
            if !state.writer.submit(entry) {
                tracing::debug!("Archive writer not running, entry discarded");
            }
        }
        Err(e) => tracing::error!(error = %e, "Capture decoder misuse"),
    }
}
