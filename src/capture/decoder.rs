//! Per-transaction capture decoder.
//!
//! # State Transitions
//! ```text
//! request:  AwaitingHead → ReadingBody → Done
//! response: AwaitingHead → ReadingBody → Done
//! both Done → complete() (once) → ArchiveEntry
//! ```
//!
//! The two sides advance independently; a transport may deliver the whole
//! response before the request body has finished.
//!
//! # Body Policy
//! - Only POST, PUT and PATCH bodies are considered
//! - `text/*` is accumulated into a string, up to a configured size
//! - url-encoded and multipart forms are decoded incrementally into params
//! - everything else is dropped unbuffered
//!
//! A body that fails to decode is dropped and logged; the entry is still
//! produced without it.

use std::path::PathBuf;

use url::form_urlencoded;

use crate::archive::model::{
    header_value, ArchiveEntry, BodyContent, CapturedBody, Param, RequestLine, StatusLine,
};
use crate::capture::error::{BodyError, CaptureError};
use crate::capture::events::{RequestEvent, RequestHead, ResponseEvent, ResponseHead, Side};
use crate::capture::multipart::MultipartDecoder;
use crate::config::CaptureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideState {
    AwaitingHead,
    ReadingBody,
    Done,
}

impl SideState {
    fn name(self) -> &'static str {
        match self {
            SideState::AwaitingHead => "awaiting-head",
            SideState::ReadingBody => "reading-body",
            SideState::Done => "done",
        }
    }
}

/// Where request body bytes go.
#[derive(Debug)]
enum BodySink {
    Skipped,
    Text { mime: String, buf: Vec<u8>, limit: usize },
    Form { mime: String, pending: Vec<u8>, params: Vec<Param> },
    Multipart { mime: String, decoder: MultipartDecoder },
    Failed,
}

impl BodySink {
    fn feed(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        match self {
            BodySink::Skipped | BodySink::Failed => Ok(()),
            BodySink::Text { buf, limit, .. } => {
                if buf.len() + chunk.len() > *limit {
                    return Err(BodyError::TooLarge { limit: *limit });
                }
                buf.extend_from_slice(chunk);
                Ok(())
            }
            BodySink::Form { pending, params, .. } => {
                pending.extend_from_slice(chunk);
                // only whole pairs are decoded; the tail waits for more bytes
                if let Some(split) = pending.iter().rposition(|&b| b == b'&') {
                    decode_pairs(&pending[..split], params);
                    pending.drain(..=split);
                }
                Ok(())
            }
            BodySink::Multipart { decoder, .. } => decoder.feed(chunk),
        }
    }

    fn finish(self) -> Result<Option<CapturedBody>, BodyError> {
        let body = match self {
            BodySink::Skipped | BodySink::Failed => return Ok(None),
            BodySink::Text { mime, buf, .. } => CapturedBody {
                mime_type: mime,
                content: BodyContent::Text(String::from_utf8_lossy(&buf).into_owned()),
            },
            BodySink::Form { mime, pending, mut params } => {
                decode_pairs(&pending, &mut params);
                CapturedBody {
                    mime_type: mime,
                    content: BodyContent::Params(params),
                }
            }
            BodySink::Multipart { mime, decoder } => CapturedBody {
                mime_type: mime,
                content: BodyContent::Params(decoder.finish()?),
            },
        };
        Ok(Some(body))
    }

    fn kind(&self) -> &'static str {
        match self {
            BodySink::Skipped => "none",
            BodySink::Text { .. } => "text",
            BodySink::Form { .. } => "form",
            BodySink::Multipart { .. } => "multipart",
            BodySink::Failed => "failed",
        }
    }
}

fn decode_pairs(raw: &[u8], params: &mut Vec<Param>) {
    params.extend(
        form_urlencoded::parse(raw)
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| Param::field(name, value)),
    );
}

fn captures_body(method: &str) -> bool {
    ["POST", "PUT", "PATCH"]
        .iter()
        .any(|m| method.eq_ignore_ascii_case(m))
}

/// Re-encode the query so equivalent client encodings archive identically.
pub fn normalize_uri(uri: &str) -> String {
    let Some((path, query)) = uri.split_once('?') else {
        return uri.to_string();
    };
    let (query, fragment) = match query.split_once('#') {
        Some((q, f)) => (q, Some(f)),
        None => (query, None),
    };
    let mut out = path.to_string();
    if !query.is_empty() {
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form_urlencoded::parse(query.as_bytes()))
            .finish();
        out.push('?');
        out.push_str(&encoded);
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// Reassembles one transaction from transport events.
#[derive(Debug)]
pub struct CaptureDecoder {
    started_ms: i64,
    upload_root: PathBuf,
    max_text_body_bytes: usize,
    request_state: SideState,
    response_state: SideState,
    request: Option<RequestHead>,
    response: Option<ResponseHead>,
    sink: BodySink,
    body: Option<CapturedBody>,
    completed: bool,
}

impl CaptureDecoder {
    pub fn new(config: &CaptureConfig, started_ms: i64) -> Self {
        Self {
            started_ms,
            upload_root: config.upload_root.clone(),
            max_text_body_bytes: config.max_text_body_bytes,
            request_state: SideState::AwaitingHead,
            response_state: SideState::AwaitingHead,
            request: None,
            response: None,
            sink: BodySink::Skipped,
            body: None,
            completed: false,
        }
    }

    pub fn started_ms(&self) -> i64 {
        self.started_ms
    }

    fn unexpected(side: Side, event: &'static str, state: SideState) -> CaptureError {
        CaptureError::UnexpectedEvent {
            side,
            event,
            state: state.name(),
        }
    }

    pub fn on_request(&mut self, event: RequestEvent) -> Result<(), CaptureError> {
        match (self.request_state, event) {
            (SideState::AwaitingHead, RequestEvent::Head(head)) => {
                self.sink = self.select_sink(&head);
                tracing::trace!(method = %head.method, uri = %head.uri, body = self.sink.kind(), "Request head");
                self.request = Some(head);
                self.request_state = SideState::ReadingBody;
                Ok(())
            }
            (SideState::ReadingBody, RequestEvent::Chunk(chunk)) => {
                if let Err(e) = self.sink.feed(&chunk) {
                    self.fail_body(e);
                }
                Ok(())
            }
            (SideState::ReadingBody, RequestEvent::End) => {
                let sink = std::mem::replace(&mut self.sink, BodySink::Skipped);
                match sink.finish() {
                    Ok(body) => self.body = body,
                    Err(e) => self.fail_body(e),
                }
                self.request_state = SideState::Done;
                Ok(())
            }
            (state, RequestEvent::Head(_)) => Err(Self::unexpected(Side::Request, "head", state)),
            (state, RequestEvent::Chunk(_)) => Err(Self::unexpected(Side::Request, "chunk", state)),
            (state, RequestEvent::End) => Err(Self::unexpected(Side::Request, "end", state)),
        }
    }

    pub fn on_response(&mut self, event: ResponseEvent) -> Result<(), CaptureError> {
        match (self.response_state, event) {
            (SideState::AwaitingHead, ResponseEvent::Head(head)) => {
                self.response = Some(head);
                self.response_state = SideState::ReadingBody;
                Ok(())
            }
            (SideState::ReadingBody, ResponseEvent::Chunk(_)) => Ok(()),
            (SideState::ReadingBody, ResponseEvent::End) => {
                self.response_state = SideState::Done;
                Ok(())
            }
            (state, ResponseEvent::Head(_)) => Err(Self::unexpected(Side::Response, "head", state)),
            (state, ResponseEvent::Chunk(_)) => Err(Self::unexpected(Side::Response, "chunk", state)),
            (state, ResponseEvent::End) => Err(Self::unexpected(Side::Response, "end", state)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.request_state == SideState::Done && self.response_state == SideState::Done
    }

    /// Produce the archive entry. Succeeds exactly once, after both sides end.
    pub fn complete(&mut self) -> Result<ArchiveEntry, CaptureError> {
        if self.completed {
            return Err(CaptureError::AlreadyCompleted);
        }
        if !self.is_complete() {
            return Err(CaptureError::NotReady);
        }
        let (Some(request), Some(response)) = (self.request.take(), self.response.take()) else {
            return Err(CaptureError::NotReady);
        };
        self.completed = true;

        Ok(ArchiveEntry::new(
            self.started_ms,
            RequestLine {
                method: request.method,
                uri: normalize_uri(&request.uri),
                version: request.version,
            },
            request.headers,
            StatusLine {
                status: response.status,
                version: response.version,
            },
            response.headers,
            self.body.take(),
        ))
    }

    fn select_sink(&self, head: &RequestHead) -> BodySink {
        if !captures_body(&head.method) {
            return BodySink::Skipped;
        }
        let Some(mime) = header_value(&head.headers, "Content-Type") else {
            return BodySink::Skipped;
        };
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();

        if essence.starts_with("text/") {
            BodySink::Text {
                mime: mime.to_string(),
                buf: Vec::new(),
                limit: self.max_text_body_bytes,
            }
        } else if essence == "application/x-www-form-urlencoded" {
            BodySink::Form {
                mime: mime.to_string(),
                pending: Vec::new(),
                params: Vec::new(),
            }
        } else if essence == "multipart/form-data" {
            match MultipartDecoder::new(mime, &self.upload_root, self.started_ms) {
                Ok(decoder) => BodySink::Multipart {
                    mime: mime.to_string(),
                    decoder,
                },
                Err(e) => {
                    tracing::warn!(uri = %head.uri, error = %e, "Request body not captured");
                    BodySink::Failed
                }
            }
        } else {
            tracing::debug!(uri = %head.uri, content_type = %mime, "Request body not buffered");
            BodySink::Skipped
        }
    }

    fn fail_body(&mut self, error: BodyError) {
        let uri = self.request.as_ref().map(|r| r.uri.as_str()).unwrap_or("");
        tracing::warn!(uri = %uri, error = %error, "Request body dropped");
        // dropping the old sink removes any partially written upload
        self.sink = BodySink::Failed;
        self.body = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::model::Header;
    use axum::body::Bytes;

    fn config(root: &std::path::Path) -> CaptureConfig {
        CaptureConfig {
            upload_root: root.to_path_buf(),
            max_text_body_bytes: 16,
            ..CaptureConfig::default()
        }
    }

    fn head(method: &str, uri: &str, content_type: Option<&str>) -> RequestEvent {
        let mut headers = vec![Header::new("Host", "shop.local")];
        if let Some(ct) = content_type {
            headers.push(Header::new("Content-Type", ct));
        }
        RequestEvent::Head(RequestHead {
            method: method.into(),
            uri: uri.into(),
            version: "HTTP/1.1".into(),
            headers,
        })
    }

    fn respond(decoder: &mut CaptureDecoder) {
        decoder
            .on_response(ResponseEvent::Head(ResponseHead {
                status: 200,
                version: "HTTP/1.1".into(),
                headers: vec![],
            }))
            .unwrap();
        decoder.on_response(ResponseEvent::Chunk(Bytes::from_static(b"ignored"))).unwrap();
        decoder.on_response(ResponseEvent::End).unwrap();
    }

    fn feed(decoder: &mut CaptureDecoder, chunks: &[&'static [u8]]) {
        for chunk in chunks {
            decoder.on_request(RequestEvent::Chunk(Bytes::from_static(chunk))).unwrap();
        }
        decoder.on_request(RequestEvent::End).unwrap();
    }

    #[test]
    fn url_encoded_pairs_split_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = CaptureDecoder::new(&config(dir.path()), 1);
        decoder
            .on_request(head("POST", "/login", Some("application/x-www-form-urlencoded")))
            .unwrap();
        feed(&mut decoder, &[b"user=bo", b"b&pass=a%20", b"b+c&=skip&remember"]);
        respond(&mut decoder);

        let entry = decoder.complete().unwrap();
        let body = entry.body().unwrap();
        assert_eq!(
            body.content,
            BodyContent::Params(vec![
                Param::field("user", "bob"),
                Param::field("pass", "a b c"),
                Param::field("remember", ""),
            ])
        );
    }

    #[test]
    fn response_may_finish_before_request_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = CaptureDecoder::new(&config(dir.path()), 1);
        decoder.on_request(head("PUT", "/notes/1", Some("text/plain"))).unwrap();
        respond(&mut decoder);
        assert!(matches!(decoder.complete(), Err(CaptureError::NotReady)));

        feed(&mut decoder, &[b"hello ", b"world"]);
        let entry = decoder.complete().unwrap();
        assert_eq!(entry.body().unwrap().content, BodyContent::Text("hello world".into()));
        assert!(matches!(decoder.complete(), Err(CaptureError::AlreadyCompleted)));
    }

    #[test]
    fn oversized_text_is_dropped_without_failing_the_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = CaptureDecoder::new(&config(dir.path()), 1);
        decoder.on_request(head("POST", "/log", Some("text/plain"))).unwrap();
        feed(&mut decoder, &[b"0123456789", b"0123456789"]);
        respond(&mut decoder);
        let entry = decoder.complete().unwrap();
        assert!(entry.body().is_none());
    }

    #[test]
    fn binary_and_get_bodies_are_not_captured() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = CaptureDecoder::new(&config(dir.path()), 1);
        decoder.on_request(head("POST", "/blob", Some("application/octet-stream"))).unwrap();
        feed(&mut decoder, &[b"\x00\x01"]);
        respond(&mut decoder);
        assert!(decoder.complete().unwrap().body().is_none());

        let mut decoder = CaptureDecoder::new(&config(dir.path()), 1);
        decoder.on_request(head("GET", "/search", Some("text/plain"))).unwrap();
        feed(&mut decoder, &[b"q"]);
        respond(&mut decoder);
        assert!(decoder.complete().unwrap().body().is_none());
    }

    #[test]
    fn multipart_failure_keeps_entry_and_removes_upload() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = CaptureDecoder::new(&config(dir.path()), 9);
        decoder
            .on_request(head("POST", "/upload", Some("multipart/form-data; boundary=b")))
            .unwrap();
        feed(
            &mut decoder,
            &[b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\npartial"],
        );
        respond(&mut decoder);
        let entry = decoder.complete().unwrap();
        assert!(entry.body().is_none());
        assert!(!dir.path().join("9").join("a.txt").exists());
    }

    #[test]
    fn query_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = CaptureDecoder::new(&config(dir.path()), 1);
        decoder.on_request(head("GET", "/find?q=a%20b&tag=x%2Fy", None)).unwrap();
        decoder.on_request(RequestEvent::End).unwrap();
        respond(&mut decoder);
        assert_eq!(decoder.complete().unwrap().request().uri, "/find?q=a+b&tag=x%2Fy");
        assert_eq!(normalize_uri("/plain"), "/plain");
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = CaptureDecoder::new(&config(dir.path()), 1);
        let err = decoder.on_request(RequestEvent::End).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::UnexpectedEvent { side: Side::Request, state: "awaiting-head", .. }
        ));
        let err = decoder.on_response(ResponseEvent::End).unwrap_err();
        assert!(matches!(err, CaptureError::UnexpectedEvent { side: Side::Response, .. }));
    }
}
