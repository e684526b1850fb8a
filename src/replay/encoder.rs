//! Turns a replay request into a wire request for the target host.
//!
//! # Rewrites
//! - Host points at the replay target
//! - Cookies come from the owning session first; recorded cookies only fill
//!   names the session has not set, and never the session cookie itself
//! - Recorded form params are replaced by the session's field overrides
//! - RPC text bodies get the recorded session token swapped for the live one
//!
//! Multipart bodies are rebuilt with a fresh boundary; uploaded files are
//! read back from the upload root.

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, Method, Request, Version};
use chrono::Utc;
use url::form_urlencoded;
use uuid::Uuid;

use crate::archive::cookie::{self, Cookie};
use crate::archive::model::Param;
use crate::config::SessionConfig;
use crate::replay::error::EncodeError;
use crate::replay::request::{PostData, ReplayRequest};
use crate::session::UserAgent;

/// Recorded headers never forwarded as-is.
const REWRITTEN_HEADERS: [&str; 7] = [
    "host",
    "cookie",
    "content-length",
    "content-type",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

pub struct RequestEncoder {
    target: String,
    session_cookie: String,
    rpc_mime_type: String,
}

impl RequestEncoder {
    pub fn new(target: impl Into<String>, session: &SessionConfig) -> Self {
        Self {
            target: target.into(),
            session_cookie: session.cookie_name.clone(),
            rpc_mime_type: session.rpc_mime_type.to_ascii_lowercase(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Absolute URL of `request` on the target.
    pub fn url(&self, request: &ReplayRequest) -> String {
        format!("http://{}{}", self.target, request.uri)
    }

    pub async fn encode(
        &self,
        request: &ReplayRequest,
        agent: &UserAgent,
    ) -> Result<Request<Body>, EncodeError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| EncodeError::InvalidRequest(format!("method {:?}", request.method)))?;
        let version = if request.http_version.eq_ignore_ascii_case("HTTP/1.0") {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(self.url(request))
            .version(version);

        if let Some(headers) = builder.headers_mut() {
            for h in &request.headers {
                if REWRITTEN_HEADERS.iter().any(|name| h.is(name)) {
                    continue;
                }
                let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(h.name.as_bytes()),
                    HeaderValue::from_str(&h.value),
                ) else {
                    tracing::debug!(header = %h.name, "Skipping unencodable recorded header");
                    continue;
                };
                headers.append(name, value);
            }

            let host = HeaderValue::from_str(&self.target)
                .map_err(|_| EncodeError::InvalidRequest(format!("target {:?}", self.target)))?;
            headers.insert(header::HOST, host);

            let cookies = self.cookies(request, agent);
            if !cookies.is_empty() {
                let value = cookie::render_cookie_header(&cookies);
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(header::COOKIE, value);
                }
            }
        }

        let (body, content_type) = match &request.post_data {
            Some(post) => self.body(request, post, agent).await?,
            None => (Vec::new(), None),
        };
        if let Some(content_type) = content_type {
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                builder = builder.header(header::CONTENT_TYPE, value);
            }
        } else if let Some(recorded) = request.content_type() {
            builder = builder.header(header::CONTENT_TYPE, recorded);
        }

        Ok(builder.body(Body::from(body))?)
    }

    fn cookies(&self, request: &ReplayRequest, agent: &UserAgent) -> Vec<Cookie> {
        let mut cookies = agent.cookies_for_uri(&request.uri, Utc::now());
        let recorded: Vec<Cookie> = request
            .cookies
            .iter()
            .filter(|rec| rec.name != self.session_cookie)
            .filter(|rec| !cookies.iter().any(|live| live.name == rec.name))
            .cloned()
            .collect();
        cookies.extend(recorded);
        cookies
    }

    async fn body(
        &self,
        request: &ReplayRequest,
        post: &PostData,
        agent: &UserAgent,
    ) -> Result<(Vec<u8>, Option<String>), EncodeError> {
        if !post.params.is_empty() {
            let params: Vec<Param> = post
                .params
                .iter()
                .map(|p| match agent.override_for(&p.name) {
                    Some(live) if !p.is_upload() => live,
                    _ => p.clone(),
                })
                .collect();

            if post.is_multipart() {
                let boundary = format!("----replay{}", Uuid::new_v4().simple());
                let body = multipart_body(request, &params, &boundary).await?;
                return Ok((body, Some(format!("multipart/form-data; boundary={boundary}"))));
            }

            let encoded = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params.iter().map(|p| (p.name.as_str(), p.value.as_str())))
                .finish();
            let mime = if post.mime_type.is_empty() {
                "application/x-www-form-urlencoded".to_string()
            } else {
                post.mime_type.clone()
            };
            return Ok((encoded.into_bytes(), Some(mime)));
        }

        let text = post.text.clone().unwrap_or_default();
        let text = if self.is_rpc(&post.mime_type) {
            self.rewrite_rpc(request, text, agent)
        } else {
            text
        };
        let mime = (!post.mime_type.is_empty()).then(|| post.mime_type.clone());
        Ok((text.into_bytes(), mime))
    }

    fn is_rpc(&self, mime: &str) -> bool {
        !self.rpc_mime_type.is_empty()
            && mime
                .split(';')
                .next()
                .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(&self.rpc_mime_type))
    }

    /// Swap the recorded session token embedded in an RPC payload.
    fn rewrite_rpc(&self, request: &ReplayRequest, text: String, agent: &UserAgent) -> String {
        let recorded = request
            .recorded_cookie(&self.session_cookie)
            .map(|c| c.value.as_str())
            .filter(|v| !v.is_empty());
        match (recorded, agent.cookie_value(&self.session_cookie)) {
            (Some(recorded), Some(live)) if recorded != live => text.replace(recorded, &live),
            _ => text,
        }
    }
}

async fn multipart_body(
    request: &ReplayRequest,
    params: &[Param],
    boundary: &str,
) -> Result<Vec<u8>, EncodeError> {
    let mut body = Vec::new();
    for param in params {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let name = escape_quoted(&param.name);
        if param.is_upload() {
            let path = request.upload_path(&param.file_name);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| EncodeError::Upload { path, source })?;
            let content_type = if param.content_type.is_empty() {
                "application/octet-stream"
            } else {
                param.content_type.as_str()
            };
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{}\"\r\nContent-Type: {content_type}\r\n\r\n",
                    escape_quoted(&param.file_name)
                )
                .as_bytes(),
            );
            body.extend_from_slice(&bytes);
        } else {
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
            body.extend_from_slice(param.value.as_bytes());
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(body)
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
