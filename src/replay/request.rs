//! Replay requests reconstructed from an archive.

use std::path::PathBuf;
use std::sync::Arc;

use crate::archive::cookie::Cookie;
use crate::archive::model::{self, Header, Param, DEFAULT_HTTP_VERSION};
use crate::session::UserAgent;

/// Recorded request body.
///
/// `text` and `params` are mutually exclusive; which one is populated
/// depends on the recorded content type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostData {
    pub mime_type: String,
    pub text: Option<String>,
    pub params: Vec<Param>,
}

impl PostData {
    pub fn text(mime_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            text: Some(text.into()),
            params: Vec::new(),
        }
    }

    pub fn params(mime_type: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            mime_type: mime_type.into(),
            text: None,
            params,
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.mime_type
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
    }
}

/// What the server answered during recording. Never sent to the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedResponse {
    pub status: u16,
    pub http_version: String,
    pub headers: Vec<Header>,
    pub cookies: Vec<Cookie>,
}

impl ExpectedResponse {
    /// The last cookie named `name` this response set.
    pub fn set_cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().rev().find(|c| c.name == name)
    }
}

/// One request to replay, plus the decorations the session layer adds.
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub http_version: String,
    pub method: String,
    pub uri: String,
    pub post_data: Option<PostData>,
    pub headers: Vec<Header>,
    pub cookies: Vec<Cookie>,
    pub upload_root: PathBuf,
    /// Recorded start time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub expected: Option<ExpectedResponse>,
    /// Holds the owning session's gate until the live response is applied.
    pub blocking: bool,
    /// Owning session context, set by the resolver before dispatch.
    pub session: Option<Arc<UserAgent>>,
}

impl ReplayRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            http_version: DEFAULT_HTTP_VERSION.to_string(),
            method: method.into(),
            uri: uri.into(),
            post_data: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            upload_root: PathBuf::new(),
            timestamp_ms,
            expected: None,
            blocking: false,
            session: None,
        }
    }

    /// Human label used in results and logs.
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.uri)
    }

    /// The recorded cookie named `name`, if the client sent one.
    pub fn recorded_cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.post_data
            .as_ref()
            .map(|p| p.mime_type.as_str())
            .filter(|m| !m.is_empty())
            .or_else(|| model::header_value(&self.headers, "Content-Type"))
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// Where the capture side stored an uploaded file for this request.
    pub fn upload_path(&self, file_name: &str) -> PathBuf {
        model::upload_path(&self.upload_root, self.timestamp_ms, file_name)
    }
}

/// One result of reading an archive.
///
/// The call that parses the final entry returns `Last`; an archive without
/// entries yields `Empty`. Either way no further items follow.
#[derive(Debug, Clone)]
pub enum ReplayItem {
    Request(ReplayRequest),
    Last(ReplayRequest),
    Empty,
}

impl ReplayItem {
    pub fn is_final(&self) -> bool {
        !matches!(self, ReplayItem::Request(_))
    }

    pub fn request(&self) -> Option<&ReplayRequest> {
        match self {
            ReplayItem::Request(r) | ReplayItem::Last(r) => Some(r),
            ReplayItem::Empty => None,
        }
    }

    pub fn into_request(self) -> Option<ReplayRequest> {
        match self {
            ReplayItem::Request(r) | ReplayItem::Last(r) => Some(r),
            ReplayItem::Empty => None,
        }
    }
}
