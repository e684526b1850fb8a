//! Captured transaction entities.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_METHOD: &str = "GET";
pub const DEFAULT_HTTP_VERSION: &str = "HTTP/1.1";

/// A single header, kept in arrival order with duplicates allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// First value of `name` in an ordered header list.
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers.iter().find(|h| h.is(name)).map(|h| h.value.as_str())
}

/// Every value of `name` in an ordered header list.
pub fn header_values<'a>(headers: &'a [Header], name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers.iter().filter(move |h| h.is(name)).map(|h| h.value.as_str())
}

/// A form field or a file upload descriptor.
///
/// Uploads carry `file_name` and `content_type` with an empty `value`; the
/// file bytes live under the upload root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

impl Param {
    pub fn field(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn upload(
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            ..Self::default()
        }
    }

    pub fn is_upload(&self) -> bool {
        !self.file_name.is_empty()
    }
}

/// Location of an uploaded file: `<root>/<started_ms>/<file name>`.
///
/// Only the final component of the client-supplied name is used.
pub fn upload_path(root: &Path, started_ms: i64, file_name: &str) -> PathBuf {
    root.join(started_ms.to_string()).join(sanitize_file_name(file_name))
}

fn sanitize_file_name(file_name: &str) -> &str {
    match file_name.rsplit(['/', '\\']).next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name,
        _ => "upload",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub uri: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub status: u16,
    pub version: String,
}

/// Decoded request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyContent {
    Text(String),
    Params(Vec<Param>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedBody {
    pub mime_type: String,
    pub content: BodyContent,
}

/// One recorded request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    started_ms: i64,
    request: RequestLine,
    request_headers: Vec<Header>,
    response: StatusLine,
    response_headers: Vec<Header>,
    body: Option<CapturedBody>,
}

impl ArchiveEntry {
    pub fn new(
        started_ms: i64,
        request: RequestLine,
        request_headers: Vec<Header>,
        response: StatusLine,
        response_headers: Vec<Header>,
        body: Option<CapturedBody>,
    ) -> Self {
        Self {
            started_ms,
            request,
            request_headers,
            response,
            response_headers,
            body,
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn started_ms(&self) -> i64 {
        self.started_ms
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.started_ms)
            .single()
            .unwrap_or_default()
    }

    pub fn request(&self) -> &RequestLine {
        &self.request
    }

    pub fn request_headers(&self) -> &[Header] {
        &self.request_headers
    }

    pub fn response(&self) -> &StatusLine {
        &self.response
    }

    pub fn response_headers(&self) -> &[Header] {
        &self.response_headers
    }

    pub fn body(&self) -> Option<&CapturedBody> {
        self.body.as_ref()
    }
}
