//! HTTP Archive (HAR 1.2) wire structures.
//!
//! The same structures serve the writer and the reader. Fields other tools
//! emit (timings, cache, pageref, serverIPAddress, ...) have no counterpart
//! here and are skipped by serde while reading.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::archive::cookie::{self, Cookie};
use crate::archive::model::{
    ArchiveEntry, BodyContent, Header, Param, DEFAULT_HTTP_VERSION, DEFAULT_METHOD,
};
use crate::archive::timestamp;

/// Supported `log.version`.
pub const HAR_VERSION: &str = "1.2";

/// Marker placed in `log.creator.comment` by lightweight writers.
pub const LIGHTWEIGHT_MARKER: &str = "lightweight";

/// Headers never written to an archive.
pub const EXCLUDED_HEADERS: [&str; 2] = ["Host", "Via"];

/// Response headers kept in lightweight mode.
pub const LIGHTWEIGHT_RESPONSE_HEADERS: [&str; 1] = ["Set-Cookie"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarCreator {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl HarCreator {
    pub fn is_lightweight(&self) -> bool {
        self.comment
            .as_deref()
            .is_some_and(|c| c.contains(LIGHTWEIGHT_MARKER))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    pub request: HarRequest,
    pub response: HarResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_version: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Vec<Cookie>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_version: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Vec<Cookie>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Param>>,
}

/// How much detail the writer keeps per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Full,
    Lightweight,
}

impl WriteMode {
    pub fn from_lightweight(lightweight: bool) -> Self {
        if lightweight {
            WriteMode::Lightweight
        } else {
            WriteMode::Full
        }
    }
}

fn is_excluded(header: &Header) -> bool {
    EXCLUDED_HEADERS.iter().any(|name| header.is(name))
}

fn omit_default(value: &str, default: &str, mode: WriteMode) -> Option<String> {
    if mode == WriteMode::Lightweight && value.eq_ignore_ascii_case(default) {
        None
    } else {
        Some(value.to_string())
    }
}

impl HarEntry {
    /// Build the wire form of a captured entry.
    pub fn from_entry(entry: &ArchiveEntry, mode: WriteMode) -> Self {
        let request_line = entry.request();
        let response_line = entry.response();

        let url = match crate::archive::model::header_value(entry.request_headers(), "Host") {
            Some(host) if request_line.uri.starts_with('/') => {
                format!("http://{}{}", host, request_line.uri)
            }
            _ => request_line.uri.clone(),
        };

        let request_headers: Vec<Header> = entry
            .request_headers()
            .iter()
            .filter(|h| !is_excluded(h))
            .cloned()
            .collect();

        let response_headers: Vec<Header> = entry
            .response_headers()
            .iter()
            .filter(|h| !is_excluded(h))
            .filter(|h| {
                mode == WriteMode::Full
                    || LIGHTWEIGHT_RESPONSE_HEADERS.iter().any(|name| h.is(name))
            })
            .cloned()
            .collect();

        let (request_cookies, response_cookies) = match mode {
            WriteMode::Lightweight => (None, None),
            WriteMode::Full => {
                let now = Utc::now();
                let sent = request_headers
                    .iter()
                    .filter(|h| h.is("Cookie"))
                    .flat_map(|h| cookie::parse_cookie_header(&h.value))
                    .collect();
                let set = response_headers
                    .iter()
                    .filter(|h| h.is("Set-Cookie"))
                    .filter_map(|h| cookie::parse_set_cookie(&h.value, now))
                    .collect();
                (Some(sent), Some(set))
            }
        };

        let post_data = entry.body().map(|body| match &body.content {
            BodyContent::Text(text) => HarPostData {
                mime_type: body.mime_type.clone(),
                text: Some(text.clone()),
                params: None,
            },
            BodyContent::Params(params) => HarPostData {
                mime_type: body.mime_type.clone(),
                text: None,
                params: Some(params.clone()),
            },
        });

        HarEntry {
            started_date_time: timestamp::format_millis(&entry.started_at()),
            request: HarRequest {
                method: omit_default(&request_line.method, DEFAULT_METHOD, mode),
                url,
                http_version: omit_default(&request_line.version, DEFAULT_HTTP_VERSION, mode),
                headers: request_headers,
                cookies: request_cookies,
                post_data,
            },
            response: HarResponse {
                status: response_line.status,
                http_version: omit_default(&response_line.version, DEFAULT_HTTP_VERSION, mode),
                headers: response_headers,
                cookies: response_cookies,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::model::{CapturedBody, RequestLine, StatusLine};

    fn entry(method: &str, body: Option<CapturedBody>) -> ArchiveEntry {
        ArchiveEntry::new(
            1_700_000_000_000,
            RequestLine {
                method: method.into(),
                uri: "/login?next=%2Fhome".into(),
                version: "HTTP/1.1".into(),
            },
            vec![
                Header::new("Host", "shop.local"),
                Header::new("Cookie", "JSESSIONID=abc"),
                Header::new("Via", "1.1 proxy"),
            ],
            StatusLine {
                status: 302,
                version: "HTTP/1.1".into(),
            },
            vec![
                Header::new("Location", "/home"),
                Header::new("Set-Cookie", "JSESSIONID=def; Path=/"),
            ],
            body,
        )
    }

    #[test]
    fn full_mode_keeps_everything_but_excluded_headers() {
        let har = HarEntry::from_entry(&entry("GET", None), WriteMode::Full);
        assert_eq!(har.started_date_time, "2023-11-14T22:13:20.000Z");
        assert_eq!(har.request.url, "http://shop.local/login?next=%2Fhome");
        assert_eq!(har.request.method.as_deref(), Some("GET"));
        assert!(har.request.headers.iter().all(|h| !h.is("Host") && !h.is("Via")));
        assert_eq!(har.response.headers.len(), 2);
        assert_eq!(har.request.cookies.as_ref().unwrap()[0].value, "abc");
        assert_eq!(har.response.cookies.as_ref().unwrap()[0].path.as_deref(), Some("/"));
    }

    #[test]
    fn lightweight_mode_drops_defaults_and_cookie_objects() {
        let har = HarEntry::from_entry(&entry("GET", None), WriteMode::Lightweight);
        assert!(har.request.method.is_none());
        assert!(har.request.http_version.is_none());
        assert!(har.request.cookies.is_none());
        assert_eq!(har.response.headers, vec![Header::new("Set-Cookie", "JSESSIONID=def; Path=/")]);

        let json = serde_json::to_value(&har).unwrap();
        assert!(json["request"].get("cookies").is_none());
    }

    #[test]
    fn lightweight_mode_keeps_non_default_method() {
        let body = CapturedBody {
            mime_type: "multipart/form-data; boundary=x".into(),
            content: BodyContent::Params(vec![
                Param::field("user", "bob"),
                Param::upload("avatar", "me.png", "image/png"),
            ]),
        };
        let har = HarEntry::from_entry(&entry("POST", Some(body)), WriteMode::Lightweight);
        assert_eq!(har.request.method.as_deref(), Some("POST"));

        let json = serde_json::to_value(&har.request.post_data).unwrap();
        assert_eq!(json["params"][0]["value"], "bob");
        assert_eq!(json["params"][1]["fileName"], "me.png");
        assert!(json["params"][1].get("value").is_none());
    }
}
