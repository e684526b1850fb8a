//! Streaming archive reader.
//!
//! # Responsibilities
//! - Validate the document root and the top-level `log` fields
//! - Turn each entry into a `ReplayRequest`, one at a time
//! - Skip fields that carry nothing replay needs, whatever their shape
//! - Flag the final entry so callers never need a look-ahead probe
//!
//! # Design Decisions
//! - The document is parsed on a dedicated thread with serde visitors; only
//!   the entry being converted and a small channel of finished requests are
//!   held in memory, so archive size is not bounded by RAM
//! - `version` (and `creator`, when present) must precede `entries`
//! - Every violation is fatal: a partially replayed archive is worse than none
//! - The final entry is only released once the whole document, closing
//!   brackets included, has been validated

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use tokio::sync::mpsc;

use crate::archive::cookie;
use crate::archive::error::ArchiveError;
use crate::archive::har::{HarCreator, HarEntry, HAR_VERSION};
use crate::archive::model::{header_values, DEFAULT_HTTP_VERSION, DEFAULT_METHOD};
use crate::archive::timestamp;
use crate::replay::request::{ExpectedResponse, PostData, ReplayItem, ReplayRequest};

const CHANNEL_CAPACITY: usize = 32;

type ReadResult = Result<ReplayItem, ArchiveError>;

/// Pull-style reader over an archive document.
pub struct ArchiveReader {
    rx: mpsc::Receiver<ReadResult>,
    finished: bool,
}

impl ArchiveReader {
    /// Open an archive file. Upload references resolve against `upload_root`.
    pub fn open(path: &Path, upload_root: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        tracing::info!(path = %path.display(), "Reading archive");
        Ok(Self::from_reader(file, upload_root.to_path_buf()))
    }

    /// Read an archive from any byte source.
    pub fn from_reader<R>(source: R, upload_root: PathBuf) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        std::thread::spawn(move || parse_document(BufReader::new(source), upload_root, tx));
        Self {
            rx,
            finished: false,
        }
    }

    /// Parse the next entry.
    ///
    /// Returns `ReplayItem::Last` for the final entry and `ReplayItem::Empty`
    /// for an archive without entries. Any error ends the read.
    pub async fn read_next(&mut self) -> Result<ReplayItem, ArchiveError> {
        if self.finished {
            return Err(ArchiveError::ReadPastEnd);
        }
        let result = match self.rx.recv().await {
            Some(result) => result,
            None => Err(ArchiveError::Task("archive parser exited early".to_string())),
        };
        if result.as_ref().map_or(true, ReplayItem::is_final) {
            self.finished = true;
        }
        result
    }
}

/// Mutable state shared by the visitors of one document.
struct ParseContext {
    sink: mpsc::Sender<ReadResult>,
    upload_root: PathBuf,
    lightweight: bool,
    version_seen: bool,
    entries: usize,
    /// Typed cause of the last visitor error; serde only carries a message.
    failure: Option<ArchiveError>,
}

impl ParseContext {
    fn fail<E: de::Error>(&mut self, err: ArchiveError) -> E {
        let e = E::custom(&err);
        self.failure = Some(err);
        e
    }
}

fn parse_document<R: Read>(source: R, upload_root: PathBuf, sink: mpsc::Sender<ReadResult>) {
    let mut ctx = ParseContext {
        sink: sink.clone(),
        upload_root,
        lightweight: false,
        version_seen: false,
        entries: 0,
        failure: None,
    };

    let mut de = serde_json::Deserializer::from_reader(source);
    let parsed = RootSeed(&mut ctx)
        .deserialize(&mut de)
        .and_then(|last| de.end().map(|()| last));

    let outcome = match parsed {
        Ok(Some(last)) => Ok(ReplayItem::Last(last)),
        Ok(None) => Ok(ReplayItem::Empty),
        Err(e) => Err(ctx.failure.take().unwrap_or(ArchiveError::Json(e))),
    };

    match &outcome {
        Err(ArchiveError::Closed) => return,
        Err(e) => tracing::error!(error = %e, entries = ctx.entries, "Archive rejected"),
        Ok(_) => tracing::debug!(entries = ctx.entries, lightweight = ctx.lightweight, "Archive fully parsed"),
    }
    let _ = sink.blocking_send(outcome);
}

/// `{ "log": {...} }`
struct RootSeed<'c>(&'c mut ParseContext);

impl<'de> DeserializeSeed<'de> for RootSeed<'_> {
    type Value = Option<ReplayRequest>;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(RootVisitor(self.0))
    }
}

struct RootVisitor<'c>(&'c mut ParseContext);

impl<'de> Visitor<'de> for RootVisitor<'_> {
    type Value = Option<ReplayRequest>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an archive object with a `log` field")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let ctx = self.0;
        let mut log = None;
        while let Some(key) = map.next_key::<String>()? {
            if key != "log" || log.is_some() {
                return Err(ctx.fail(ArchiveError::UnexpectedRootField(key)));
            }
            log = Some(map.next_value_seed(LogSeed(&mut *ctx))?);
        }
        log.ok_or_else(|| ctx.fail(ArchiveError::MissingField("log")))
    }
}

/// `{ "version": .., "creator": {..}, "entries": [..], ... }`
struct LogSeed<'c>(&'c mut ParseContext);

impl<'de> DeserializeSeed<'de> for LogSeed<'_> {
    type Value = Option<ReplayRequest>;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(LogVisitor(self.0))
    }
}

struct LogVisitor<'c>(&'c mut ParseContext);

impl<'de> Visitor<'de> for LogVisitor<'_> {
    type Value = Option<ReplayRequest>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a `log` object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let ctx = self.0;
        let mut last = None;
        let mut entries_seen = false;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "version" => {
                    let version: String = map.next_value()?;
                    if version != HAR_VERSION {
                        return Err(ctx.fail(ArchiveError::UnsupportedVersion {
                            found: version,
                            expected: HAR_VERSION,
                        }));
                    }
                    ctx.version_seen = true;
                }
                "creator" => {
                    // entries were already converted under the default mode
                    if entries_seen {
                        return Err(ctx.fail(ArchiveError::CreatorAfterEntries));
                    }
                    let creator: HarCreator = map.next_value()?;
                    ctx.lightweight = creator.is_lightweight();
                    tracing::debug!(creator = %creator.name, lightweight = ctx.lightweight, "Archive creator");
                }
                "entries" => {
                    if !ctx.version_seen {
                        return Err(ctx.fail(ArchiveError::EntriesBeforeVersion));
                    }
                    last = map.next_value_seed(EntriesSeed(&mut *ctx))?;
                    entries_seen = true;
                }
                // browser, pages, comment and anything newer
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        if !ctx.version_seen {
            return Err(ctx.fail(ArchiveError::MissingField("log.version")));
        }
        if !entries_seen {
            return Err(ctx.fail(ArchiveError::MissingField("log.entries")));
        }
        Ok(last)
    }
}

/// `[ entry, entry, ... ]`, forwarding every entry but the last.
struct EntriesSeed<'c>(&'c mut ParseContext);

impl<'de> DeserializeSeed<'de> for EntriesSeed<'_> {
    type Value = Option<ReplayRequest>;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(EntriesVisitor(self.0))
    }
}

struct EntriesVisitor<'c>(&'c mut ParseContext);

impl<'de> Visitor<'de> for EntriesVisitor<'_> {
    type Value = Option<ReplayRequest>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of entries")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let ctx = self.0;
        let mut held: Option<ReplayRequest> = None;

        while let Some(entry) = seq.next_element::<HarEntry>()? {
            let index = ctx.entries;
            ctx.entries += 1;
            let request = match to_replay_request(entry, index, ctx.lightweight, &ctx.upload_root) {
                Ok(request) => request,
                Err(e) => return Err(ctx.fail(e)),
            };
            if let Some(previous) = held.replace(request) {
                if ctx.sink.blocking_send(Ok(ReplayItem::Request(previous))).is_err() {
                    return Err(ctx.fail(ArchiveError::Closed));
                }
            }
        }
        Ok(held)
    }
}

fn invalid(index: usize, reason: impl Into<String>) -> ArchiveError {
    ArchiveError::InvalidEntry {
        index,
        reason: reason.into(),
    }
}

fn or_default(
    value: Option<String>,
    default: &str,
    lightweight: bool,
    index: usize,
    field: &str,
) -> Result<String, ArchiveError> {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => Ok(v),
        None if lightweight => Ok(default.to_string()),
        None => Err(invalid(index, format!("missing {field}"))),
    }
}

/// Path and query of an archive URL, without scheme and host.
fn strip_host(url: &str) -> Option<String> {
    if url.starts_with('/') {
        return Some(url.to_string());
    }
    let parsed = url::Url::parse(url).ok()?;
    let mut uri = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        uri.push('?');
        uri.push_str(query);
    }
    Some(uri)
}

fn to_replay_request(
    entry: HarEntry,
    index: usize,
    lightweight: bool,
    upload_root: &Path,
) -> Result<ReplayRequest, ArchiveError> {
    let started = timestamp::parse_iso(&entry.started_date_time)
        .map_err(|e| invalid(index, format!("bad startedDateTime: {e}")))?;

    let req = entry.request;
    let method = or_default(req.method, DEFAULT_METHOD, lightweight, index, "request.method")?;
    let http_version = or_default(
        req.http_version,
        DEFAULT_HTTP_VERSION,
        lightweight,
        index,
        "request.httpVersion",
    )?;
    let uri = strip_host(&req.url)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| invalid(index, format!("bad request.url {:?}", req.url)))?;

    let cookies = match req.cookies {
        Some(cookies) if !cookies.is_empty() => cookies,
        _ => header_values(&req.headers, "Cookie")
            .flat_map(cookie::parse_cookie_header)
            .collect(),
    };

    let post_data = match req.post_data {
        Some(post) => {
            let params = post.params.unwrap_or_default();
            if params.iter().any(|p| p.name.is_empty()) {
                return Err(invalid(index, "postData param without a name"));
            }
            Some(PostData {
                mime_type: post.mime_type,
                text: if params.is_empty() { post.text } else { None },
                params,
            })
        }
        None => None,
    };

    let resp = entry.response;
    let response_version = or_default(
        resp.http_version,
        DEFAULT_HTTP_VERSION,
        lightweight,
        index,
        "response.httpVersion",
    )?;
    let response_cookies = match resp.cookies {
        Some(cookies) if !cookies.is_empty() => cookies,
        _ => header_values(&resp.headers, "Set-Cookie")
            .filter_map(|value| cookie::parse_set_cookie(value, started))
            .collect(),
    };

    let mut request = ReplayRequest::new(method, uri, started.timestamp_millis());
    request.http_version = http_version;
    request.headers = req.headers;
    request.cookies = cookies;
    request.post_data = post_data;
    request.upload_root = upload_root.to_path_buf();
    request.expected = Some(ExpectedResponse {
        status: resp.status,
        http_version: response_version,
        headers: resp.headers,
        cookies: response_cookies,
    });

    tracing::trace!(index, label = %request.label(), "Archive entry parsed");
    Ok(request)
}
