//! Incremental `multipart/form-data` decoder.
//!
//! # State Transitions
//! ```text
//! Preamble → Boundary → Headers → Body → Boundary → ... → Done
//! ```
//!
//! Plain fields are kept in memory. File parts stream to
//! `<upload_root>/<started_ms>/<file name>`; each part's file handle is
//! closed as soon as that part ends, and a part that never ends leaves no
//! file behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::archive::model::{self, Param};
use crate::capture::error::BodyError;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    /// Just past a delimiter; `--` closes the body, CRLF opens a part.
    Boundary,
    Headers,
    Body,
    Done,
}

#[derive(Debug)]
struct Part {
    name: String,
    file_name: Option<String>,
    content_type: String,
    value: Vec<u8>,
    file: Option<(File, PathBuf)>,
}

#[derive(Debug)]
pub struct MultipartDecoder {
    /// `--boundary`, as it appears first in the body.
    dash_boundary: Vec<u8>,
    /// `\r\n--boundary`, as it separates parts.
    delimiter: Vec<u8>,
    upload_root: PathBuf,
    started_ms: i64,
    buf: Vec<u8>,
    state: State,
    part: Option<Part>,
    params: Vec<Param>,
}

/// The `boundary` parameter of a multipart content type.
pub fn boundary_from(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

impl MultipartDecoder {
    pub fn new(content_type: &str, upload_root: &Path, started_ms: i64) -> Result<Self, BodyError> {
        let boundary = boundary_from(content_type).ok_or(BodyError::MissingBoundary)?;
        let dash_boundary = format!("--{boundary}").into_bytes();
        let delimiter = format!("\r\n--{boundary}").into_bytes();
        Ok(Self {
            dash_boundary,
            delimiter,
            upload_root: upload_root.to_path_buf(),
            started_ms,
            buf: Vec::new(),
            state: State::Preamble,
            part: None,
            params: Vec::new(),
        })
    }

    /// Consume one body chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        if self.state == State::Done {
            return Ok(());
        }
        self.buf.extend_from_slice(chunk);
        self.advance()
    }

    /// Finish the body and return the decoded parameters.
    pub fn finish(mut self) -> Result<Vec<Param>, BodyError> {
        self.advance()?;
        if self.state != State::Done {
            return Err(BodyError::Truncated);
        }
        Ok(std::mem::take(&mut self.params))
    }

    fn advance(&mut self) -> Result<(), BodyError> {
        loop {
            let progressed = match self.state {
                State::Preamble => self.skip_preamble(),
                State::Boundary => self.after_boundary(),
                State::Headers => self.read_headers()?,
                State::Body => self.read_body()?,
                State::Done => {
                    self.buf.clear();
                    return Ok(());
                }
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn skip_preamble(&mut self) -> bool {
        match find(&self.buf, &self.dash_boundary) {
            Some(at) => {
                self.buf.drain(..at + self.dash_boundary.len());
                self.state = State::Boundary;
                true
            }
            None => {
                // keep a tail that could still start the boundary
                let keep = self.dash_boundary.len().saturating_sub(1);
                if self.buf.len() > keep {
                    self.buf.drain(..self.buf.len() - keep);
                }
                false
            }
        }
    }

    fn after_boundary(&mut self) -> bool {
        if self.buf.len() < 2 {
            return false;
        }
        if self.buf.starts_with(b"--") {
            self.state = State::Done;
        } else {
            // transport padding, then CRLF
            match find(&self.buf, CRLF) {
                Some(at) => {
                    self.buf.drain(..at + CRLF.len());
                    self.state = State::Headers;
                }
                None => return false,
            }
        }
        true
    }

    fn read_headers(&mut self) -> Result<bool, BodyError> {
        // A part without headers starts its body right away.
        let header_len = if self.buf.starts_with(CRLF) {
            Some(0)
        } else {
            find(&self.buf, HEADER_END).map(|at| at + CRLF.len())
        };
        let Some(header_len) = header_len else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(BodyError::MalformedPart("part headers too large".into()));
            }
            return Ok(false);
        };

        let raw = String::from_utf8_lossy(&self.buf[..header_len]).into_owned();
        self.buf.drain(..header_len + CRLF.len());
        self.part = Some(self.open_part(&raw)?);
        self.state = State::Body;
        Ok(true)
    }

    fn open_part(&self, raw_headers: &str) -> Result<Part, BodyError> {
        let mut name = None;
        let mut file_name = None;
        let mut content_type = String::new();

        for line in raw_headers.split("\r\n").filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| BodyError::MalformedPart(format!("bad header line {line:?}")))?;
            let key = key.trim();
            if key.eq_ignore_ascii_case("Content-Disposition") {
                for (k, v) in disposition_params(value) {
                    match k.as_str() {
                        "name" => name = Some(v),
                        "filename" => file_name = Some(v),
                        _ => {}
                    }
                }
            } else if key.eq_ignore_ascii_case("Content-Type") {
                content_type = value.trim().to_string();
            }
        }

        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| BodyError::MalformedPart("part has no name".into()))?;

        let file_name = file_name.filter(|f| !f.is_empty());
        let file = match &file_name {
            Some(file_name) => {
                let path = model::upload_path(&self.upload_root, self.started_ms, file_name);
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                let file = File::create(&path)?;
                tracing::trace!(path = %path.display(), "Upload part opened");
                Some((file, path))
            }
            None => None,
        };

        Ok(Part {
            name,
            file_name,
            content_type,
            value: Vec::new(),
            file,
        })
    }

    fn read_body(&mut self) -> Result<bool, BodyError> {
        match find(&self.buf, &self.delimiter) {
            Some(at) => {
                self.write_part(at)?;
                self.buf.drain(..self.delimiter.len());
                self.close_part()?;
                self.state = State::Boundary;
                Ok(true)
            }
            None => {
                let keep = self.delimiter.len() - 1;
                if self.buf.len() > keep {
                    self.write_part(self.buf.len() - keep)?;
                }
                Ok(false)
            }
        }
    }

    /// Move `len` leading buffer bytes into the current part.
    fn write_part(&mut self, len: usize) -> Result<(), BodyError> {
        let Some(part) = self.part.as_mut() else {
            self.buf.drain(..len);
            return Ok(());
        };
        let data = &self.buf[..len];
        let written = match part.file.as_mut() {
            Some((file, _)) => file.write_all(data),
            None => {
                part.value.extend_from_slice(data);
                Ok(())
            }
        };
        self.buf.drain(..len);
        written.map_err(BodyError::from)
    }

    fn close_part(&mut self) -> Result<(), BodyError> {
        let Some(mut part) = self.part.take() else {
            return Ok(());
        };
        let param = match (part.file.take(), part.file_name) {
            (Some((mut file, path)), Some(file_name)) => {
                file.flush()?;
                drop(file);
                let stored = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(file_name);
                Param::upload(part.name, stored, part.content_type)
            }
            _ => Param::field(part.name, String::from_utf8_lossy(&part.value)),
        };
        self.params.push(param);
        Ok(())
    }
}

impl Drop for MultipartDecoder {
    fn drop(&mut self) {
        if let Some(Part { file: Some((file, path)), .. }) = self.part.take() {
            drop(file);
            if let Err(e) = fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Could not remove partial upload");
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `form-data; name="a"; filename="b;c.txt"` → `[(name, a), (filename, b;c.txt)]`
fn disposition_params(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;

    for c in value.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' if quoted => escaped = true,
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ';' if !quoted => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    for segment in segments {
        if let Some((key, value)) = segment.split_once('=') {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            params.push((key.trim().to_ascii_lowercase(), value.to_string()));
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT_TYPE: &str = "multipart/form-data; boundary=\"XyZ\"";

    fn body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"ignored preamble\r\n--XyZ\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"user\"\r\n\r\n");
        body.extend_from_slice(b"bob\r\n--XyZ\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"avatar\"; filename=\"C:\\\\pics\\\\me;1.png\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(b"\x89PNG\r\n--Xy not a delimiter\r\n");
        body.extend_from_slice(b"\r\n--XyZ--\r\nepilogue");
        body
    }

    fn decode_in_chunks(root: &Path, chunk: usize) -> Vec<Param> {
        let mut decoder = MultipartDecoder::new(CONTENT_TYPE, root, 77).unwrap();
        for piece in body().chunks(chunk) {
            decoder.feed(piece).unwrap();
        }
        decoder.finish().unwrap()
    }

    #[test]
    fn decodes_fields_and_streams_files() {
        for chunk in [1, 3, 7, 64, 4096] {
            let dir = tempfile::tempdir().unwrap();
            let params = decode_in_chunks(dir.path(), chunk);

            assert_eq!(params.len(), 2, "chunk size {chunk}");
            assert_eq!(params[0], Param::field("user", "bob"));
            assert_eq!(params[1], Param::upload("avatar", "me;1.png", "image/png"));

            let stored = fs::read(dir.path().join("77").join("me;1.png")).unwrap();
            assert_eq!(stored, b"\x89PNG\r\n--Xy not a delimiter\r\n");
        }
    }

    #[test]
    fn truncated_body_fails_and_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = MultipartDecoder::new(CONTENT_TYPE, dir.path(), 5).unwrap();
        let full = body();
        let cut = full.len() - 30;
        decoder.feed(&full[..cut]).unwrap();
        assert!(matches!(decoder.finish(), Err(BodyError::Truncated)));
        assert!(!dir.path().join("5").join("me;1.png").exists());
    }

    #[test]
    fn missing_boundary_is_rejected() {
        let err = MultipartDecoder::new("multipart/form-data", Path::new("/tmp"), 0).unwrap_err();
        assert!(matches!(err, BodyError::MissingBoundary));
    }

    #[test]
    fn nameless_part_is_rejected() {
        let mut decoder = MultipartDecoder::new("multipart/form-data; boundary=b", Path::new("/tmp"), 0).unwrap();
        let err = decoder
            .feed(b"--b\r\nContent-Disposition: form-data\r\n\r\nx\r\n--b--")
            .unwrap_err();
        assert!(matches!(err, BodyError::MalformedPart(_)));
    }

    #[test]
    fn empty_file_choice_is_a_plain_field() {
        let mut decoder = MultipartDecoder::new("multipart/form-data; boundary=b", Path::new("/tmp"), 0).unwrap();
        decoder
            .feed(b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"\"\r\n\r\n\r\n--b--\r\n")
            .unwrap();
        assert_eq!(decoder.finish().unwrap(), vec![Param::field("f", "")]);
    }
}
