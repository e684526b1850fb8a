//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use capture_replay::config::ToolConfig;

/// One request as seen by the mock backend.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub received_at: Instant,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// What the mock backend answers.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub delay: Duration,
}

impl MockResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn html(self) -> Self {
        self.header("Content-Type", "text/html; charset=utf-8")
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A running mock backend and everything it has received.
#[derive(Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockBackend {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.received.lock().unwrap().clone()
    }

    pub fn request_to(&self, path: &str) -> Option<RecordedRequest> {
        self.requests().into_iter().find(|r| r.path == path)
    }

    /// Wait until `count` requests have arrived.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<RecordedRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let requests = self.requests();
            if requests.len() >= count || Instant::now() >= deadline {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Start a programmable HTTP/1.1 backend on an ephemeral port.
///
/// Every connection carries one request and is closed after the response.
pub async fn start_backend<F>(handler: F) -> MockBackend
where
    F: Fn(&RecordedRequest) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);

    {
        let received = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        let handler = Arc::clone(&handler);
                        let received = Arc::clone(&received);
                        tokio::spawn(async move {
                            let _ = serve_one(socket, handler.as_ref(), &received).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    MockBackend { addr, received }
}

async fn serve_one<F>(
    mut socket: TcpStream,
    handler: &F,
    received: &Mutex<Vec<RecordedRequest>>,
) -> std::io::Result<()>
where
    F: Fn(&RecordedRequest) -> MockResponse,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split(' ');
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let request = RecordedRequest {
        method,
        path,
        headers,
        body,
        received_at: Instant::now(),
    };
    received.lock().unwrap().push(request.clone());

    let response = handler(&request);
    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let mut out = format!("HTTP/1.1 {} Mock\r\n", response.status);
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.body.len(),
        response.body
    ));
    socket.write_all(out.as_bytes()).await?;
    socket.shutdown().await
}

/// Configuration with short timings, targeting `target`.
pub fn replay_config(target: SocketAddr, upload_root: &Path) -> ToolConfig {
    let mut config = ToolConfig::default();
    config.replay.target = target.to_string();
    config.replay.upload_root = upload_root.to_path_buf();
    config.replay.warmup_ms = 50;
    config.replay.drain_poll_ms = 10;
    config.replay.request_timeout_secs = 5;
    config.session.gate_timeout_ms = 5_000;
    config
}

/// Millisecond timestamp `offset_ms` after a fixed recording start.
pub fn started_at(offset_ms: i64) -> String {
    let base = chrono::DateTime::parse_from_rfc3339("2024-03-01T10:00:00.000+00:00").unwrap();
    (base + chrono::Duration::milliseconds(offset_ms))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, false)
}

/// A HAR entry with the given request and response parts.
pub fn entry(offset_ms: i64, request: Value, response: Value) -> Value {
    json!({
        "startedDateTime": started_at(offset_ms),
        "time": 12,
        "request": request,
        "response": response,
        "cache": {},
        "timings": { "send": 0, "wait": 10, "receive": 2 }
    })
}

pub fn request(method: &str, path: &str, headers: Value) -> Value {
    json!({
        "method": method,
        "url": format!("http://recorded.example{path}"),
        "httpVersion": "HTTP/1.1",
        "headers": headers,
        "queryString": []
    })
}

pub fn response(status: u16, headers: Value) -> Value {
    json!({
        "status": status,
        "statusText": "",
        "httpVersion": "HTTP/1.1",
        "headers": headers
    })
}

/// Write a complete archive holding `entries` to `path`.
pub fn write_har(path: &Path, entries: Vec<Value>) {
    let document = json!({
        "log": {
            "version": "1.2",
            "creator": { "name": "test", "version": "1" },
            "entries": entries
        }
    });
    std::fs::write(path, serde_json::to_vec_pretty(&document).unwrap()).unwrap();
}
