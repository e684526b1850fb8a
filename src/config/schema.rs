//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for capture and
//! replay. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the capture/replay tool.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ToolConfig {
    /// Capture proxy settings (listener, upstream, body limits).
    pub capture: CaptureConfig,

    /// Archive writer settings.
    pub archive: ArchiveConfig,

    /// Replay scheduler settings.
    pub replay: ReplayConfig,

    /// Session emulation settings.
    pub session: SessionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Capture proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Bind address for the capturing proxy (e.g., "0.0.0.0:8080").
    pub listen_address: String,

    /// Upstream server the proxy forwards to (e.g., "127.0.0.1:3000").
    pub upstream: String,

    /// Directory receiving uploaded files, one sub-directory per entry timestamp.
    pub upload_root: PathBuf,

    /// Largest text/* request body kept in the archive.
    pub max_text_body_bytes: usize,

    /// Largest request body the proxy will buffer and forward.
    pub max_body_bytes: usize,

    /// Total time allowed for one proxied exchange, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            upstream: "127.0.0.1:3000".to_string(),
            upload_root: PathBuf::from("uploads"),
            max_text_body_bytes: 1024 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
            request_timeout_secs: 30,
        }
    }
}

/// Archive writer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Destination (capture) or source (replay) archive file.
    pub path: PathBuf,

    /// Omit default-valued fields, non-cookie response headers and cookie objects.
    pub lightweight: bool,

    /// Dequeue timeout of the writer loop in milliseconds.
    pub poll_interval_ms: u64,

    /// Value of `log.creator.name`.
    pub creator_name: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("traffic.har"),
            lightweight: false,
            poll_interval_ms: 50,
            creator_name: "capture-replay".to_string(),
        }
    }
}

impl ArchiveConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Replay scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Host and port every replayed request is sent to.
    pub target: String,

    /// Directory holding uploaded files recorded during capture.
    pub upload_root: PathBuf,

    /// Offset added to every due time so early requests do not all fire at once.
    pub warmup_ms: u64,

    /// Upper bound on how long the scheduling loop sleeps between checks.
    pub poll_interval_ms: u64,

    /// Skew above which a warning is logged.
    pub skew_threshold_ms: u64,

    /// Poll interval while draining open connections at shutdown.
    pub drain_poll_ms: u64,

    /// Total time allowed for one replayed exchange, in seconds.
    pub request_timeout_secs: u64,

    /// Pending tasks above which the archive is not read further.
    pub max_pending: usize,

    /// Largest response body read back from the target.
    pub max_response_bytes: usize,

    /// Report a status different from the recorded one as a failure.
    pub fail_on_status_mismatch: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            target: "127.0.0.1:8080".to_string(),
            upload_root: PathBuf::from("uploads"),
            warmup_ms: 1000,
            poll_interval_ms: 10,
            skew_threshold_ms: 100,
            drain_poll_ms: 100,
            request_timeout_secs: 30,
            max_pending: 1000,
            max_response_bytes: 16 * 1024 * 1024,
            fail_on_status_mismatch: true,
        }
    }
}

impl ReplayConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn skew_threshold(&self) -> Duration {
        Duration::from_millis(self.skew_threshold_ms)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Session emulation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the cookie carrying the server-issued session identifier.
    pub cookie_name: String,

    /// Bounded wait for a blocking request's session gate, in milliseconds.
    pub gate_timeout_ms: u64,

    /// Bounded wait for a context store key lock, in milliseconds.
    pub lock_timeout_ms: u64,

    /// Hidden form fields whose live values replace recorded POST params.
    pub override_fields: Vec<String>,

    /// Content type of RPC-over-text bodies that embed the session token.
    pub rpc_mime_type: String,

    /// Use the only tracked session for requests without a session cookie.
    pub adopt_sole_session: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "JSESSIONID".to_string(),
            gate_timeout_ms: 30_000,
            lock_timeout_ms: 5_000,
            override_fields: vec![
                "csrf_token".to_string(),
                "_csrf".to_string(),
                "authenticity_token".to_string(),
                "__RequestVerificationToken".to_string(),
            ],
            rpc_mime_type: "text/x-gwt-rpc".to_string(),
            adopt_sole_session: true,
        }
    }
}

impl SessionConfig {
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
