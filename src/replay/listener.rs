//! Result sinks for replayed requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::replay::error::ExchangeError;
use crate::session::DocumentInfo;

/// What happened to one replayed request.
#[derive(Debug, Clone, Default)]
pub struct SampleResult {
    pub label: String,
    pub url: String,
    /// Live status; absent when no response arrived.
    pub status: Option<u16>,
    pub expected_status: Option<u16>,
    pub elapsed: Duration,
    pub bytes_read: u64,
    pub document: Option<DocumentInfo>,
}

/// Notified once per replayed request. Implementations must not block.
pub trait ResultListener: Send + Sync {
    fn on_success(&self, result: &SampleResult);
    fn on_failure(&self, result: &SampleResult, error: &ExchangeError);
}

/// Logs every result.
#[derive(Debug, Default)]
pub struct TracingListener;

impl ResultListener for TracingListener {
    fn on_success(&self, result: &SampleResult) {
        tracing::debug!(
            request = %result.label,
            status = ?result.status,
            elapsed_ms = result.elapsed.as_millis() as u64,
            bytes = result.bytes_read,
            title = ?result.document.as_ref().and_then(|d| d.title.as_deref()),
            "Replay succeeded"
        );
    }

    fn on_failure(&self, result: &SampleResult, error: &ExchangeError) {
        tracing::warn!(
            request = %result.label,
            url = %result.url,
            status = ?result.status,
            expected = ?result.expected_status,
            elapsed_ms = result.elapsed.as_millis() as u64,
            bytes = result.bytes_read,
            error = %error,
            "Replay failed"
        );
    }
}

/// Running totals for a replay run.
#[derive(Debug, Default)]
pub struct ReplayStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    bytes_read: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub bytes_read: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

impl ReplayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

impl ResultListener for ReplayStats {
    fn on_success(&self, result: &SampleResult) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(result.bytes_read, Ordering::Relaxed);
    }

    fn on_failure(&self, result: &SampleResult, _error: &ExchangeError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(result.bytes_read, Ordering::Relaxed);
    }
}

/// Forwards every result to each inner listener, in order.
#[derive(Default)]
pub struct FanoutListener {
    listeners: Vec<Arc<dyn ResultListener>>,
}

impl FanoutListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn ResultListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl ResultListener for FanoutListener {
    fn on_success(&self, result: &SampleResult) {
        for listener in &self.listeners {
            listener.on_success(result);
        }
    }

    fn on_failure(&self, result: &SampleResult, error: &ExchangeError) {
        for listener in &self.listeners {
            listener.on_failure(result, error);
        }
    }
}
