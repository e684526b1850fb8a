//! Replay errors.
//!
//! Exchange-level errors are reported per request through the result
//! listener and never stop a run. Only `ReplayError` ends one.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("invalid request line: {0}")]
    InvalidRequest(String),

    #[error("upload {} unreadable: {source}", path.display())]
    Upload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not build request: {0}")]
    Build(#[from] axum::http::Error),
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("send failed: {0}")]
    Send(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("expected status {expected}, got {actual}")]
    StatusMismatch { expected: u16, actual: u16 },

    #[error("response body unreadable: {0}")]
    Body(String),
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("replay I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("dispatcher task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
