//! Archive reading and writing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed archive: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported archive version {found:?}, expected {expected:?}")]
    UnsupportedVersion { found: String, expected: &'static str },

    #[error("unexpected root field `{0}`, expected `log`")]
    UnexpectedRootField(String),

    #[error("archive is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("`log.entries` appears before `log.version`")]
    EntriesBeforeVersion,

    #[error("`log.creator` appears after `log.entries`")]
    CreatorAfterEntries,

    #[error("entry {index} is invalid: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("read past the last archive entry")]
    ReadPastEnd,

    #[error("archive consumer went away")]
    Closed,

    #[error("archive writer is {0}, cannot start")]
    NotStartable(&'static str),

    #[error("archive task failed: {0}")]
    Task(String),
}
