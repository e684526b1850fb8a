//! Capture errors.

use thiserror::Error;

use crate::capture::events::Side;

/// Protocol misuse by the transport feeding a decoder.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("unexpected {side} event {event} in state {state}")]
    UnexpectedEvent {
        side: Side,
        event: &'static str,
        state: &'static str,
    },

    #[error("transaction is not complete on both sides")]
    NotReady,

    #[error("transaction was already completed")]
    AlreadyCompleted,
}

/// Failure while decoding a request body. Never escapes the decoder.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("upload I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("text body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("multipart content type has no boundary")]
    MissingBoundary,

    #[error("multipart part headers are malformed: {0}")]
    MalformedPart(String),

    #[error("multipart body ended before the closing delimiter")]
    Truncated,
}
