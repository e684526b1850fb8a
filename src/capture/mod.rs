//! Traffic capture subsystem.
//!
//! # Data Flow
//! ```text
//! client → proxy.rs (axum, forwards to upstream)
//!     → events.rs (request head/chunks/end, response head/end)
//!     → decoder.rs (per transaction; multipart.rs for form uploads)
//!     → ArchiveEntry → archive writer
//! ```
//!
//! # Design Decisions
//! - The decoder knows nothing about the transport; any adapter that can
//!   produce the event sequence can capture
//! - One decoder per transaction, no shared state between transactions

pub mod decoder;
pub mod error;
pub mod events;
pub mod multipart;
pub mod proxy;

pub use decoder::CaptureDecoder;
pub use error::CaptureError;
pub use events::{RequestEvent, RequestHead, ResponseEvent, ResponseHead};
pub use proxy::CaptureProxy;
