//! Archive subsystem.
//!
//! # Data Flow
//! ```text
//! Capture:
//!     ArchiveEntry → writer.rs (queue, single background task)
//!         → har.rs (wire form) → file
//!
//! Replay:
//!     file → reader.rs (streaming parse on its own thread)
//!         → ReplayRequest, one entry at a time → dispatcher
//! ```
//!
//! # Design Decisions
//! - Documents are never held in memory; both directions stream entries
//! - Lightweight archives omit defaults and cookie objects to stay small
//! - The reader validates the whole document before releasing the last entry

pub mod cookie;
pub mod error;
pub mod har;
pub mod model;
pub mod reader;
pub mod timestamp;
pub mod writer;

pub use error::ArchiveError;
pub use model::ArchiveEntry;
pub use reader::ArchiveReader;
pub use writer::{ArchiveWriter, WriterState};
