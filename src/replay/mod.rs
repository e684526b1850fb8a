//! Replay subsystem.
//!
//! # Data Flow
//! ```text
//! ArchiveReader → runner.rs (backpressure, shutdown)
//!     → dispatcher.rs (due-time queue, fires on schedule)
//!     → session resolver (owning context, blocking flag)
//!     → exchange.rs (gate, encoder.rs, send, Set-Cookie, HTML scan)
//!     → listener.rs (per-request results)
//! ```
//!
//! # Design Decisions
//! - Firing never waits for a response; order is preserved only where a
//!   session gate forces it
//! - Per-request failures go to the listener; only archive and task
//!   failures end a run

pub mod connection;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod exchange;
pub mod listener;
pub mod request;
pub mod runner;

pub use dispatcher::Dispatcher;
pub use encoder::RequestEncoder;
pub use error::{EncodeError, ExchangeError, ReplayError};
pub use listener::{FanoutListener, ReplayStats, ResultListener, SampleResult, StatsSnapshot, TracingListener};
pub use request::{ExpectedResponse, PostData, ReplayItem, ReplayRequest};
pub use runner::{replay_archive, RunSummary};
