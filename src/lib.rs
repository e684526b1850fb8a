//! HTTP traffic capture and timing-faithful replay.

pub mod archive;
pub mod capture;
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod replay;
pub mod session;

pub use config::ToolConfig;
pub use lifecycle::Shutdown;
