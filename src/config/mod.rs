//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ToolConfig (validated, immutable)
//!     → sections cloned into capture, archive, replay and session components
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::ArchiveConfig;
pub use schema::CaptureConfig;
pub use schema::ObservabilityConfig;
pub use schema::ReplayConfig;
pub use schema::SessionConfig;
pub use schema::ToolConfig;
