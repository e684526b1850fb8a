//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! capture, archive, session, replay
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!         → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
