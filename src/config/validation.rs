//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, addresses parse)
//! - Check that session emulation has something to correlate on
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ToolConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ToolConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is not a valid socket address: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &ToolConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "capture.listen_address", &config.capture.listen_address);
    check_non_empty(&mut errors, "capture.upstream", &config.capture.upstream);
    check_non_zero(&mut errors, "capture.max_body_bytes", config.capture.max_body_bytes as u64);
    check_non_zero(&mut errors, "capture.request_timeout_secs", config.capture.request_timeout_secs);

    check_non_zero(&mut errors, "archive.poll_interval_ms", config.archive.poll_interval_ms);
    check_non_empty(&mut errors, "archive.creator_name", &config.archive.creator_name);

    check_non_empty(&mut errors, "replay.target", &config.replay.target);
    check_non_zero(&mut errors, "replay.poll_interval_ms", config.replay.poll_interval_ms);
    check_non_zero(&mut errors, "replay.drain_poll_ms", config.replay.drain_poll_ms);
    check_non_zero(&mut errors, "replay.request_timeout_secs", config.replay.request_timeout_secs);
    check_non_zero(&mut errors, "replay.max_pending", config.replay.max_pending as u64);

    check_non_empty(&mut errors, "session.cookie_name", &config.session.cookie_name);
    check_non_zero(&mut errors, "session.gate_timeout_ms", config.session.gate_timeout_ms);
    check_non_zero(&mut errors, "session.lock_timeout_ms", config.session.lock_timeout_ms);

    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn check_non_empty(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.trim().is_empty() {
        errors.push(ValidationError::Empty { field });
    }
}

fn check_non_zero(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero { field });
    }
}
