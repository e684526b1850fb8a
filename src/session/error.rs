//! Session emulation errors.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation requires a tracked session, request has none")]
    Stateless,

    #[error("session store lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("session gate not acquired within {0:?}")]
    GateTimeout(Duration),
}
