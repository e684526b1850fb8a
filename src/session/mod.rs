//! Session emulation subsystem.
//!
//! # Data Flow
//! ```text
//! ReplayRequest → resolver.rs (recorded vs issued session id)
//!     → store.rs (lookup / create / re-key under per-key locks)
//!     → agent.rs (cookies, overrides, gate) attached to the request
//! live response → agent.rs (Set-Cookie) + html.rs (hidden fields)
//! ```
//!
//! # Design Decisions
//! - The store is owned by one replay run and injected; there is no global
//! - Requests without a correlatable session share a stateless agent
//! - Only session-changing requests take the gate

pub mod agent;
pub mod error;
pub mod html;
pub mod key;
pub mod resolver;
pub mod store;

pub use agent::{GatePermit, GateTicket, UserAgent};
pub use error::SessionError;
pub use html::DocumentInfo;
pub use key::SessionKey;
pub use resolver::{Resolution, SessionResolver};
pub use store::ContextStore;
