//! Session identity resolution for outgoing replay requests.
//!
//! # Data Flow
//! ```text
//! recorded Cookie (old id) ─┐
//!                           ├→ compare hashes → store lookup / create / re-key
//! expected Set-Cookie (new) ┘                 → (context, blocking flag)
//! ```
//!
//! A request is blocking only when its recorded response changed the session
//! identifier. Re-sending the same value is not a change.

use std::sync::Arc;

use crate::config::SessionConfig;
use crate::replay::request::ReplayRequest;
use crate::session::agent::UserAgent;
use crate::session::error::SessionError;
use crate::session::key::SessionKey;
use crate::session::store::ContextStore;

/// Owning context and gate policy for one request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub agent: Arc<UserAgent>,
    pub blocking: bool,
}

pub struct SessionResolver {
    store: Arc<ContextStore>,
    cookie_name: String,
    adopt_sole_session: bool,
}

impl SessionResolver {
    pub fn new(store: Arc<ContextStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            cookie_name: config.cookie_name.clone(),
            adopt_sole_session: config.adopt_sole_session,
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Session id the client sent during recording.
    fn recorded_key(&self, request: &ReplayRequest) -> Option<SessionKey> {
        request
            .recorded_cookie(&self.cookie_name)
            .filter(|c| !c.value.is_empty())
            .map(|c| SessionKey::from_value(&c.value))
    }

    /// Session id the server issued in the recorded response.
    ///
    /// A deleting Set-Cookie (empty or already expired) issues nothing.
    fn issued_key(&self, request: &ReplayRequest) -> Option<SessionKey> {
        let cookie = request.expected.as_ref()?.set_cookie(&self.cookie_name)?;
        let live_at_issue = cookie
            .expires
            .map_or(true, |at| at.timestamp_millis() > request.timestamp_ms);
        if cookie.value.is_empty() || !live_at_issue {
            return None;
        }
        Some(SessionKey::from_value(&cookie.value))
    }

    pub async fn resolve(&self, request: &ReplayRequest) -> Result<Resolution, SessionError> {
        let old = self.recorded_key(request);
        let new = self.issued_key(request);

        let resolution = match (old, new) {
            (Some(old), Some(new)) if old == new => Resolution {
                agent: self.store.get_or_create(old).await?,
                blocking: false,
            },
            (Some(old), Some(new)) => {
                let agent = if self.store.get(old).await?.is_some() {
                    self.store.rekey(old, new).await?
                } else {
                    self.store.get_or_create(new).await?
                };
                Resolution { agent, blocking: true }
            }
            (None, Some(new)) => Resolution {
                agent: self.store.get_or_create(new).await?,
                blocking: true,
            },
            (Some(old), None) => Resolution {
                agent: self.store.get_or_create(old).await?,
                blocking: false,
            },
            (None, None) => {
                let sole = if self.adopt_sole_session {
                    self.store.sole_agent().await?
                } else {
                    None
                };
                Resolution {
                    agent: sole.unwrap_or_else(|| self.store.stateless()),
                    blocking: false,
                }
            }
        };

        tracing::trace!(
            request = %request.label(),
            session = ?resolution.agent.key(),
            blocking = resolution.blocking,
            "Session resolved"
        );
        Ok(resolution)
    }

    /// Resolve and decorate `request` with its context and gate policy.
    pub async fn attach(&self, request: &mut ReplayRequest) -> Result<(), SessionError> {
        let Resolution { agent, blocking } = self.resolve(request).await?;
        request.session = Some(agent);
        request.blocking = blocking;
        Ok(())
    }
}
