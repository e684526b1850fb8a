//! Replay-side stand-in for one recorded client session.
//!
//! # Responsibilities
//! - Hold the live cookie jar the target server built for this session
//! - Hold field overrides harvested from live HTML responses
//! - Provide the gate that serializes session-establishing requests
//!
//! The gate is a FIFO chain of tickets. A ticket is reserved synchronously
//! when a request fires, so blocking requests pass the gate in firing order
//! no matter which exchange task gets polled first.
//!
//! The shared stateless agent rejects every mutation so untracked traffic
//! can use the same call sites without touching shared state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::archive::cookie::{self, Cookie};
use crate::archive::model::Param;
use crate::session::error::SessionError;
use crate::session::key::SessionKey;

#[derive(Debug, Default)]
struct AgentState {
    key: Option<SessionKey>,
    cookies: Vec<Cookie>,
    overrides: HashMap<String, Param>,
}

/// One session context.
#[derive(Debug)]
pub struct UserAgent {
    state: Mutex<AgentState>,
    /// Released when the most recently reserved ticket lets go.
    gate_tail: Mutex<Option<oneshot::Receiver<()>>>,
    tracked: bool,
}

impl UserAgent {
    /// A tracked context for `key`.
    pub fn new(key: SessionKey) -> Self {
        Self {
            state: Mutex::new(AgentState {
                key: Some(key),
                ..AgentState::default()
            }),
            gate_tail: Mutex::new(None),
            tracked: true,
        }
    }

    /// The context used by requests without a correlatable session.
    pub fn stateless() -> Self {
        Self {
            state: Mutex::new(AgentState::default()),
            gate_tail: Mutex::new(None),
            tracked: false,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    pub fn key(&self) -> Option<SessionKey> {
        self.state.lock().expect("user agent mutex poisoned").key
    }

    pub(crate) fn set_key(&self, key: SessionKey) {
        self.state.lock().expect("user agent mutex poisoned").key = Some(key);
    }

    fn ensure_tracked(&self) -> Result<(), SessionError> {
        if self.tracked {
            Ok(())
        } else {
            Err(SessionError::Stateless)
        }
    }

    /// Store a cookie, replacing any cookie in the same slot.
    ///
    /// An already expired cookie only removes its slot.
    pub fn set_cookie(&self, cookie: Cookie, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.ensure_tracked()?;
        let mut state = self.state.lock().expect("user agent mutex poisoned");
        state.cookies.retain(|c| !c.same_slot(&cookie));
        if !cookie.is_expired(now) {
            state.cookies.push(cookie);
        }
        Ok(())
    }

    /// Apply every `Set-Cookie` value of a live response. Returns how many parsed.
    pub fn apply_set_cookies<'a>(
        &self,
        values: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> Result<usize, SessionError> {
        self.ensure_tracked()?;
        let mut applied = 0;
        for value in values {
            if let Some(cookie) = cookie::parse_set_cookie(value, now) {
                self.set_cookie(cookie, now)?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Cookies to present for `uri`, most specific path first.
    pub fn cookies_for_uri(&self, uri: &str, now: DateTime<Utc>) -> Vec<Cookie> {
        let state = self.state.lock().expect("user agent mutex poisoned");
        let mut matched: Vec<Cookie> = state
            .cookies
            .iter()
            .filter(|c| c.matches_path(uri) && !c.is_expired(now))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.path_len().cmp(&a.path_len()));
        matched
    }

    /// Live value of the cookie named `name`, if the server has set one.
    pub fn cookie_value(&self, name: &str) -> Option<String> {
        let state = self.state.lock().expect("user agent mutex poisoned");
        state
            .cookies
            .iter()
            .rev()
            .find(|c| c.name == name)
            .map(|c| c.value.clone())
    }

    pub fn cookies(&self) -> Vec<Cookie> {
        self.state.lock().expect("user agent mutex poisoned").cookies.clone()
    }

    pub fn set_override(&self, param: Param) -> Result<(), SessionError> {
        self.ensure_tracked()?;
        let mut state = self.state.lock().expect("user agent mutex poisoned");
        state.overrides.insert(param.name.clone(), param);
        Ok(())
    }

    pub fn override_for(&self, name: &str) -> Option<Param> {
        let state = self.state.lock().expect("user agent mutex poisoned");
        state.overrides.get(name).cloned()
    }

    /// Reserve the next place in the gate queue.
    ///
    /// Reservation never waits; the wait happens in `GateTicket::acquire`.
    pub fn reserve_gate(&self) -> Result<GateTicket, SessionError> {
        self.ensure_tracked()?;
        let (release, next) = oneshot::channel();
        let ahead = self
            .gate_tail
            .lock()
            .expect("user agent gate mutex poisoned")
            .replace(next);
        Ok(GateTicket {
            ahead,
            release: Some(release),
        })
    }

    /// Copy state from `other` that this context does not already hold.
    pub(crate) fn absorb(&self, other: &UserAgent) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (cookies, overrides) = {
            let theirs = other.state.lock().expect("user agent mutex poisoned");
            (theirs.cookies.clone(), theirs.overrides.clone())
        };
        let mut state = self.state.lock().expect("user agent mutex poisoned");
        for cookie in cookies {
            if !state.cookies.iter().any(|c| c.same_slot(&cookie)) {
                state.cookies.push(cookie);
            }
        }
        for (name, param) in overrides {
            state.overrides.entry(name).or_insert(param);
        }
    }
}

/// A reserved place in a session gate queue.
///
/// Dropping a ticket that never acquired keeps later tickets waiting until
/// the holder ahead of it releases.
#[derive(Debug)]
pub struct GateTicket {
    ahead: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
}

/// Holds the session gate until dropped.
#[derive(Debug)]
pub struct GatePermit {
    _release: oneshot::Sender<()>,
}

impl GateTicket {
    /// Wait, at most `timeout`, for every earlier ticket to release.
    pub async fn acquire(mut self, timeout: Duration) -> Result<GatePermit, SessionError> {
        if let Some(ahead) = self.ahead.as_mut() {
            // a dropped sender counts as a release
            if tokio::time::timeout(timeout, ahead).await.is_err() {
                return Err(SessionError::GateTimeout(timeout));
            }
        }
        self.ahead = None;
        match self.release.take() {
            Some(release) => Ok(GatePermit { _release: release }),
            None => Err(SessionError::GateTimeout(timeout)),
        }
    }
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        let (Some(ahead), Some(release)) = (self.ahead.take(), self.release.take()) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = ahead.await;
                    drop(release);
                });
            }
            Err(_) => drop(release),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn agent() -> UserAgent {
        UserAgent::new(SessionKey::from_value("s"))
    }

    #[test]
    fn same_name_keeps_latest_value() {
        let agent = agent();
        let now = Utc::now();
        agent.set_cookie(Cookie::new("JSESSIONID", "one"), now).unwrap();
        agent.set_cookie(Cookie::new("JSESSIONID", "two"), now).unwrap();
        assert_eq!(agent.cookies().len(), 1);
        assert_eq!(agent.cookie_value("JSESSIONID").as_deref(), Some("two"));
    }

    #[test]
    fn expired_cookie_removes_slot() {
        let agent = agent();
        let now = Utc::now();
        agent.set_cookie(Cookie::new("remember", "yes"), now).unwrap();
        agent
            .apply_set_cookies(["remember=; Max-Age=0"], now)
            .unwrap();
        assert!(agent.cookies().is_empty());
    }

    #[test]
    fn cookies_for_uri_filters_and_orders_by_path() {
        let agent = agent();
        let now = Utc::now();
        agent.set_cookie(Cookie::new("root", "r"), now).unwrap();
        agent.set_cookie(Cookie::new("app", "a").with_path("/app"), now).unwrap();
        agent.set_cookie(Cookie::new("deep", "d").with_path("/app/admin"), now).unwrap();
        agent.set_cookie(Cookie::new("other", "o").with_path("/other"), now).unwrap();

        let names: Vec<String> = agent
            .cookies_for_uri("/app/admin/users?page=2", now)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["deep", "app", "root"]);

        let names: Vec<String> = agent
            .cookies_for_uri("/", now)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["root"]);
    }

    #[tokio::test]
    async fn stateless_agent_rejects_mutation() {
        let agent = UserAgent::stateless();
        let now = Utc::now();
        assert!(matches!(
            agent.set_cookie(Cookie::new("a", "b"), now),
            Err(SessionError::Stateless)
        ));
        assert!(matches!(
            agent.set_override(Param::field("csrf", "x")),
            Err(SessionError::Stateless)
        ));
        assert!(matches!(agent.reserve_gate(), Err(SessionError::Stateless)));
        assert!(agent.cookies_for_uri("/", now).is_empty());
    }

    #[tokio::test]
    async fn gate_times_out_while_held() {
        let agent = agent();
        let permit = agent
            .reserve_gate()
            .unwrap()
            .acquire(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(
            agent.reserve_gate().unwrap().acquire(Duration::from_millis(20)).await,
            Err(SessionError::GateTimeout(_))
        ));
        drop(permit);
        assert!(agent
            .reserve_gate()
            .unwrap()
            .acquire(Duration::from_millis(50))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn gate_passes_in_reservation_order() {
        let agent = Arc::new(agent());
        let first = agent.reserve_gate().unwrap();
        let second = agent.reserve_gate().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Poll the later ticket first.
        let later = {
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _permit = second.acquire(Duration::from_secs(2)).await.unwrap();
                order.lock().unwrap().push("second");
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(order.lock().unwrap().is_empty());

        let permit = first.acquire(Duration::from_secs(2)).await.unwrap();
        order.lock().unwrap().push("first");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*order.lock().unwrap(), ["first"]);
        drop(permit);

        later.await.unwrap();
        assert_eq!(*order.lock().unwrap(), ["first", "second"]);
    }

    #[tokio::test]
    async fn timed_out_ticket_keeps_its_place() {
        let agent = agent();
        let held = agent
            .reserve_gate()
            .unwrap()
            .acquire(Duration::from_millis(50))
            .await
            .unwrap();
        let impatient = agent.reserve_gate().unwrap();
        let patient = agent.reserve_gate().unwrap();

        assert!(impatient.acquire(Duration::from_millis(10)).await.is_err());
        assert!(matches!(
            patient.acquire(Duration::from_millis(30)).await,
            Err(SessionError::GateTimeout(_))
        ));

        drop(held);
        assert!(agent
            .reserve_gate()
            .unwrap()
            .acquire(Duration::from_millis(200))
            .await
            .is_ok());
    }

    #[test]
    fn absorb_keeps_own_values() {
        let now = Utc::now();
        let target = agent();
        target.set_cookie(Cookie::new("JSESSIONID", "new"), now).unwrap();
        let source = agent();
        source.set_cookie(Cookie::new("JSESSIONID", "old"), now).unwrap();
        source.set_cookie(Cookie::new("theme", "dark"), now).unwrap();
        source.set_override(Param::field("csrf", "t1")).unwrap();

        target.absorb(&source);
        assert_eq!(target.cookie_value("JSESSIONID").as_deref(), Some("new"));
        assert_eq!(target.cookie_value("theme").as_deref(), Some("dark"));
        assert_eq!(target.override_for("csrf").unwrap().value, "t1");
    }
}
