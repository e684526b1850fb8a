//! Concurrent store of session contexts.
//!
//! # Responsibilities
//! - Map session keys to contexts, creating them on first sight
//! - Re-key a context when the server rotates the session identifier
//! - Bound every lock wait
//!
//! # Design Decisions
//! - Each key owns an independent read/write lock; unrelated sessions never
//!   contend and lookups of one session never block another
//! - Re-keying write-locks both slots in key order, so a reader of either key
//!   sees the context entirely before or entirely after the move
//! - Contexts live as long as the store; the store lives as long as one run

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::observability::metrics;
use crate::session::agent::UserAgent;
use crate::session::error::SessionError;
use crate::session::key::SessionKey;

type Slot = Arc<RwLock<Option<Arc<UserAgent>>>>;

pub struct ContextStore {
    slots: DashMap<SessionKey, Slot>,
    lock_timeout: Duration,
    stateless: Arc<UserAgent>,
    live: AtomicUsize,
}

impl ContextStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            lock_timeout,
            stateless: Arc::new(UserAgent::stateless()),
            live: AtomicUsize::new(0),
        }
    }

    /// The shared context for untracked traffic.
    pub fn stateless(&self) -> Arc<UserAgent> {
        Arc::clone(&self.stateless)
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: SessionKey) -> Slot {
        // Clone out so no map shard guard is held across an await.
        Arc::clone(self.slots.entry(key).or_default().value())
    }

    fn existing_slot(&self, key: &SessionKey) -> Option<Slot> {
        self.slots.get(key).map(|slot| Arc::clone(slot.value()))
    }

    async fn read(&self, slot: Slot) -> Result<OwnedRwLockReadGuard<Option<Arc<UserAgent>>>, SessionError> {
        tokio::time::timeout(self.lock_timeout, slot.read_owned())
            .await
            .map_err(|_| SessionError::LockTimeout(self.lock_timeout))
    }

    async fn write(&self, slot: Slot) -> Result<OwnedRwLockWriteGuard<Option<Arc<UserAgent>>>, SessionError> {
        tokio::time::timeout(self.lock_timeout, slot.write_owned())
            .await
            .map_err(|_| SessionError::LockTimeout(self.lock_timeout))
    }

    fn created(&self, key: SessionKey) -> Arc<UserAgent> {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_session_contexts(live);
        tracing::debug!(session = %key, live, "Session context created");
        Arc::new(UserAgent::new(key))
    }

    /// The context stored under `key`, if any.
    pub async fn get(&self, key: SessionKey) -> Result<Option<Arc<UserAgent>>, SessionError> {
        let Some(slot) = self.existing_slot(&key) else {
            return Ok(None);
        };
        let guard = self.read(slot).await?;
        Ok((*guard).clone())
    }

    /// The context stored under `key`, created if absent.
    pub async fn get_or_create(&self, key: SessionKey) -> Result<Arc<UserAgent>, SessionError> {
        if let Some(agent) = self.get(key).await? {
            return Ok(agent);
        }
        let mut guard = self.write(self.slot(key)).await?;
        if let Some(agent) = guard.as_ref() {
            return Ok(Arc::clone(agent));
        }
        let agent = self.created(key);
        *guard = Some(Arc::clone(&agent));
        Ok(agent)
    }

    /// Move the context under `old` to `new`.
    ///
    /// If `new` is already occupied, that context absorbs the old one's
    /// cookies and overrides and the old context is retired. If `old` holds
    /// nothing, this behaves like `get_or_create(new)`.
    pub async fn rekey(&self, old: SessionKey, new: SessionKey) -> Result<Arc<UserAgent>, SessionError> {
        if old == new {
            return self.get_or_create(new).await;
        }

        let old_slot = self.slot(old);
        let new_slot = self.slot(new);
        let (mut old_guard, mut new_guard) = if old < new {
            let o = self.write(old_slot).await?;
            let n = self.write(new_slot).await?;
            (o, n)
        } else {
            let n = self.write(new_slot).await?;
            let o = self.write(old_slot).await?;
            (o, n)
        };

        let moved = old_guard.take();
        let existing = (*new_guard).clone();
        let agent = match (moved, existing) {
            (Some(moved), Some(existing)) => {
                existing.absorb(&moved);
                let live = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics::set_session_contexts(live);
                metrics::record_rekey("merged");
                tracing::debug!(from = %old, to = %new, "Session context merged into existing");
                existing
            }
            (Some(moved), None) => {
                moved.set_key(new);
                *new_guard = Some(Arc::clone(&moved));
                metrics::record_rekey("moved");
                tracing::debug!(from = %old, to = %new, "Session context re-keyed");
                moved
            }
            (None, Some(existing)) => existing,
            (None, None) => {
                let agent = self.created(new);
                *new_guard = Some(Arc::clone(&agent));
                agent
            }
        };
        Ok(agent)
    }

    /// The only live context, when exactly one exists.
    pub async fn sole_agent(&self) -> Result<Option<Arc<UserAgent>>, SessionError> {
        if self.len() != 1 {
            return Ok(None);
        }
        let slots: Vec<Slot> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        for slot in slots {
            if let Some(agent) = (*self.read(slot).await?).clone() {
                return Ok(Some(agent));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::cookie::Cookie;
    use crate::archive::model::Param;
    use chrono::Utc;

    fn store() -> ContextStore {
        ContextStore::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn creates_once_per_key() {
        let store = store();
        let key = SessionKey::from_value("A");
        let a = store.get_or_create(key).await.unwrap();
        let b = store.get_or_create(key).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
        assert!(store.get(SessionKey::from_value("B")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rekey_moves_state_to_new_key() {
        let store = store();
        let old = SessionKey::from_value("A");
        let new = SessionKey::from_value("B");
        let agent = store.get_or_create(old).await.unwrap();
        agent.set_cookie(Cookie::new("JSESSIONID", "live-1"), Utc::now()).unwrap();
        agent.set_override(Param::field("csrf", "t")).unwrap();

        let moved = store.rekey(old, new).await.unwrap();
        assert!(Arc::ptr_eq(&agent, &moved));
        assert_eq!(moved.key(), Some(new));
        assert!(store.get(old).await.unwrap().is_none());

        let found = store.get(new).await.unwrap().unwrap();
        assert_eq!(found.cookie_value("JSESSIONID").as_deref(), Some("live-1"));
        assert_eq!(found.override_for("csrf").unwrap().value, "t");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn rekey_into_occupied_key_merges() {
        let store = store();
        let old = SessionKey::from_value("A");
        let new = SessionKey::from_value("B");
        let first = store.get_or_create(old).await.unwrap();
        first.set_cookie(Cookie::new("theme", "dark"), Utc::now()).unwrap();
        let second = store.get_or_create(new).await.unwrap();

        let merged = store.rekey(old, new).await.unwrap();
        assert!(Arc::ptr_eq(&merged, &second));
        assert_eq!(merged.cookie_value("theme").as_deref(), Some("dark"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn rekey_waits_for_readers_and_times_out() {
        let store = Arc::new(ContextStore::new(Duration::from_millis(30)));
        let old = SessionKey::from_value("A");
        let new = SessionKey::from_value("B");
        store.get_or_create(old).await.unwrap();

        let held = store.read(store.slot(old)).await.unwrap();
        assert!(matches!(store.rekey(old, new).await, Err(SessionError::LockTimeout(_))));
        drop(held);
        assert!(store.rekey(old, new).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_readers_never_see_both_or_neither_mid_move() {
        let store = Arc::new(store());
        let old = SessionKey::from_value("A");
        let new = SessionKey::from_value("B");
        store.get_or_create(old).await.unwrap();

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let a = store.get(old).await.unwrap();
                    let b = store.get(new).await.unwrap();
                    // old is read first; once it is gone new must be visible
                    if a.is_none() {
                        assert!(b.is_some());
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        tokio::task::yield_now().await;
        store.rekey(old, new).await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn sole_agent_only_when_exactly_one() {
        let store = store();
        assert!(store.sole_agent().await.unwrap().is_none());
        let a = store.get_or_create(SessionKey::from_value("A")).await.unwrap();
        assert!(Arc::ptr_eq(&store.sole_agent().await.unwrap().unwrap(), &a));
        store.get_or_create(SessionKey::from_value("B")).await.unwrap();
        assert!(store.sole_agent().await.unwrap().is_none());
    }
}
