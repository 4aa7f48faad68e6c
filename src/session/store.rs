//! TTL key-value persistence for encoded session tokens.
//!
//! The [`SessionStore`] trait abstracts over backends. Keys are opaque session
//! ids, values are encoded tokens. Every operation may fail with
//! [`Error::StoreUnavailable`](crate::Error::StoreUnavailable); callers treat
//! that as "cannot authenticate".
//!
//! Two implementations ship:
//!
//! - [`InMemorySessionStore`]: a `DashMap` with lazy eviction plus a
//!   background reaper. Single process only.
//! - [`RedisSessionStore`](super::redis_store::RedisSessionStore): shared
//!   across instances, TTL enforced by Redis.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::Result;

/// Trait abstracting the session storage backend.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// async tasks.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Look up the encoded token for a session id.
    ///
    /// Returns `Ok(None)` if the session does not exist or has expired.
    async fn get(&self, session_id: &str) -> Result<Option<String>>;

    /// Store (or overwrite) the token for a session id with a fresh TTL.
    async fn set(&self, session_id: &str, token: &str, ttl: Duration) -> Result<()>;

    /// Refresh the TTL without touching the value.
    ///
    /// Returns `true` if the session existed.
    async fn expire(&self, session_id: &str, ttl: Duration) -> Result<bool>;

    /// Remove a session.
    ///
    /// Returns `true` if the session existed.
    async fn delete(&self, session_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    token: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory session store backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Entry>,
}

impl InMemorySessionStore {
    /// Create an empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions, expired ones included until reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove all expired sessions. Called periodically by the reaper.
    pub fn reap_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.sessions.len())
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<String>> {
        let Some(entry) = self.sessions.get(session_id).map(|e| e.clone()) else {
            return Ok(None);
        };

        if entry.is_expired() {
            // Lazy eviction: remove on access
            self.sessions.remove(session_id);
            debug!("Lazy-evicted expired session");
            return Ok(None);
        }

        Ok(Some(entry.token))
    }

    async fn set(&self, session_id: &str, token: &str, ttl: Duration) -> Result<()> {
        self.sessions.insert(
            session_id.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn expire(&self, session_id: &str, ttl: Duration) -> Result<bool> {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.remove(session_id).is_some())
    }
}

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn a background task that reaps expired sessions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<InMemorySessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    // `tokio::time::interval` panics on a zero period.
    let interval = interval.max(MIN_REAP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired sessions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_returns_token() {
        // GIVEN: a store with one session
        let store = InMemorySessionStore::new();
        store.set("sid", "tok", Duration::from_secs(60)).await.unwrap();

        // WHEN: we look it up
        let found = store.get("sid").await.unwrap();

        // THEN: the token is returned
        assert_eq!(found.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_session() {
        let store = InMemorySessionStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_overwrites_previous_token() {
        let store = InMemorySessionStore::new();
        store.set("sid", "old", Duration::from_secs(60)).await.unwrap();
        store.set("sid", "new", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("sid").await.unwrap().as_deref(), Some("new"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn get_lazy_evicts_expired_session() {
        // GIVEN: a session that is already expired
        let store = InMemorySessionStore::new();
        store.set("sid", "tok", Duration::ZERO).await.unwrap();

        // WHEN: we try to retrieve it
        let found = store.get("sid").await.unwrap();

        // THEN: it is evicted and None is returned
        assert!(found.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn expire_refreshes_ttl_only_for_live_sessions() {
        let store = InMemorySessionStore::new();
        store.set("live", "tok", Duration::from_secs(60)).await.unwrap();
        store.set("dead", "tok", Duration::ZERO).await.unwrap();

        assert!(store.expire("live", Duration::from_secs(120)).await.unwrap());
        assert!(!store.expire("dead", Duration::from_secs(120)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(120)).await.unwrap());
        assert_eq!(store.get("live").await.unwrap().as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemorySessionStore::new();
        store.set("sid", "tok", Duration::from_secs(60)).await.unwrap();
        assert!(store.delete("sid").await.unwrap());
        assert!(!store.delete("sid").await.unwrap());
        assert!(store.get("sid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reap_expired_removes_only_expired() {
        // GIVEN: one live and two expired sessions
        let store = InMemorySessionStore::new();
        store.set("live", "a", Duration::from_secs(3600)).await.unwrap();
        store.set("dead1", "b", Duration::ZERO).await.unwrap();
        store.set("dead2", "c", Duration::ZERO).await.unwrap();

        // WHEN: reaping
        let reaped = store.reap_expired();

        // THEN: only the live one remains
        assert_eq!(reaped, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let store = Arc::new(InMemorySessionStore::new());
        store.set("dead", "x", Duration::ZERO).await.unwrap();
        let (tx, rx) = tokio::sync::broadcast::channel(1);

        let handle = spawn_reaper(Arc::clone(&store), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reaper_survives_a_zero_interval() {
        // GIVEN: a zero period, which tokio's interval would panic on
        let store = Arc::new(InMemorySessionStore::new());
        store.set("dead", "x", Duration::ZERO).await.unwrap();
        let (tx, rx) = tokio::sync::broadcast::channel(1);

        // WHEN: the reaper runs for a while
        let handle = spawn_reaper(Arc::clone(&store), Duration::ZERO, rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        // THEN: it reaped and exited cleanly instead of panicking
        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap();
        assert!(joined.is_ok());
        assert!(store.is_empty());
    }
}
