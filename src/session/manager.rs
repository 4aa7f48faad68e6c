//! Session lifecycle: issue, validate-and-rotate, revoke.
//!
//! The client only ever sees an opaque session id. The signed token lives in
//! the [`SessionStore`] under that id and is re-signed on every successful
//! validation, so a leaked stored token is good for one request window while
//! the client-visible id stays stable.
//!
//! # Validation flow
//!
//! ```text
//! Start → CredentialExtracted → TokenDecoded → StoreChecked → Rotated → Admitted
//!                          \____________\____________\___________\→ Rejected
//! ```
//!
//! 1. Look up the stored token for the presented id (absent → reject).
//! 2. Decode it with the codec (any rejection kind → reject).
//! 3. Compare the embedded internal token in constant time, and require the
//!    embedded `uid` to equal the presented id.
//! 4. Re-encode with the same `uid`, overwrite the store entry with a fresh TTL.
//!
//! Concurrent requests on one session race on step 4; the last writer wins.
//! There is no per-session lock.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

use super::audit::{self, AuditEvent};
use super::store::SessionStore;
use crate::token::claims::{TOKEN_ID, TOKEN_TYPE, USER_ID};
use crate::token::{Claims, TokenCodec};
use crate::{Error, Result};

/// `token_type` of session tokens
pub const SESSION_TOKEN_TYPE: &str = "session";
/// Claim holding the shared internal token
pub const INTERNAL_TOKEN_CLAIM: &str = "token";
/// Claim holding the session id the token is stored under
pub const SESSION_ID_CLAIM: &str = "uid";
/// Claim holding the client address at issuance
pub const CLIENT_IP_CLAIM: &str = "ip";
/// Claim holding the session lifetime in minutes
pub const AGE_CLAIM: &str = "age";

/// Progress of one validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    /// Nothing checked yet
    Start,
    /// A session id was presented and its stored token fetched
    CredentialExtracted,
    /// The stored token decoded and verified
    TokenDecoded,
    /// Internal token and session id binding checked
    StoreChecked,
    /// Replacement token persisted
    Rotated,
    /// Request may proceed
    Admitted,
}

impl AuthStage {
    /// Stable name used in audit records
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::CredentialExtracted => "credential_extracted",
            Self::TokenDecoded => "token_decoded",
            Self::StoreChecked => "store_checked",
            Self::Rotated => "rotated",
            Self::Admitted => "admitted",
        }
    }
}

/// An issued or freshly rotated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque, client-visible session id
    pub id: String,
    /// Owner of the session
    pub user_id: String,
    /// Client address recorded at issuance
    pub client_ip: Option<String>,
    /// Remaining lifetime; also the cookie max-age
    pub ttl: Duration,
    /// `jti` of the token now stored for this session
    pub token_id: String,
}

/// Orchestrates session issuance, validation with rotation, and revocation.
pub struct SessionManager {
    codec: Arc<TokenCodec>,
    store: Arc<dyn SessionStore>,
    internal_token: String,
    max_age: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("codec", &self.codec)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the codec cannot sign, the internal token
    /// is empty, or `max_age` is under a minute.
    pub fn new(
        codec: Arc<TokenCodec>,
        store: Arc<dyn SessionStore>,
        internal_token: impl Into<String>,
        max_age: Duration,
    ) -> Result<Self> {
        if !codec.can_sign() {
            return Err(Error::Config(
                "session validation re-signs tokens and needs a signing key".to_string(),
            ));
        }
        let internal_token = internal_token.into();
        if internal_token.is_empty() {
            return Err(Error::Config("internal token must not be empty".to_string()));
        }
        if max_age.as_secs() < 60 {
            return Err(Error::Config("session max age must be at least one minute".to_string()));
        }

        Ok(Self {
            codec,
            store,
            internal_token,
            max_age,
        })
    }

    /// Generate a 128-bit random session id, hex encoded.
    #[must_use]
    pub fn generate_session_id() -> String {
        let random_bytes: [u8; 16] = rand::rng().random();
        hex::encode(random_bytes)
    }

    /// Configured session lifetime, rounded up to whole minutes.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(age_minutes(self.max_age) * 60)
    }

    /// Start a session for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the token cannot be persisted,
    /// or a signing error if encoding fails.
    pub async fn issue(&self, user_id: &str, client_ip: Option<&str>) -> Result<Session> {
        let session_id = Self::generate_session_id();
        let session = self
            .persist(&session_id, user_id, client_ip, age_minutes(self.max_age))
            .await?;

        debug!(user_id, "Issued session");
        audit::emit(&AuditEvent::issued(
            user_id,
            &session.id,
            Some(&session.token_id),
            client_ip,
        ));
        Ok(session)
    }

    /// Validate the session behind `session_id` and rotate its token.
    ///
    /// The returned session carries the same id. `client_ip` is the address
    /// of the current request and replaces the recorded one; when unknown the
    /// recorded address is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] for any credential failure,
    /// [`Error::StoreUnavailable`] when the store cannot be reached, and
    /// signing or crypto errors for faults on this side.
    pub async fn validate_and_rotate(&self, session_id: &str, client_ip: Option<&str>) -> Result<Session> {
        let mut stage = AuthStage::Start;
        let result = self.rotate(session_id, client_ip, &mut stage).await;

        match &result {
            Ok(session) => {
                audit::emit(&AuditEvent::rotated(&session.user_id, session_id, Some(&session.token_id)));
            }
            Err(e) => {
                if e.is_infrastructure() {
                    error!(stage = stage.as_str(), error = %e, "Session validation failed");
                } else {
                    warn!(stage = stage.as_str(), reason = %e, "Session rejected");
                }
                audit::emit(&AuditEvent::rejected(stage.as_str(), e.to_string()).with_session(session_id));
            }
        }
        result
    }

    /// Delete a session.
    ///
    /// Returns `true` if the session existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn revoke(&self, session_id: &str) -> Result<bool> {
        let removed = self.store.delete(session_id).await?;
        if removed {
            audit::emit(&AuditEvent::revoked(session_id, None));
        }
        Ok(removed)
    }

    /// Extend a session's lifetime without re-signing its token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be reached.
    pub async fn touch(&self, session_id: &str) -> Result<bool> {
        self.store.expire(session_id, self.max_age()).await
    }

    async fn rotate(&self, session_id: &str, client_ip: Option<&str>, stage: &mut AuthStage) -> Result<Session> {
        if session_id.is_empty() {
            return Err(Error::NotAuthenticated("no session id presented".to_string()));
        }

        let stored = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotAuthenticated("no such session".to_string()))?;
        *stage = AuthStage::CredentialExtracted;

        let claims = self.codec.decode(&stored).map_err(|e| match e {
            Error::Token(kind) => Error::NotAuthenticated(format!("stored token rejected: {kind}")),
            other => other,
        })?;
        *stage = AuthStage::TokenDecoded;

        let embedded = claims.get_str(INTERNAL_TOKEN_CLAIM).unwrap_or_default();
        if !secrets_match(embedded, &self.internal_token) {
            return Err(Error::NotAuthenticated("internal token mismatch".to_string()));
        }
        if claims.get_str(SESSION_ID_CLAIM) != Some(session_id) {
            return Err(Error::NotAuthenticated("session id binding mismatch".to_string()));
        }
        let user_id = claims
            .user_id()
            .ok_or_else(|| Error::NotAuthenticated("session token has no user_id".to_string()))?;
        *stage = AuthStage::StoreChecked;

        let minutes = claims
            .get_i64(AGE_CLAIM)
            .and_then(|m| u64::try_from(m).ok())
            .filter(|m| *m > 0)
            .unwrap_or_else(|| age_minutes(self.max_age));

        let session = self
            .persist(
                session_id,
                &user_id,
                client_ip.or_else(|| claims.get_str(CLIENT_IP_CLAIM)),
                minutes,
            )
            .await?;
        *stage = AuthStage::Rotated;

        debug!(user_id = %session.user_id, "Rotated session token");
        *stage = AuthStage::Admitted;
        Ok(session)
    }

    /// Encode a session token and write it under `session_id`.
    async fn persist(
        &self,
        session_id: &str,
        user_id: &str,
        client_ip: Option<&str>,
        minutes: u64,
    ) -> Result<Session> {
        let ttl = Duration::from_secs(minutes.saturating_mul(60));
        let token_id = uuid::Uuid::new_v4().to_string();

        let mut claims = Claims::new()
            .with(USER_ID, user_id)
            .with(INTERNAL_TOKEN_CLAIM, self.internal_token.as_str())
            .with(SESSION_ID_CLAIM, session_id)
            .with(AGE_CLAIM, minutes)
            .with(TOKEN_TYPE, SESSION_TOKEN_TYPE)
            .with(TOKEN_ID, token_id.as_str());
        if let Some(ip) = client_ip {
            claims.insert(CLIENT_IP_CLAIM, ip);
        }

        let token = self.codec.encode(&claims, Some(ttl))?;
        self.store.set(session_id, &token, ttl).await?;

        Ok(Session {
            id: session_id.to_string(),
            user_id: user_id.to_string(),
            client_ip: client_ip.map(str::to_string),
            ttl,
            token_id,
        })
    }
}

fn age_minutes(max_age: Duration) -> u64 {
    max_age.as_secs().div_ceil(60).max(1)
}

/// Equality that does not exit early on the first differing byte.
fn secrets_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyMaterial;
    use crate::session::store::InMemorySessionStore;

    const INTERNAL: &str = "internal-shared-secret";

    fn codec() -> Arc<TokenCodec> {
        Arc::new(TokenCodec::new(
            KeyMaterial::hs256(b"manager-test-secret"),
            "token-gate",
            Duration::from_secs(10),
            Duration::from_secs(3600),
        ))
    }

    fn manager_with(store: Arc<dyn SessionStore>) -> SessionManager {
        SessionManager::new(codec(), store, INTERNAL, Duration::from_secs(30 * 60)).unwrap()
    }

    /// Store whose every call fails like an unreachable server.
    struct DownStore;

    #[async_trait::async_trait]
    impl SessionStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
    }

    #[test]
    fn session_ids_are_128_bit_hex_and_unique() {
        let a = SessionManager::generate_session_id();
        let b = SessionManager::generate_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn new_rejects_verify_only_codec() {
        let public = include_str!("../../tests/fixtures/rsa_public.pem");
        let verify_only = Arc::new(TokenCodec::new(
            KeyMaterial::rs256(public, None).unwrap(),
            "token-gate",
            Duration::from_secs(10),
            Duration::from_secs(60),
        ));
        let err = SessionManager::new(
            verify_only,
            Arc::new(InMemorySessionStore::new()),
            INTERNAL,
            Duration::from_secs(1800),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn new_rejects_empty_internal_token() {
        let err = SessionManager::new(
            codec(),
            Arc::new(InMemorySessionStore::new()),
            "",
            Duration::from_secs(1800),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn issue_stores_signed_token_not_the_id() {
        // GIVEN: a manager over an in-memory store
        let store = Arc::new(InMemorySessionStore::new());
        let manager = manager_with(store.clone());

        // WHEN: a session is issued
        let session = manager.issue("user-1", Some("10.0.0.7")).await.unwrap();

        // THEN: the store holds a token whose claims bind it to the id
        let stored = store.get(&session.id).await.unwrap().unwrap();
        assert_ne!(stored, session.id);
        let claims = codec().decode(&stored).unwrap();
        assert_eq!(claims.get_str(SESSION_ID_CLAIM), Some(session.id.as_str()));
        assert_eq!(claims.get_str(INTERNAL_TOKEN_CLAIM), Some(INTERNAL));
        assert_eq!(claims.get_str(CLIENT_IP_CLAIM), Some("10.0.0.7"));
        assert_eq!(claims.get_i64(AGE_CLAIM), Some(30));
        assert_eq!(claims.token_type(), Some(SESSION_TOKEN_TYPE));
        assert_eq!(claims.token_id(), Some(session.token_id.as_str()));
        assert_eq!(session.ttl, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn rotation_records_the_current_client_address() {
        // GIVEN: a session issued from one address
        let store = Arc::new(InMemorySessionStore::new());
        let manager = manager_with(store.clone());
        let session = manager.issue("user-1", Some("10.0.0.7")).await.unwrap();

        // WHEN: it is used from another address, then from an unknown one
        let moved = manager.validate_and_rotate(&session.id, Some("10.0.0.8")).await.unwrap();
        let unknown = manager.validate_and_rotate(&session.id, None).await.unwrap();

        // THEN: the latest known address is what the stored token carries
        assert_eq!(moved.client_ip.as_deref(), Some("10.0.0.8"));
        assert_eq!(unknown.client_ip.as_deref(), Some("10.0.0.8"));
        let stored = store.get(&session.id).await.unwrap().unwrap();
        let claims = codec().decode(&stored).unwrap();
        assert_eq!(claims.get_str(CLIENT_IP_CLAIM), Some("10.0.0.8"));
    }

    #[tokio::test]
    async fn two_rotations_keep_id_but_change_stored_token() {
        // GIVEN: an issued session
        let store = Arc::new(InMemorySessionStore::new());
        let manager = manager_with(store.clone());
        let session = manager.issue("user-1", None).await.unwrap();
        let initial = store.get(&session.id).await.unwrap().unwrap();

        // WHEN: validated twice in a row
        let first = manager.validate_and_rotate(&session.id, None).await.unwrap();
        let after_first = store.get(&session.id).await.unwrap().unwrap();
        let second = manager.validate_and_rotate(&session.id, None).await.unwrap();
        let after_second = store.get(&session.id).await.unwrap().unwrap();

        // THEN: the client-visible id is stable while the stored token changes
        assert_eq!(first.id, session.id);
        assert_eq!(second.id, session.id);
        assert_eq!(second.user_id, "user-1");
        assert_ne!(initial, after_first);
        assert_ne!(after_first, after_second);
        assert_ne!(first.token_id, second.token_id);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let manager = manager_with(Arc::new(InMemorySessionStore::new()));
        let err = manager.validate_and_rotate("deadbeef", None).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn empty_session_id_is_rejected() {
        let manager = manager_with(Arc::new(InMemorySessionStore::new()));
        assert!(matches!(
            manager.validate_and_rotate("", None).await,
            Err(Error::NotAuthenticated(_))
        ));
    }

    #[tokio::test]
    async fn token_stored_under_another_id_is_rejected() {
        // GIVEN: a valid token copied under a different session id
        let store = Arc::new(InMemorySessionStore::new());
        let manager = manager_with(store.clone());
        let session = manager.issue("user-1", None).await.unwrap();
        let token = store.get(&session.id).await.unwrap().unwrap();
        store.set("attacker-chosen-id", &token, Duration::from_secs(60)).await.unwrap();

        // WHEN: the other id is presented
        let err = manager.validate_and_rotate("attacker-chosen-id", None).await.unwrap_err();

        // THEN: the uid binding check rejects it
        assert!(err.to_string().contains("binding"));
    }

    #[tokio::test]
    async fn wrong_internal_token_is_rejected() {
        // GIVEN: a session minted by a manager with a different internal token
        let store = Arc::new(InMemorySessionStore::new());
        let foreign = SessionManager::new(codec(), store.clone(), "other-secret", Duration::from_secs(1800)).unwrap();
        let session = foreign.issue("user-1", None).await.unwrap();

        // WHEN: validated by our manager
        let err = manager_with(store).validate_and_rotate(&session.id, None).await.unwrap_err();

        // THEN
        assert!(err.to_string().contains("internal token"));
    }

    #[tokio::test]
    async fn garbage_stored_token_is_rejected() {
        let store = Arc::new(InMemorySessionStore::new());
        store.set("sid", "not-a-jwt", Duration::from_secs(60)).await.unwrap();
        let err = manager_with(store).validate_and_rotate("sid", None).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        // GIVEN: a manager whose store is down
        let manager = manager_with(Arc::new(DownStore));

        // WHEN/THEN: nothing is admitted or issued
        assert!(matches!(
            manager.validate_and_rotate("0123456789abcdef", None).await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(matches!(
            manager.issue("user-1", None).await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn revoke_deletes_the_session() {
        let store = Arc::new(InMemorySessionStore::new());
        let manager = manager_with(store.clone());
        let session = manager.issue("user-1", None).await.unwrap();

        assert!(manager.revoke(&session.id).await.unwrap());
        assert!(!manager.revoke(&session.id).await.unwrap());
        assert!(matches!(
            manager.validate_and_rotate(&session.id, None).await,
            Err(Error::NotAuthenticated(_))
        ));
    }

    #[tokio::test]
    async fn touch_extends_existing_sessions_only() {
        let store = Arc::new(InMemorySessionStore::new());
        let manager = manager_with(store);
        let session = manager.issue("user-1", None).await.unwrap();
        assert!(manager.touch(&session.id).await.unwrap());
        assert!(!manager.touch("missing").await.unwrap());
    }

    #[test]
    fn age_rounds_up_to_whole_minutes() {
        assert_eq!(age_minutes(Duration::from_secs(60)), 1);
        assert_eq!(age_minutes(Duration::from_secs(61)), 2);
        assert_eq!(age_minutes(Duration::from_secs(1800)), 30);
    }

    #[test]
    fn secrets_match_requires_exact_equality() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abd", "abc"));
        assert!(!secrets_match("ab", "abc"));
        assert!(!secrets_match("", "abc"));
    }
}
