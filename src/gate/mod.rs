//! Request admission.
//!
//! Two gates share one outcome type, [`AuthenticatedIdentity`]:
//!
//! - [`BearerGate`]: decodes an `Authorization: Bearer` token directly. No
//!   store, no rotation.
//! - [`CookieGate`]: validates and rotates a server-side session through the
//!   [`SessionManager`], or, in insecure mode, trusts the client-supplied
//!   user id as-is.
//!
//! [`authorize`] then checks required scopes. "Who are you" failures surface
//! as [`Error::NotAuthenticated`] (401) and "you may not" as
//! [`Error::InsufficientScope`] (403). The axum hooks live in [`middleware`].

pub mod identity;
pub mod middleware;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;
use tracing::{debug, warn};

pub use identity::{AuthScheme, AuthenticatedIdentity};
pub use middleware::{BearerAuth, SessionAuth, require_bearer, require_session};

use crate::session::{AuthStage, SessionManager};
use crate::session::audit::{self, AuditEvent};
use crate::token::TokenCodec;
use crate::{Error, Result};

/// Cookie and header carrying the user id (camel case)
pub const USER_ID_COOKIE: &str = "userId";
/// Cookie carrying the user id (snake case)
pub const USER_ID_COOKIE_SNAKE: &str = "user_id";

/// Validates bearer tokens.
#[derive(Debug, Clone)]
pub struct BearerGate {
    codec: Arc<TokenCodec>,
}

impl BearerGate {
    /// Create a gate over `codec`.
    #[must_use]
    pub fn new(codec: Arc<TokenCodec>) -> Self {
        Self { codec }
    }

    /// Authenticate a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] if the token is absent, rejected by
    /// the codec, or carries no `user_id`. Codec faults on this side
    /// propagate unchanged.
    pub fn authenticate(&self, token: Option<&str>) -> Result<AuthenticatedIdentity> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Err(reject(AuthStage::Start.as_str(), "missing bearer token"));
        };

        let claims = self.codec.decode(token).map_err(|e| match e {
            Error::Token(kind) => reject(AuthStage::CredentialExtracted.as_str(), &kind.to_string()),
            other => other,
        })?;

        let Some(user_id) = claims.user_id() else {
            return Err(reject(AuthStage::TokenDecoded.as_str(), "token has no user_id"));
        };

        debug!(user_id = %user_id, "Authenticated bearer token");
        Ok(AuthenticatedIdentity::from_bearer(user_id, &claims))
    }
}

/// Credentials a client may present for the session scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    /// Opaque session id (cookie or header)
    pub session_id: Option<String>,
    /// Client-claimed user id (cookie or header); trusted only in insecure mode
    pub user_id: Option<String>,
    /// Client address, when known. Never read from request headers here;
    /// the hook fills it from the connection (see [`SessionAuth::client_ip`]).
    pub client_ip: Option<String>,
}

impl SessionCredentials {
    /// Read credentials from cookies, falling back to same-named headers.
    ///
    /// `client_ip` is left empty.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, cookie_name: &str) -> Self {
        let jar = CookieJar::from_headers(headers);

        let session_id = jar
            .get(cookie_name)
            .map(|c| c.value().to_string())
            .or_else(|| header_value(headers, cookie_name))
            .filter(|v| !v.is_empty());

        let user_id = jar
            .get(USER_ID_COOKIE)
            .or_else(|| jar.get(USER_ID_COOKIE_SNAKE))
            .map(|c| c.value().to_string())
            .or_else(|| header_value(headers, USER_ID_COOKIE))
            .filter(|v| !v.is_empty());

        Self {
            session_id,
            user_id,
            client_ip: None,
        }
    }
}

/// Client address claimed by a reverse proxy: first `X-Forwarded-For` entry,
/// else `X-Real-IP`. Client-controlled unless a trusted proxy overwrites it.
#[must_use]
pub fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|v| !v.is_empty())
        .or_else(|| header_value(headers, "x-real-ip"))
        .filter(|v| !v.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Admits requests carrying a server-side session.
#[derive(Debug, Clone)]
pub struct CookieGate {
    manager: Option<Arc<SessionManager>>,
}

impl CookieGate {
    /// Validate and rotate sessions through `manager`.
    #[must_use]
    pub fn secure(manager: Arc<SessionManager>) -> Self {
        Self {
            manager: Some(manager),
        }
    }

    /// Trust the client-supplied user id without any validation.
    ///
    /// Only for trusted networks and local development.
    #[must_use]
    pub fn insecure() -> Self {
        warn!("Session validation DISABLED: client-supplied user ids are trusted as-is");
        Self { manager: None }
    }

    /// Whether sessions are validated
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.manager.is_some()
    }

    /// The session manager, when validating
    #[must_use]
    pub fn manager(&self) -> Option<&Arc<SessionManager>> {
        self.manager.as_ref()
    }

    /// Authenticate session credentials.
    ///
    /// A store outage is logged as an infrastructure fault and then reported
    /// as [`Error::NotAuthenticated`], so it never admits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] for missing or invalid credentials
    /// and store outages; signing faults propagate unchanged.
    pub async fn authenticate(&self, credentials: &SessionCredentials) -> Result<AuthenticatedIdentity> {
        let Some(manager) = &self.manager else {
            let Some(user_id) = credentials.user_id.clone() else {
                return Err(reject(AuthStage::Start.as_str(), "insecure mode: no user id presented"));
            };
            audit::emit(
                &AuditEvent::insecure_admitted(&user_id)
                    .with_client_ip(credentials.client_ip.as_deref()),
            );
            return Ok(AuthenticatedIdentity::insecure(
                user_id,
                credentials.session_id.clone(),
            ));
        };

        let Some(session_id) = credentials.session_id.as_deref() else {
            return Err(reject(AuthStage::Start.as_str(), "missing session id"));
        };

        match manager
            .validate_and_rotate(session_id, credentials.client_ip.as_deref())
            .await
        {
            Ok(session) => Ok(AuthenticatedIdentity::from_session(session)),
            Err(Error::NotAuthenticated(reason) | Error::StoreUnavailable(reason)) => {
                Err(Error::NotAuthenticated(reason))
            }
            Err(e) => Err(e),
        }
    }
}

/// Require every scope in `required` to be granted.
///
/// An identity without a scope claim satisfies only an empty requirement.
///
/// # Errors
///
/// Returns [`Error::InsufficientScope`] naming the missing scopes.
pub fn authorize<S: AsRef<str>>(identity: &AuthenticatedIdentity, required: &[S]) -> Result<()> {
    let missing: Vec<String> = required
        .iter()
        .map(AsRef::as_ref)
        .filter(|scope| !identity.has_scope(scope))
        .map(str::to_string)
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    warn!(user_id = %identity.user_id(), missing = ?missing, "Insufficient scope");
    audit::emit(&AuditEvent::scope_denied(identity.user_id(), &missing));
    Err(Error::insufficient_scope(missing))
}

fn reject(stage: &'static str, reason: &str) -> Error {
    warn!(stage, reason, "Credential rejected");
    audit::emit(&AuditEvent::rejected(stage, reason));
    Error::NotAuthenticated(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::HeaderValue;
    use serde_json::json;

    use crate::keys::KeyMaterial;
    use crate::session::{InMemorySessionStore, SessionStore};
    use crate::token::Claims;

    fn codec() -> Arc<TokenCodec> {
        Arc::new(TokenCodec::new(
            KeyMaterial::hs256(b"gate-test-secret"),
            "token-gate",
            Duration::from_secs(10),
            Duration::from_secs(600),
        ))
    }

    fn bearer_identity(scopes: serde_json::Value) -> AuthenticatedIdentity {
        let codec = codec();
        let token = codec
            .encode(&Claims::new().with("user_id", "u1").with("scopes", scopes), None)
            .unwrap();
        BearerGate::new(codec).authenticate(Some(&token)).unwrap()
    }

    struct DownStore;

    #[async_trait::async_trait]
    impl SessionStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(Error::StoreUnavailable("timed out".to_string()))
        }
        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Err(Error::StoreUnavailable("timed out".to_string()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool> {
            Err(Error::StoreUnavailable("timed out".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            Err(Error::StoreUnavailable("timed out".to_string()))
        }
    }

    fn secure_gate(store: Arc<dyn SessionStore>) -> CookieGate {
        let manager = SessionManager::new(codec(), store, "internal", Duration::from_secs(600)).unwrap();
        CookieGate::secure(Arc::new(manager))
    }

    #[test]
    fn bearer_requires_a_token() {
        let err = BearerGate::new(codec()).authenticate(None).unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }

    #[test]
    fn bearer_rejection_kinds_become_not_authenticated() {
        let err = BearerGate::new(codec()).authenticate(Some("a.b.c")).unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }

    #[test]
    fn bearer_requires_user_id() {
        let codec = codec();
        let token = codec.encode(&Claims::new().with("email", "x@y"), None).unwrap();
        let err = BearerGate::new(codec).authenticate(Some(&token)).unwrap_err();
        assert!(err.to_string().contains("user_id"));
    }

    #[test]
    fn scope_subset_is_denied_and_exact_match_admitted() {
        // GIVEN: an identity holding only `read`
        let identity = bearer_identity(json!(["read"]));

        // WHEN/THEN: `{read, write}` is denied with `write` named
        let err = authorize(&identity, &["read", "write"]).unwrap_err();
        assert!(matches!(&err, Error::InsufficientScope { missing } if missing == &["write".to_string()]));

        // AND: `{read}` is admitted
        assert!(authorize(&identity, &["read"]).is_ok());
    }

    #[test]
    fn identity_without_scopes_only_passes_empty_requirement() {
        let codec = codec();
        let token = codec.encode(&Claims::new().with("user_id", "u1"), None).unwrap();
        let identity = BearerGate::new(codec).authenticate(Some(&token)).unwrap();
        assert!(identity.scopes().is_none());
        assert!(authorize::<&str>(&identity, &[]).is_ok());
        assert!(authorize(&identity, &["read"]).is_err());
    }

    #[tokio::test]
    async fn secure_gate_rotates_valid_session() {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let gate = secure_gate(store);
        let session = gate.manager().unwrap().issue("u1", None).await.unwrap();

        let identity = gate
            .authenticate(&SessionCredentials {
                session_id: Some(session.id.clone()),
                ..SessionCredentials::default()
            })
            .await
            .unwrap();

        assert_eq!(identity.user_id(), "u1");
        assert_eq!(identity.scheme(), AuthScheme::Session);
        assert_eq!(identity.session().map(|s| s.id.as_str()), Some(session.id.as_str()));
    }

    #[tokio::test]
    async fn secure_gate_ignores_client_claimed_user_id() {
        let gate = secure_gate(Arc::new(InMemorySessionStore::new()));
        let err = gate
            .authenticate(&SessionCredentials {
                user_id: Some("admin".to_string()),
                ..SessionCredentials::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn store_outage_is_not_authenticated() {
        // GIVEN: a secure gate whose store is unreachable
        let gate = secure_gate(Arc::new(DownStore));

        // WHEN: a session id is presented
        let result = gate
            .authenticate(&SessionCredentials {
                session_id: Some("0123456789abcdef0123456789abcdef".to_string()),
                ..SessionCredentials::default()
            })
            .await;

        // THEN: the request is refused as unauthenticated
        assert!(matches!(result, Err(Error::NotAuthenticated(_))));
    }

    #[tokio::test]
    async fn insecure_gate_trusts_user_id_but_requires_one() {
        let gate = CookieGate::insecure();
        assert!(!gate.is_secure());

        let identity = gate
            .authenticate(&SessionCredentials {
                user_id: Some("u9".to_string()),
                ..SessionCredentials::default()
            })
            .await
            .unwrap();
        assert_eq!(identity.scheme(), AuthScheme::Insecure);
        assert_eq!(identity.user_id(), "u9");

        let err = gate.authenticate(&SessionCredentials::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }

    #[test]
    fn credentials_prefer_cookies_then_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("login-token=abc; user_id=u-snake"),
        );
        headers.insert("userid", HeaderValue::from_static("u-header"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));

        let creds = SessionCredentials::from_headers(&headers, "login-token");

        assert_eq!(creds.session_id.as_deref(), Some("abc"));
        assert_eq!(creds.user_id.as_deref(), Some("u-snake"));
        assert!(creds.client_ip.is_none());
        assert_eq!(forwarded_client_ip(&headers).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn forwarded_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        assert!(forwarded_client_ip(&headers).is_none());

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(forwarded_client_ip(&headers).as_deref(), Some("198.51.100.4"));
    }

    #[test]
    fn credentials_fall_back_to_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("login-token", HeaderValue::from_static("from-header"));
        headers.insert("userid", HeaderValue::from_static("u-header"));

        let creds = SessionCredentials::from_headers(&headers, "login-token");

        assert_eq!(creds.session_id.as_deref(), Some("from-header"));
        assert_eq!(creds.user_id.as_deref(), Some("u-header"));
        assert!(creds.client_ip.is_none());
    }
}
