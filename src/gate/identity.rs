//! The authenticated identity handed to protected handlers.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::session::Session;
use crate::token::Claims;

/// How the identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer` token, decoded directly
    Bearer,
    /// Server-side session, validated and rotated
    Session,
    /// Client-supplied user id, not validated
    Insecure,
}

/// Result of successful authentication.
///
/// Immutable once built; handlers receive it by value through request
/// extensions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticatedIdentity {
    user_id: String,
    scheme: AuthScheme,
    #[serde(skip_serializing_if = "Option::is_none")]
    scopes: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    extra: Map<String, Value>,
    #[serde(skip)]
    session: Option<Session>,
}

impl AuthenticatedIdentity {
    pub(crate) fn from_bearer(user_id: String, claims: &Claims) -> Self {
        Self {
            user_id,
            scheme: AuthScheme::Bearer,
            scopes: claims.scopes().map(|s| s.into_iter().collect()),
            extra: claims.extra(),
            session: None,
        }
    }

    pub(crate) fn from_session(session: Session) -> Self {
        Self {
            user_id: session.user_id.clone(),
            scheme: AuthScheme::Session,
            scopes: None,
            extra: Map::new(),
            session: Some(session),
        }
    }

    pub(crate) fn insecure(user_id: String, session_id: Option<String>) -> Self {
        let mut extra = Map::new();
        if let Some(id) = session_id {
            extra.insert("presented_session".to_string(), Value::from(id));
        }
        Self {
            user_id,
            scheme: AuthScheme::Insecure,
            scopes: None,
            extra,
            session: None,
        }
    }

    /// Authenticated user
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// How the identity was established
    #[must_use]
    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// Granted scopes; `None` when the credential carried no scope claim
    #[must_use]
    pub fn scopes(&self) -> Option<&BTreeSet<String>> {
        self.scopes.as_ref()
    }

    /// Whether `scope` was granted
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.as_ref().is_some_and(|s| s.contains(scope))
    }

    /// Remaining token claims (email, `token_type`, ...)
    #[must_use]
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// The rotated session, for the session scheme
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}
