//! Audit logging for session and admission events.
//!
//! Every event is emitted via `tracing::info!` with the serialized event in
//! the `audit` field, so the trail is queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `session.issued` | A new cookie session is created |
//! | `session.rotated` | A session's token is re-signed on use |
//! | `session.revoked` | A session is deleted (logout) |
//! | `auth.rejected` | A credential failed validation; `stage` names the check |
//! | `scope.denied` | An authenticated identity lacks a required scope |
//! | `insecure.admitted` | A request was admitted without validation |
//!
//! Session ids are bearer secrets, so only a short prefix is recorded.

use serde::Serialize;

/// Structured audit event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"session.issued"`).
    pub event: &'static str,
    /// User the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Prefix of the affected session id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// `jti` of the token involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// Client IP address (when available).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Last stage reached before rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<&'static str>,
    /// Which check failed, or why access was denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Scopes that were required but missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_scopes: Option<Vec<String>>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            user_id: None,
            session: None,
            token_jti: None,
            client_ip: None,
            stage: None,
            reason: None,
            missing_scopes: None,
        }
    }

    /// Construct a `session.issued` event.
    #[must_use]
    pub fn issued(user_id: &str, session_id: &str, jti: Option<&str>, client_ip: Option<&str>) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            session: Some(session_hint(session_id)),
            token_jti: jti.map(str::to_string),
            client_ip: client_ip.map(str::to_string),
            ..Self::new("session.issued")
        }
    }

    /// Construct a `session.rotated` event.
    #[must_use]
    pub fn rotated(user_id: &str, session_id: &str, jti: Option<&str>) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            session: Some(session_hint(session_id)),
            token_jti: jti.map(str::to_string),
            ..Self::new("session.rotated")
        }
    }

    /// Construct a `session.revoked` event.
    #[must_use]
    pub fn revoked(session_id: &str, user_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            session: Some(session_hint(session_id)),
            ..Self::new("session.revoked")
        }
    }

    /// Construct an `auth.rejected` event.
    #[must_use]
    pub fn rejected(stage: &'static str, reason: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            reason: Some(reason.into()),
            ..Self::new("auth.rejected")
        }
    }

    /// Construct a `scope.denied` event.
    #[must_use]
    pub fn scope_denied(user_id: &str, missing: &[String]) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            missing_scopes: Some(missing.to_vec()),
            ..Self::new("scope.denied")
        }
    }

    /// Construct an `insecure.admitted` event.
    #[must_use]
    pub fn insecure_admitted(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            reason: Some("session validation disabled".to_string()),
            ..Self::new("insecure.admitted")
        }
    }

    /// Attach the session prefix
    #[must_use]
    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session = Some(session_hint(session_id));
        self
    }

    /// Attach the client address
    #[must_use]
    pub fn with_client_ip(mut self, client_ip: Option<&str>) -> Self {
        self.client_ip = client_ip.map(str::to_string);
        self
    }
}

/// First eight characters of a session id.
#[must_use]
pub fn session_hint(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO token_gate::session::audit audit={"event":"session.issued",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "session audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_event_truncates_session_id() {
        // GIVEN: a full 32-char session id
        let sid = "0123456789abcdef0123456789abcdef";

        // WHEN: building an issued event
        let event = AuditEvent::issued("u1", sid, Some("jti-1"), Some("10.0.0.1"));

        // THEN: only the prefix is recorded
        assert_eq!(event.event, "session.issued");
        assert_eq!(event.session.as_deref(), Some("01234567"));
        assert_eq!(event.token_jti.as_deref(), Some("jti-1"));
    }

    #[test]
    fn rejected_event_names_stage_and_reason() {
        let event = AuditEvent::rejected("token_decoded", "invalid signature");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "auth.rejected");
        assert_eq!(json["stage"], "token_decoded");
        assert_eq!(json["reason"], "invalid signature");
    }

    #[test]
    fn absent_fields_are_omitted() {
        let json = serde_json::to_string(&AuditEvent::revoked("abcdef0123", None)).unwrap();
        assert!(!json.contains("user_id"));
        assert!(!json.contains("missing_scopes"));
        assert!(json.contains("\"session\":\"abcdef01\""));
    }

    #[test]
    fn scope_denied_lists_missing_scopes() {
        let event = AuditEvent::scope_denied("u1", &["write".to_string()]);
        assert_eq!(event.missing_scopes, Some(vec!["write".to_string()]));
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::insecure_admitted("u1").with_client_ip(Some("127.0.0.1")));
    }
}
