//! Error types for token-gate

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for token-gate
pub type Result<T> = std::result::Result<T, Error>;

/// Why a presented token was refused by the codec.
///
/// These are the expected, client-caused failure kinds. They are reported as
/// values so callers branch on the kind instead of on error subtypes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Not a structurally valid compact token (segments, base64, JSON).
    #[error("malformed token")]
    Malformed,

    /// Signature did not verify under the configured key and algorithm.
    #[error("invalid signature")]
    InvalidSignature,

    /// `exp` has passed, beyond the configured leeway.
    #[error("token expired")]
    Expired,

    /// A claim the codec requires (`exp`, `iss`) is absent.
    #[error("missing required claim: {0}")]
    MissingClaim(String),

    /// `iss` is present but differs from the configured issuer.
    #[error("issuer mismatch")]
    InvalidIssuer,
}

/// token-gate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing or invalid key material, bad settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing misuse, e.g. encoding on a verify-only instance
    #[error("Signing error: {0}")]
    Signing(String),

    /// Token rejected by the codec
    #[error("Token rejected: {0}")]
    Token(#[from] TokenError),

    /// Key or crypto backend failure while signing/verifying
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Session store could not be reached or timed out
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// No usable credential, or the credential failed validation
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// Authenticated, but a required scope is missing
    #[error("Insufficient scope, missing: {}", missing.join(" "))]
    InsufficientScope {
        /// Scopes that were required but not granted
        missing: Vec<String>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a scope failure for the given missing scopes
    pub fn insufficient_scope<I, S>(missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::InsufficientScope {
            missing: missing.into_iter().map(Into::into).collect(),
        }
    }

    /// HTTP status a request gate answers with for this error.
    ///
    /// Store outages fail closed as 401, same as any other validation failure.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Token(_) | Self::NotAuthenticated(_) | Self::StoreUnavailable(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::InsufficientScope { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `true` for faults on our side of the wire rather than in the credential.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::Config(_)
                | Self::Signing(_)
                | Self::Crypto(_)
                | Self::Io(_)
                | Self::Internal(_)
        )
    }

    /// The codec rejection kind, if this is one.
    #[must_use]
    pub fn token_kind(&self) -> Option<&TokenError> {
        match self {
            Self::Token(kind) => Some(kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_kinds_map_to_unauthorized() {
        for kind in [
            TokenError::Malformed,
            TokenError::InvalidSignature,
            TokenError::Expired,
            TokenError::MissingClaim("exp".to_string()),
            TokenError::InvalidIssuer,
        ] {
            assert_eq!(Error::from(kind).status_code(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn store_outage_fails_closed_but_counts_as_infrastructure() {
        let err = Error::StoreUnavailable("connection refused".to_string());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert!(err.is_infrastructure());
    }

    #[test]
    fn scope_failure_is_forbidden() {
        let err = Error::insufficient_scope(["write"]);
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert!(!err.is_infrastructure());
        assert_eq!(err.to_string(), "Insufficient scope, missing: write");
    }

    #[test]
    fn misuse_is_a_server_error() {
        let err = Error::Signing("no write key".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
