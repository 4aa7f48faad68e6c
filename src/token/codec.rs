use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Header, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use super::claims::{self, Claims};
use crate::config::{SigningAlgorithm, SigningConfig};
use crate::error::TokenError;
use crate::keys::KeyMaterial;
use crate::{Error, Result};

/// Encodes, decodes and verifies compact signed tokens.
///
/// Holds only immutable state, so one instance is shared across all requests.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    keys: KeyMaterial,
    issuer: String,
    leeway: Duration,
    expiry: Duration,
}

impl TokenCodec {
    /// Create a codec from resolved keys and policy.
    #[must_use]
    pub fn new(keys: KeyMaterial, issuer: impl Into<String>, leeway: Duration, expiry: Duration) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            leeway,
            expiry,
        }
    }

    /// Resolve keys and build a codec from the `signing` config section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if key material cannot be resolved.
    pub fn from_config(config: &SigningConfig) -> Result<Self> {
        let keys = KeyMaterial::resolve(config)?;
        Ok(Self::new(keys, config.issuer.clone(), config.leeway, config.expiry))
    }

    /// Configured algorithm
    #[must_use]
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.keys.algorithm()
    }

    /// Configured issuer
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Default token lifetime
    #[must_use]
    pub fn default_expiry(&self) -> Duration {
        self.expiry
    }

    /// Whether [`encode`](Self::encode) may be called
    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.keys.can_sign()
    }

    /// Sign `claims`, adding `iss`, `iat`, `exp` and, unless the caller set
    /// one, a fresh `jti`.
    ///
    /// `expiry` overrides the configured default lifetime. Caller values for
    /// `iss`, `iat` and `exp` are overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] on a verify-only instance or for a zero
    /// expiry, and [`Error::Crypto`] if the signing backend fails.
    pub fn encode(&self, claims: &Claims, expiry: Option<Duration>) -> Result<String> {
        self.encode_at(claims, chrono::Utc::now().timestamp(), expiry)
    }

    pub(crate) fn encode_at(&self, claims: &Claims, issued_at: i64, expiry: Option<Duration>) -> Result<String> {
        let Some(key) = self.keys.encoding_key() else {
            return Err(Error::Signing(
                "encode called on a verify-only instance (no private key)".to_string(),
            ));
        };

        let lifetime = expiry.unwrap_or(self.expiry);
        if lifetime.is_zero() {
            return Err(Error::Signing("token expiry must be positive".to_string()));
        }
        let lifetime_secs = i64::try_from(lifetime.as_secs())
            .map_err(|_| Error::Signing("token expiry out of range".to_string()))?;

        let mut payload: Map<String, Value> = claims.as_map().clone();
        payload.insert(claims::ISSUER.to_string(), Value::from(self.issuer.as_str()));
        payload.insert(claims::ISSUED_AT.to_string(), Value::from(issued_at));
        payload.insert(
            claims::EXPIRES_AT.to_string(),
            Value::from(issued_at.saturating_add(lifetime_secs.max(1))),
        );
        if !payload.contains_key(claims::TOKEN_ID) {
            payload.insert(
                claims::TOKEN_ID.to_string(),
                Value::from(uuid::Uuid::new_v4().to_string()),
            );
        }

        let header = Header::new(self.keys.algorithm().jwt_algorithm());
        jsonwebtoken::encode(&header, &payload, key).map_err(|e| Error::Crypto(e.to_string()))
    }

    /// Verify signature, issuer and expiry, then return the claims.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Token`] tagged with the failed check for client-caused
    /// rejections, and [`Error::Crypto`] for key or backend faults.
    pub fn decode(&self, token: &str) -> Result<Claims> {
        let data = jsonwebtoken::decode::<Map<String, Value>>(
            token,
            self.keys.decoding_key(),
            &self.validation(),
        )
        .map_err(|e| classify(&e))?;

        // The library also accepts an `iss` array containing our issuer.
        match data.claims.get(claims::ISSUER) {
            Some(Value::String(iss)) if *iss == self.issuer => {}
            _ => return Err(Error::Token(TokenError::InvalidIssuer)),
        }

        Ok(Claims::from(data.claims))
    }

    /// Like [`decode`](Self::decode), but client-caused rejections yield
    /// `Ok(false)` instead of an error.
    ///
    /// # Errors
    ///
    /// Only system-level faults propagate (see [`Error::Crypto`]).
    pub fn verify(&self, token: &str) -> Result<bool> {
        match self.decode(token) {
            Ok(_) => Ok(true),
            Err(Error::Token(kind)) => {
                debug!(reason = %kind, "Token failed verification");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.keys.algorithm().jwt_algorithm());
        validation.leeway = self.leeway.as_secs();
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&[claims::EXPIRES_AT, claims::ISSUER]);
        validation
    }
}

/// Map a library error to a rejection kind, or to a fatal error when the
/// failure is on our side (bad key, backend fault).
fn classify(err: &jsonwebtoken::errors::Error) -> Error {
    let kind = match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => TokenError::InvalidSignature,
        ErrorKind::MissingRequiredClaim(name) => TokenError::MissingClaim(name.clone()),
        ErrorKind::InvalidIssuer => TokenError::InvalidIssuer,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::ImmatureSignature
        | ErrorKind::InvalidAudience => TokenError::Malformed,
        _ => return Error::Crypto(err.to_string()),
    };
    Error::Token(kind)
}
