//! Signing key resolution.
//!
//! Turns the `signing` configuration section into ready-to-use
//! [`jsonwebtoken`] keys, once, at startup:
//!
//! - **HS256**: the shared secret is both the read and the write key.
//! - **RS256**: the public key is always required. The private key is only
//!   loaded when the instance acts as an authorization server; verify-only
//!   instances never hold signing material.
//!
//! Inline keys may be raw PEM or base64-encoded PEM (the usual shape for keys
//! passed through environment variables). When absent, `key_dir/public` and
//! `key_dir/private` are read instead.

use std::fmt;
use std::path::Path;

use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey};
use tracing::debug;

use crate::config::{SigningAlgorithm, SigningConfig, resolve_secret};
use crate::{Error, Result};

const PEM_MARKER: &str = "-----BEGIN";

/// Resolved key material for one algorithm family.
#[derive(Clone)]
pub struct KeyMaterial {
    algorithm: SigningAlgorithm,
    decoding: DecodingKey,
    encoding: Option<EncodingKey>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("can_sign", &self.can_sign())
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Resolve keys from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required key is absent for the role, a
    /// base64 blob does not decode to PEM, or the PEM is not a valid key.
    pub fn resolve(config: &SigningConfig) -> Result<Self> {
        match config.algorithm {
            SigningAlgorithm::HS256 => {
                let secret = config
                    .secret_key
                    .as_deref()
                    .map(resolve_secret)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        Error::Config("secret_key must be provided for HS256".to_string())
                    })?;
                Ok(Self::hs256(secret.as_bytes()))
            }
            SigningAlgorithm::RS256 => {
                let key_dir = config.key_dir.as_deref();

                let public_pem = load_pem(config.public_key.as_deref(), key_dir, "public")?
                    .ok_or_else(|| {
                        Error::Config("public_key must be provided for RS256".to_string())
                    })?;

                let private_pem = if config.authorization_server {
                    let pem = load_pem(config.private_key.as_deref(), key_dir, "private")?
                        .ok_or_else(|| {
                            Error::Config(
                                "private_key must be provided for RS256 when acting as authorization server"
                                    .to_string(),
                            )
                        })?;
                    Some(pem)
                } else {
                    if config.private_key.is_some() {
                        debug!("Ignoring private_key: instance is not an authorization server");
                    }
                    None
                };

                Self::rs256(&public_pem, private_pem.as_deref())
            }
        }
    }

    /// Symmetric key material from a shared secret.
    #[must_use]
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            algorithm: SigningAlgorithm::HS256,
            decoding: DecodingKey::from_secret(secret),
            encoding: Some(EncodingKey::from_secret(secret)),
        }
    }

    /// Asymmetric key material from PEM text. Pass `None` for a verify-only
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either PEM is not a valid RSA key.
    pub fn rs256(public_pem: &str, private_pem: Option<&str>) -> Result<Self> {
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| Error::Config(format!("invalid RS256 public key: {e}")))?;

        let encoding = private_pem
            .map(|pem| {
                EncodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| Error::Config(format!("invalid RS256 private key: {e}")))
            })
            .transpose()?;

        Ok(Self {
            algorithm: SigningAlgorithm::RS256,
            decoding,
            encoding,
        })
    }

    /// Configured algorithm
    #[must_use]
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Verification key
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// Signing key, absent on verify-only instances
    #[must_use]
    pub fn encoding_key(&self) -> Option<&EncodingKey> {
        self.encoding.as_ref()
    }

    /// Whether this instance may issue tokens
    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.encoding.is_some()
    }
}

/// Decode a key blob to PEM text.
///
/// Raw PEM passes through unchanged; anything else must be standard base64 of
/// PEM text. Embedded whitespace and newlines in the base64 are tolerated.
///
/// # Errors
///
/// Returns [`Error::Config`] if the blob is neither PEM nor base64 of PEM.
pub fn decode_key_blob(blob: &str) -> Result<String> {
    let trimmed = blob.trim();
    if trimmed.starts_with(PEM_MARKER) {
        return Ok(trimmed.to_string());
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| Error::Config(format!("key is not valid base64: {e}")))?;
    let pem = String::from_utf8(bytes)
        .map_err(|_| Error::Config("decoded key is not UTF-8 text".to_string()))?;

    if pem.trim_start().starts_with(PEM_MARKER) {
        Ok(pem)
    } else {
        Err(Error::Config("decoded key is not PEM".to_string()))
    }
}

/// Inline value first, then `key_dir/<file_name>`. `Ok(None)` when neither
/// source is configured.
fn load_pem(inline: Option<&str>, key_dir: Option<&str>, file_name: &str) -> Result<Option<String>> {
    if let Some(value) = inline.map(resolve_secret).filter(|v| !v.trim().is_empty()) {
        return decode_key_blob(&value).map(Some);
    }

    let Some(dir) = key_dir else {
        return Ok(None);
    };

    let path = Path::new(dir).join(file_name);
    if !path.is_file() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!("failed to read key file {}: {e}", path.display()))
    })?;
    debug!(path = %path.display(), "Loaded key file");
    decode_key_blob(&text).map(Some)
}
