//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::keys::KeyMaterial;
use crate::{Error, Result};

/// Environment variable prefix for every setting
pub const ENV_PREFIX: &str = "TOKEN_GATE_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Token signing configuration
    pub signing: SigningConfig,
    /// Cookie session configuration
    pub session: SessionConfig,
    /// Session store configuration
    pub store: StoreConfig,
    /// Downstream forwarding defaults
    pub forward: ForwardConfig,
}

/// Supported signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SigningAlgorithm {
    /// HMAC-SHA256 with a shared secret
    #[default]
    HS256,
    /// RSASSA-PKCS1-v1_5 SHA-256 with a key pair
    RS256,
}

impl SigningAlgorithm {
    /// The `jsonwebtoken` algorithm for this choice
    #[must_use]
    pub fn jwt_algorithm(self) -> jsonwebtoken::Algorithm {
        match self {
            Self::HS256 => jsonwebtoken::Algorithm::HS256,
            Self::RS256 => jsonwebtoken::Algorithm::RS256,
        }
    }
}

/// Token signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Signature algorithm
    pub algorithm: SigningAlgorithm,
    /// Shared secret for HS256 (supports `env:VAR_NAME`)
    pub secret_key: Option<String>,
    /// RS256 public key, PEM or base64-encoded PEM (supports `env:VAR_NAME`)
    pub public_key: Option<String>,
    /// RS256 private key, PEM or base64-encoded PEM (supports `env:VAR_NAME`)
    pub private_key: Option<String>,
    /// Directory holding `public` and `private` PEM files, used when the
    /// inline keys are absent
    pub key_dir: Option<String>,
    /// Issuer written to and required in every token
    pub issuer: String,
    /// Clock skew tolerated on `exp`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Default token lifetime
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
    /// Whether this instance may issue RS256 tokens (requires a private key)
    pub authorization_server: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            algorithm: SigningAlgorithm::HS256,
            secret_key: None,
            public_key: None,
            private_key: None,
            key_dir: None,
            issuer: "token-gate".to_string(),
            leeway: Duration::from_secs(10),
            expiry: Duration::from_secs(1440 * 60),
            authorization_server: false,
        }
    }
}

/// Cookie session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Validate and rotate sessions. When false, client-supplied identity is
    /// trusted without any check (trusted-network development only).
    pub secure_access: bool,
    /// Set the `Secure` flag on session cookies
    pub secure_cookie: bool,
    /// Cookie (and header) carrying the opaque session id
    pub cookie_name: String,
    /// Session lifetime; also the store TTL and the cookie max-age.
    /// Counted in whole minutes, rounded up.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Shared secret embedded in every session token (supports `env:VAR_NAME`)
    pub internal_token: Option<String>,
    /// Record the client address from `X-Forwarded-For` / `X-Real-IP`
    /// instead of the socket peer. Enable only behind a proxy that sets them.
    pub trust_forwarded_for: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secure_access: false,
            secure_cookie: false,
            cookie_name: "login-token".to_string(),
            max_age: Duration::from_secs(30 * 60),
            internal_token: None,
            trust_forwarded_for: false,
        }
    }
}

impl SessionConfig {
    /// Resolve the internal token (expand `env:` indirection)
    #[must_use]
    pub fn resolve_internal_token(&self) -> Option<String> {
        self.internal_token.as_deref().map(resolve_secret).filter(|t| !t.is_empty())
    }
}

/// Session store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map (single instance, tests, development)
    #[default]
    Memory,
    /// Redis
    Redis,
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection
    pub backend: StoreBackend,
    /// Redis connection URI, database included (e.g. `redis://host:6379/9`)
    pub redis_uri: Option<String>,
    /// Prefix prepended to every session id key
    pub key_prefix: String,
    /// Upper bound for a single store operation
    #[serde(with = "humantime_serde")]
    pub op_timeout: Duration,
    /// Extra attempts for reads; writes are never retried
    pub read_retries: usize,
    /// How often the memory backend evicts expired entries
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_uri: None,
            key_prefix: String::new(),
            op_timeout: Duration::from_secs(2),
            read_retries: 2,
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Downstream forwarding defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Per-call timeout for forwarded requests
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8400,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Expand `env:VAR_NAME` indirection; other values are returned as-is.
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment, then validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes key material that cannot be resolved.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Check every startup invariant. Key material is fully resolved here so a
    /// bad key fails the process at boot, not on the first request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.signing.expiry.is_zero() {
            return Err(Error::Config("signing.expiry must be positive".to_string()));
        }
        if self.signing.issuer.is_empty() {
            return Err(Error::Config("signing.issuer must not be empty".to_string()));
        }
        if self.session.max_age.as_secs() < 60 {
            return Err(Error::Config(
                "session.max_age must be at least one minute".to_string(),
            ));
        }
        if self.session.secure_access && self.session.resolve_internal_token().is_none() {
            return Err(Error::Config(
                "session.internal_token is required when secure_access is enabled".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_uri.is_none() {
            return Err(Error::Config(
                "store.redis_uri is required for the redis backend".to_string(),
            ));
        }

        if self.store.op_timeout.is_zero() {
            return Err(Error::Config("store.op_timeout must be positive".to_string()));
        }
        if self.store.reap_interval.is_zero() {
            return Err(Error::Config("store.reap_interval must be positive".to_string()));
        }
        if self.server.request_timeout.is_zero() {
            return Err(Error::Config("server.request_timeout must be positive".to_string()));
        }

        KeyMaterial::resolve(&self.signing).map(|_| ())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in key material and store URI
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let fields = [
            &mut self.signing.secret_key,
            &mut self.signing.public_key,
            &mut self.signing.private_key,
            &mut self.signing.key_dir,
            &mut self.session.internal_token,
            &mut self.store.redis_uri,
        ];
        for value in fields.into_iter().flatten() {
            *value = Self::expand_string(&re, value);
        }

        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "2h", "100ms" or a bare number of seconds.
    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
