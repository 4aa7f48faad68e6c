//! Token claim sets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Issuer, written by the codec.
pub const ISSUER: &str = "iss";
/// Absolute expiry in Unix seconds, written by the codec.
pub const EXPIRES_AT: &str = "exp";
/// Issuance time in Unix seconds, written by the codec.
pub const ISSUED_AT: &str = "iat";
/// Unique token id, generated by the codec when the caller leaves it unset.
pub const TOKEN_ID: &str = "jti";
/// Caller-supplied kind tag (`"session"`, `"access"`, `"refresh"`).
pub const TOKEN_TYPE: &str = "token_type";
/// Authenticated user.
pub const USER_ID: &str = "user_id";
/// Granted scopes, as a JSON array of strings.
pub const SCOPES: &str = "scopes";
/// Granted scopes, as a single space-delimited string (OAuth style).
pub const SCOPE: &str = "scope";

/// Claims the codec writes.
pub const RESERVED: [&str; 4] = [ISSUER, EXPIRES_AT, ISSUED_AT, TOKEN_ID];

/// A mapping from claim name to JSON value.
///
/// Serializes transparently as the JSON object that forms the token payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// Empty claim set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a claim, returning the previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Remove a claim
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    /// Raw claim value
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Whether the claim is present
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// String claim value; `None` if absent or not a string
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Integer claim value; `None` if absent or not an integer
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    /// `user_id`, accepting string or numeric ids
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        match self.0.get(USER_ID)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Granted scopes.
    ///
    /// Reads the `scopes` array, falling back to a space-delimited `scope`
    /// string. `None` when neither claim is present, which is different from
    /// an explicitly empty grant.
    #[must_use]
    pub fn scopes(&self) -> Option<Vec<String>> {
        if let Some(value) = self.0.get(SCOPES) {
            return match value {
                Value::Array(items) => Some(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                ),
                Value::String(s) => Some(s.split_whitespace().map(str::to_string).collect()),
                _ => Some(Vec::new()),
            };
        }
        self.get_str(SCOPE)
            .map(|s| s.split_whitespace().map(str::to_string).collect())
    }

    /// `iss`
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.get_str(ISSUER)
    }

    /// `exp`
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.get_i64(EXPIRES_AT)
    }

    /// `iat`
    #[must_use]
    pub fn issued_at(&self) -> Option<i64> {
        self.get_i64(ISSUED_AT)
    }

    /// `jti`
    #[must_use]
    pub fn token_id(&self) -> Option<&str> {
        self.get_str(TOKEN_ID)
    }

    /// `token_type`
    #[must_use]
    pub fn token_type(&self) -> Option<&str> {
        self.get_str(TOKEN_TYPE)
    }

    /// Claims that are neither codec-owned nor identity/scope claims
    #[must_use]
    pub fn extra(&self) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(name, _)| {
                !RESERVED.contains(&name.as_str())
                    && !matches!(name.as_str(), USER_ID | SCOPES | SCOPE)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Whether every claim in `other` is present here with an equal value
    #[must_use]
    pub fn contains_all(&self, other: &Self) -> bool {
        other
            .0
            .iter()
            .all(|(name, value)| self.0.get(name) == Some(value))
    }

    /// Iterate over all claims
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of claims
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no claims
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying JSON object
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the underlying JSON object
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
