//! Downstream request forwarding.
//!
//! [`ForwardingClient`] is an immutable value: base URL, current credential,
//! optional user id, timeout. Every call builds its own connection and
//! attaches the credential. When the downstream service rotates the
//! credential it answers with a `token` header; the new value comes back in
//! [`Forwarded::rotated_token`] and the caller threads it on with
//! [`ForwardingClient::with_token`]. Nothing is remembered between calls.

use std::time::Duration;

use reqwest::{
    Client, Method, StatusCode,
    header::{self, HeaderMap, HeaderName, HeaderValue},
};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::ForwardConfig;
use crate::{Error, Result};

/// Response header a downstream service uses to hand back a rotated token
pub const ROTATED_TOKEN_HEADER: &str = "token";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_COOKIE_NAME: &str = "login-token";

/// A downstream response plus any credential the service rotated.
#[derive(Debug)]
pub struct Forwarded {
    /// The raw response
    pub response: reqwest::Response,
    /// New credential from the `token` response header, if any
    pub rotated_token: Option<String>,
}

impl Forwarded {
    /// Response status
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Deserialize the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the body is not valid JSON for `T`.
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        Ok(self.response.json::<T>().await?)
    }
}

/// Forwards calls to a downstream service with the caller's credential.
#[derive(Debug, Clone)]
pub struct ForwardingClient {
    base_url: Url,
    token: String,
    user_id: Option<String>,
    timeout: Duration,
    cookie_name: String,
}

impl ForwardingClient {
    /// Create a client for `base_url` carrying `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base_url` is not an absolute URL.
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid base URL {base_url}: {e}")))?;
        Ok(Self {
            base_url,
            token: token.into(),
            user_id: None,
            timeout: DEFAULT_TIMEOUT,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
        })
    }

    /// Create a client using the configured defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base_url` is not an absolute URL.
    pub fn from_config(base_url: &str, token: impl Into<String>, config: &ForwardConfig) -> Result<Self> {
        Ok(Self::new(base_url, token)?.with_timeout(config.timeout))
    }

    /// Same client with a different credential.
    #[must_use]
    pub fn with_token(self, token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..self
        }
    }

    /// Same client, also sending `userId`.
    #[must_use]
    pub fn with_user_id(self, user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..self
        }
    }

    /// Same client with a different per-call timeout.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Same client with a different session cookie name.
    #[must_use]
    pub fn with_cookie_name(self, cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            ..self
        }
    }

    /// Current credential
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Per-call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Join `path` onto the base URL, collapsing duplicate slashes at the seam.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{path}")
        }
    }

    /// `GET path?query`
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Forwarded> {
        self.send::<()>(Method::GET, path, query, None).await
    }

    /// `POST path` with a JSON body
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Forwarded> {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    /// `PUT path` with a JSON body
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Forwarded> {
        self.send(Method::PUT, path, &[], Some(body)).await
    }

    /// `PATCH path` with a JSON body
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Forwarded> {
        self.send(Method::PATCH, path, &[], Some(body)).await
    }

    /// `DELETE path`
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn delete(&self, path: &str) -> Result<Forwarded> {
        self.send::<()>(Method::DELETE, path, &[], None).await
    }

    /// Send one request on a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] for a downstream 401,
    /// [`Error::InsufficientScope`] for a 403, and [`Error::Http`] for
    /// transport failures and timeouts. Other statuses are returned as-is.
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<Forwarded> {
        let client = Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .build()?;

        let url = self.url(path);
        let mut request = client
            .request(method.clone(), &url)
            .headers(self.headers())
            .bearer_auth(&self.token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(method = %method, url = %url, "Forwarding request");
        let response = request.send().await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                warn!(url = %url, "Downstream rejected credential");
                return Err(Error::NotAuthenticated(format!(
                    "downstream {url} rejected the credential"
                )));
            }
            StatusCode::FORBIDDEN => {
                warn!(url = %url, "Downstream denied access");
                return Err(Error::insufficient_scope(Vec::<String>::new()));
            }
            _ => {}
        }

        let rotated_token = response
            .headers()
            .get(ROTATED_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        if rotated_token.is_some() {
            debug!(url = %url, "Downstream rotated the credential");
        }

        Ok(Forwarded {
            response,
            rotated_token,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

        let mut cookie = format!("{}={}", self.cookie_name, self.token);
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(self.cookie_name.as_str()),
            HeaderValue::from_str(&self.token),
        ) {
            headers.insert(name, value);
        }
        if let Some(user_id) = &self.user_id {
            if let Ok(value) = HeaderValue::from_str(user_id) {
                headers.insert(HeaderName::from_static("userid"), value);
            }
            cookie.push_str(&format!("; userId={user_id}"));
        }
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.insert(header::COOKIE, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_base_url() {
        assert!(matches!(
            ForwardingClient::new("/relative", "t"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn url_joining_collapses_slashes() {
        let client = ForwardingClient::new("http://svc.local/api/", "t").unwrap();
        assert_eq!(client.url("/users"), "http://svc.local/api/users");
        assert_eq!(client.url("users"), "http://svc.local/api/users");
        assert_eq!(client.url(""), "http://svc.local/api");
    }

    #[test]
    fn with_token_returns_a_new_value() {
        // GIVEN: a client holding the first token
        let first = ForwardingClient::new("http://svc.local", "one")
            .unwrap()
            .with_user_id("u1");

        // WHEN: the rotated token is threaded on
        let second = first.clone().with_token("two");

        // THEN: the original is untouched
        assert_eq!(first.token(), "one");
        assert_eq!(second.token(), "two");
    }

    #[test]
    fn headers_carry_credential_and_hardening() {
        let client = ForwardingClient::new("http://svc.local", "tok")
            .unwrap()
            .with_user_id("u1");
        let headers = client.headers();
        assert_eq!(headers["login-token"], "tok");
        assert_eq!(headers["userid"], "u1");
        assert_eq!(headers[header::COOKIE], "login-token=tok; userId=u1");
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "SAMEORIGIN");
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
    }
}
