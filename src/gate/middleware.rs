//! axum admission hooks.
//!
//! Mount with `middleware::from_fn_with_state`:
//!
//! ```ignore
//! Router::new()
//!     .route("/api/things", get(list_things))
//!     .route_layer(middleware::from_fn_with_state(
//!         BearerAuth::new(gate).require(["things:read"]),
//!         require_bearer,
//!     ));
//! ```
//!
//! On success the [`AuthenticatedIdentity`](super::AuthenticatedIdentity) is
//! inserted into request extensions. On failure the handler never runs and
//! the client gets a uniform body that does not say which check failed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, RequestPartsExt,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{Extensions, HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    extract::cookie::{Cookie, SameSite},
    headers::{Authorization, authorization::Bearer},
};
use serde_json::json;
use tracing::{error, warn};

use super::{
    BearerGate, CookieGate, SessionCredentials, USER_ID_COOKIE, USER_ID_COOKIE_SNAKE, authorize,
    forwarded_client_ip,
};
use crate::Error;
use crate::config::SessionConfig;
use crate::session::Session;

/// State for [`require_bearer`]: the gate plus the scopes a route needs.
#[derive(Debug, Clone)]
pub struct BearerAuth {
    gate: Arc<BearerGate>,
    required: Arc<[String]>,
}

impl BearerAuth {
    /// Authenticate only; no scopes required.
    #[must_use]
    pub fn new(gate: Arc<BearerGate>) -> Self {
        Self {
            gate,
            required: Arc::from(Vec::new()),
        }
    }

    /// Require these scopes as well.
    #[must_use]
    pub fn require<I, S>(self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required: Vec<String> = scopes.into_iter().map(Into::into).collect();
        Self {
            gate: self.gate,
            required: Arc::from(required),
        }
    }

    /// Required scopes
    #[must_use]
    pub fn required(&self) -> &[String] {
        &self.required
    }
}

/// Admit requests with a valid bearer token holding the required scopes.
pub async fn require_bearer(State(auth): State<BearerAuth>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();

    let token = parts
        .extract::<TypedHeader<Authorization<Bearer>>>()
        .await
        .ok()
        .map(|TypedHeader(Authorization(bearer))| bearer.token().to_string());

    let admitted = auth
        .gate
        .authenticate(token.as_deref())
        .and_then(|identity| authorize(&identity, auth.required()).map(|()| identity));

    match admitted {
        Ok(identity) => {
            parts.extensions.insert(identity);
            next.run(Request::from_parts(parts, body)).await
        }
        Err(e) => rejection_response(&e, auth.required()),
    }
}

/// State for [`require_session`]: the gate plus cookie settings.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    gate: Arc<CookieGate>,
    cookie_name: String,
    secure_cookie: bool,
    trust_forwarded_for: bool,
}

impl SessionAuth {
    /// Create hook state.
    #[must_use]
    pub fn new(gate: Arc<CookieGate>, cookie_name: impl Into<String>, secure_cookie: bool) -> Self {
        Self {
            gate,
            cookie_name: cookie_name.into(),
            secure_cookie,
            trust_forwarded_for: false,
        }
    }

    /// Take the client address from proxy headers rather than the socket peer.
    #[must_use]
    pub fn trust_forwarded_for(self, trust: bool) -> Self {
        Self {
            trust_forwarded_for: trust,
            ..self
        }
    }

    /// Create hook state from the `session` config section.
    #[must_use]
    pub fn from_config(gate: Arc<CookieGate>, config: &SessionConfig) -> Self {
        Self::new(gate, config.cookie_name.clone(), config.secure_cookie)
            .trust_forwarded_for(config.trust_forwarded_for)
    }

    /// The gate
    #[must_use]
    pub fn gate(&self) -> &Arc<CookieGate> {
        &self.gate
    }

    /// Cookie carrying the session id
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Address of the client behind a request.
    ///
    /// The socket peer from [`ConnectInfo`], unless proxy headers are trusted
    /// and present.
    #[must_use]
    pub fn client_ip(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
        let forwarded = if self.trust_forwarded_for {
            forwarded_client_ip(headers)
        } else {
            None
        };
        forwarded.or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
    }

    /// Cookies that hand a rotated session back to the client.
    #[must_use]
    pub fn session_cookies(&self, session: &Session) -> Vec<Cookie<'static>> {
        vec![
            build_cookie(USER_ID_COOKIE_SNAKE, &session.user_id, self.secure_cookie, None),
            build_cookie(USER_ID_COOKIE, &session.user_id, self.secure_cookie, None),
            build_cookie(&self.cookie_name, &session.id, self.secure_cookie, Some(session.ttl)),
        ]
    }

    /// Cookies that make the client drop its session.
    #[must_use]
    pub fn cleared_cookies(&self) -> Vec<Cookie<'static>> {
        [USER_ID_COOKIE_SNAKE, USER_ID_COOKIE, self.cookie_name.as_str()]
            .into_iter()
            .map(|name| build_cookie(name, "", self.secure_cookie, Some(Duration::ZERO)))
            .collect()
    }
}

/// Admit requests carrying a valid session, rotating it.
///
/// After rotation the request is rewritten so handlers see the current
/// credential, and the refreshed cookies are appended to the response once.
/// A handler that sets its own session cookie (logout) takes precedence.
pub async fn require_session(State(auth): State<SessionAuth>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();

    let mut credentials = SessionCredentials::from_headers(&parts.headers, &auth.cookie_name);
    credentials.client_ip = auth.client_ip(&parts.headers, &parts.extensions);

    let identity = match auth.gate.authenticate(&credentials).await {
        Ok(identity) => identity,
        Err(e) => return rejection_response(&e, &[]),
    };

    let cookies = identity
        .session()
        .map(|session| auth.session_cookies(session))
        .unwrap_or_default();

    if let Some(session) = identity.session() {
        rewrite_credentials(&mut parts.headers, &auth.cookie_name, session);
    }
    parts.extensions.insert(identity);

    let mut response = next.run(Request::from_parts(parts, body)).await;

    if !cookies.is_empty() && !sets_cookie(&response, &auth.cookie_name) {
        for cookie in cookies {
            match HeaderValue::from_str(&cookie.encoded().to_string()) {
                Ok(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(e) => error!(cookie = cookie.name(), error = %e, "Unencodable session cookie"),
            }
        }
    }
    response
}

/// Replace the session id and user id the handler will read.
fn rewrite_credentials(headers: &mut HeaderMap, cookie_name: &str, session: &Session) {
    let others: Vec<String> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or_default();
            !pair.is_empty()
                && name != cookie_name
                && name != USER_ID_COOKIE
                && name != USER_ID_COOKIE_SNAKE
        })
        .map(str::to_string)
        .collect();

    let mut cookie = [
        (cookie_name, session.id.as_str()),
        (USER_ID_COOKIE, session.user_id.as_str()),
        (USER_ID_COOKIE_SNAKE, session.user_id.as_str()),
    ]
    .into_iter()
    .map(|(name, value)| Cookie::new(name, value).encoded().to_string())
    .collect::<Vec<_>>()
    .join("; ");
    for pair in others {
        cookie.push_str("; ");
        cookie.push_str(&pair);
    }

    headers.remove(header::COOKIE);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        headers.insert(header::COOKIE, value);
    }
    if let (Ok(name), Ok(value)) = (
        HeaderName::try_from(cookie_name),
        HeaderValue::from_str(&session.id),
    ) {
        headers.insert(name, value);
    }
    if let Ok(value) = HeaderValue::from_str(&session.user_id) {
        headers.insert(HeaderName::from_static("userid"), value);
    }
}

fn sets_cookie(response: &Response, cookie_name: &str) -> bool {
    let prefix = format!("{cookie_name}=");
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.starts_with(&prefix))
}

fn build_cookie(name: &str, value: &str, secure: bool, max_age: Option<Duration>) -> Cookie<'static> {
    let mut builder = Cookie::build((name.to_string(), value.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(secure);
    if let Some(age) = max_age {
        let secs = i64::try_from(age.as_secs()).unwrap_or(i64::MAX);
        builder = builder.max_age(time::Duration::seconds(secs));
    }
    builder.build()
}

/// Uniform rejection for an admission failure.
///
/// 401 and 403 carry `WWW-Authenticate`, with the required scopes when there
/// are any. The body never says which check failed.
#[must_use]
pub fn rejection_response(err: &Error, required_scopes: &[String]) -> Response {
    let status = err.status_code();
    let challenge = if required_scopes.is_empty() {
        "Bearer".to_string()
    } else {
        format!("Bearer scope=\"{}\"", required_scopes.join(" "))
    };

    match status {
        StatusCode::UNAUTHORIZED => {
            warn!(error = %err, "Request not authenticated");
            with_challenge(
                (status, Json(json!({ "detail": "Could not validate credentials" }))).into_response(),
                &challenge,
            )
        }
        StatusCode::FORBIDDEN => with_challenge(
            (status, Json(json!({ "detail": "Not enough permissions" }))).into_response(),
            &challenge,
        ),
        _ => {
            error!(error = %err, "Admission failed on our side");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "Internal server error" })),
            )
                .into_response()
        }
    }
}

fn with_challenge(mut response: Response<Body>, challenge: &str) -> Response<Body> {
    if let Ok(value) = HeaderValue::from_str(challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}
