//! HTTP surface wiring the gates in front of a few routes.
//!
//! | Route | Guard | Purpose |
//! |-------|-------|---------|
//! | `GET /health` | none | liveness |
//! | `POST /auth/session` | bearer + `sessions:write` | start a cookie session |
//! | `DELETE /auth/session` | session | logout |
//! | `GET /whoami` | session | echo the session identity |
//! | `GET /api/whoami` | bearer | echo the bearer identity |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::State,
    http::{Extensions, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::gate::{
    AuthenticatedIdentity, BearerAuth, BearerGate, CookieGate, SessionAuth, require_bearer,
    require_session,
};
use crate::session::{SessionManager, SessionStore, build_store};
use crate::token::TokenCodec;
use crate::{Error, Result};

/// Scope a bearer token needs to start cookie sessions
pub const SESSION_WRITE_SCOPE: &str = "sessions:write";

/// The gates and their shared codec, built once at startup.
#[derive(Debug, Clone)]
pub struct Gates {
    /// Shared token codec
    pub codec: Arc<TokenCodec>,
    /// Bearer scheme
    pub bearer: Arc<BearerGate>,
    /// Session scheme
    pub cookie: Arc<CookieGate>,
    /// Session hook state (gate plus cookie settings)
    pub session_auth: SessionAuth,
}

impl Gates {
    /// Build both gates from configuration over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if keys cannot be resolved or secure sessions
    /// are enabled without the means to run them.
    pub fn from_config(config: &Config, store: Arc<dyn SessionStore>) -> Result<Self> {
        let codec = Arc::new(TokenCodec::from_config(&config.signing)?);
        let bearer = Arc::new(BearerGate::new(Arc::clone(&codec)));

        let cookie = if config.session.secure_access {
            let internal_token = config.session.resolve_internal_token().ok_or_else(|| {
                Error::Config("session.internal_token is required when secure_access is enabled".to_string())
            })?;
            let manager = SessionManager::new(
                Arc::clone(&codec),
                store,
                internal_token,
                config.session.max_age,
            )?;
            CookieGate::secure(Arc::new(manager))
        } else {
            CookieGate::insecure()
        };
        let cookie = Arc::new(cookie);
        let session_auth = SessionAuth::from_config(Arc::clone(&cookie), &config.session);

        Ok(Self {
            codec,
            bearer,
            cookie,
            session_auth,
        })
    }
}

struct AppState {
    session_auth: SessionAuth,
}

/// Build the router.
pub fn create_router(gates: &Gates, request_timeout: Duration) -> Router {
    let state = Arc::new(AppState {
        session_auth: gates.session_auth.clone(),
    });

    let bearer_auth = BearerAuth::new(Arc::clone(&gates.bearer));
    let session_writer = bearer_auth.clone().require([SESSION_WRITE_SCOPE]);
    let session_auth = gates.session_auth.clone();

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/auth/session",
            post(issue_session_handler)
                .route_layer(middleware::from_fn_with_state(session_writer, require_bearer))
                .merge(delete(end_session_handler).route_layer(middleware::from_fn_with_state(
                    session_auth.clone(),
                    require_session,
                ))),
        )
        .route(
            "/whoami",
            get(whoami_handler).route_layer(middleware::from_fn_with_state(session_auth, require_session)),
        )
        .route(
            "/api/whoami",
            get(whoami_handler).route_layer(middleware::from_fn_with_state(bearer_auth, require_bearer)),
        )
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct IssueSessionRequest {
    user_id: String,
}

async fn issue_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthenticatedIdentity>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(body): Json<IssueSessionRequest>,
) -> Response {
    let Some(manager) = state.session_auth.gate().manager() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "detail": "Session validation is disabled" })),
        )
            .into_response();
    };
    if body.user_id.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": "user_id must not be empty" })),
        )
            .into_response();
    }

    let client_ip = state.session_auth.client_ip(&headers, &extensions);

    match manager.issue(&body.user_id, client_ip.as_deref()).await {
        Ok(session) => {
            info!(issuer = %caller.user_id(), user_id = %session.user_id, "Session started");
            let jar = state
                .session_auth
                .session_cookies(&session)
                .into_iter()
                .fold(CookieJar::new(), CookieJar::add);
            (
                StatusCode::CREATED,
                jar,
                Json(json!({
                    "user_id": session.user_id,
                    "expires_in": session.ttl.as_secs(),
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to start session");
            service_failure(&e)
        }
    }
}

async fn end_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AuthenticatedIdentity>,
) -> Response {
    if let (Some(manager), Some(session)) = (state.session_auth.gate().manager(), identity.session()) {
        if let Err(e) = manager.revoke(&session.id).await {
            error!(error = %e, "Failed to end session");
            return service_failure(&e);
        }
    }

    let jar = state
        .session_auth
        .cleared_cookies()
        .into_iter()
        .fold(CookieJar::new(), CookieJar::add);
    (StatusCode::NO_CONTENT, jar).into_response()
}

/// Failure on our side after the caller was admitted. Never a 401, which
/// would tell the client to discard a valid credential.
fn service_failure(err: &Error) -> Response {
    match err {
        Error::StoreUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "Session store unavailable" })),
        )
            .into_response(),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "Internal server error" })),
        )
            .into_response(),
    }
}

async fn whoami_handler(Extension(identity): Extension<AuthenticatedIdentity>) -> Json<AuthenticatedIdentity> {
    Json(identity)
}

/// The token-gate HTTP server
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a server from validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind, serve, and shut down gracefully on Ctrl+C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the gates cannot be built or the listener fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let store = build_store(&self.config.store, &shutdown_tx).await?;
        let gates = Gates::from_config(&self.config, store)?;
        let app = create_router(&gates, self.config.server.request_timeout);

        let listener = TcpListener::bind(addr).await?;

        info!("TOKEN GATE v{}", env!("CARGO_PKG_VERSION"));
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            algorithm = ?gates.codec.algorithm(),
            issuer = %gates.codec.issuer(),
            can_sign = gates.codec.can_sign(),
            "Token codec ready"
        );
        info!(backend = ?self.config.store.backend, "Session store ready");
        info!(secure_access = gates.cookie.is_secure(), "Session gate ready");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await?;

        info!("Server stopped");
        Ok(())
    }
}

/// Resolve on Ctrl+C or SIGTERM, then broadcast shutdown to background tasks.
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
