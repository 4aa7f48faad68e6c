//! Token Gate
//!
//! Authentication gate for HTTP services: signed bearer tokens, rotating
//! server-side sessions, scope checks, and credential forwarding.
//!
//! # Features
//!
//! - **Token codec**: HS256 or RS256 signing with issuer binding and clock leeway
//! - **Bearer gate**: `Authorization: Bearer` validation with scope challenges
//! - **Session gate**: cookie sessions whose token is rotated on every request
//! - **Session stores**: in-memory (with reaper) or Redis, failing closed
//! - **Forwarding**: downstream calls carrying the caller's credential

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod gate;
pub mod keys;
pub mod server;
pub mod session;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level` when set. `format` of `"json"` selects
/// structured output; anything else is human-readable.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
