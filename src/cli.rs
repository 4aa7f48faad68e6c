//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde;

/// Token Gate - signed tokens, rotating sessions, scope checks
#[derive(Parser, Debug)]
#[command(name = "token-gate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOKEN_GATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOKEN_GATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOKEN_GATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOKEN_GATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOKEN_GATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gate server (default)
    Serve,

    /// Mint a bearer token (needs a signing key)
    Issue {
        /// User the token is issued to
        #[arg(required = true)]
        user_id: String,

        /// Granted scope; repeat for several
        #[arg(short, long = "scope")]
        scopes: Vec<String>,

        /// Lifetime such as "15m" or "2h" (defaults to `signing.expiry`)
        #[arg(short, long, value_parser = parse_duration)]
        expiry: Option<Duration>,

        /// Value of the `token_type` claim
        #[arg(long, default_value = "access")]
        token_type: String,
    },

    /// Decode a token and print its claims; exits non-zero if rejected
    Verify {
        /// Encoded token
        #[arg(required = true)]
        token: String,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    match humantime_serde::parse(s) {
        Ok(d) if d.is_zero() => Err("duration must be positive".to_string()),
        Ok(d) => Ok(d),
        Err(e) => Err(format!("invalid duration {s:?}: {e}")),
    }
}
