//! Token Gate - signed tokens, rotating sessions, scope checks

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use token_gate::{
    Error,
    cli::{Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
    token::{Claims, TokenCodec, claims},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Issue {
            user_id,
            scopes,
            expiry,
            token_type,
        }) => run_issue(&config, user_id, scopes, expiry, token_type),
        Some(Command::Verify { token }) => run_verify(&config, &token),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Mint a bearer token and print it
fn run_issue(
    config: &Config,
    user_id: String,
    scopes: Vec<String>,
    expiry: Option<Duration>,
    token_type: String,
) -> ExitCode {
    let codec = match TokenCodec::from_config(&config.signing) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load signing keys: {e}");
            return ExitCode::FAILURE;
        }
    };
    if !codec.can_sign() {
        eprintln!("No signing key configured; set signing.authorization_server and a private key");
        return ExitCode::FAILURE;
    }

    let mut payload = Claims::new()
        .with(claims::USER_ID, user_id)
        .with(claims::TOKEN_TYPE, token_type);
    if !scopes.is_empty() {
        payload.insert(claims::SCOPES, scopes);
    }

    match codec.encode(&payload, expiry) {
        Ok(token) => {
            println!("{token}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to issue token: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Decode a token and print its claims
fn run_verify(config: &Config, token: &str) -> ExitCode {
    let codec = match TokenCodec::from_config(&config.signing) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load signing keys: {e}");
            return ExitCode::FAILURE;
        }
    };

    match codec.decode(token) {
        Ok(payload) => match serde_json::to_string_pretty(&payload) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to render claims: {e}");
                ExitCode::FAILURE
            }
        },
        Err(Error::Token(kind)) => {
            eprintln!("Token rejected: {kind}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("Verification failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gate server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        secure_access = config.session.secure_access,
        "Starting Token Gate"
    );

    if let Err(e) = Server::new(config).run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Token Gate shutdown complete");
    ExitCode::SUCCESS
}
