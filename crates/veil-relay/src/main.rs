//! Veil relay server
//!
//! A stateless WebSocket relay that fans out end-to-end encrypted frames
//! between members of a room. The relay verifies host-signed admission
//! tokens and routes opaque bytes; it can never read the traffic.

mod auth;
mod config;
mod connection;
mod hub;
mod rate_limit;
mod room;
mod server;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::RelayConfig;

#[derive(Parser)]
#[command(name = "veil-relay")]
#[command(about = "Veil Relay Server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        #[command(flatten)]
        config: RelayConfig,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(config).await,
    }
}

async fn serve(config: RelayConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "veil relay starting");

    let shutdown = CancellationToken::new();

    let (hub, supervisor) = hub::Hub::new(config.idle_timeout());
    tokio::spawn(supervisor.run(shutdown.clone()));

    let limiter = Arc::new(rate_limit::RateLimiter::new(config.rate_limit_per_ip));
    tokio::spawn(Arc::clone(&limiter).run_sweeper(shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutting down");
            shutdown.cancel();
        });
    }

    let state = Arc::new(server::AppState {
        hub,
        limiter,
        config,
    });
    server::serve(state, shutdown).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
