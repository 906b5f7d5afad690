//! # parley-server
//!
//! Signaling relay for Parley rooms.
//!
//! This binary provides:
//! - **Room membership** with a full member list rebroadcast on every
//!   join and leave
//! - **Negotiation forwarding** of opaque envelopes between two members of
//!   the same room
//! - **Health endpoint** for liveness checks
//!
//! Chat, keys and files never pass through here; peers exchange them over
//! their own direct links once negotiation completes.

mod api;
mod config;
mod error;
mod relay;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_shared::constants::APP_NAME;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::relay::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting {APP_NAME} signaling relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let bind_addr = config.bind_addr;
    let app_state = AppState {
        relay: Relay::new(),
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 3. Serve until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, bind_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Signaling server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
