//! Skirmish Server
//!
//! Authoritative session server for turn-based tactical combat.

use std::sync::Arc;
use anyhow::{bail, Context};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use skirmish::{
    config::ServerConfig,
    game::InMemoryCharacterStore,
    network::{GameServer, ServerContext},
    SkirmishSimulation, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    if !config.auth.is_configured() {
        bail!("AUTH_SECRET must be set");
    }

    info!("Skirmish Server v{}", VERSION);
    info!(
        "Reconnect grace: {}s, turn grace while disconnected: {}s",
        config.reconnect_grace.as_secs(),
        config.disconnected_turn_grace.as_secs()
    );

    let ctx = ServerContext::new(
        config,
        Arc::new(SkirmishSimulation::new()),
        Arc::new(InMemoryCharacterStore::new()),
        None,
    );
    let server = Arc::new(GameServer::new(ctx));

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_server.shutdown("server shutting down").await;
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
