//! `genie server run`.

use std::path::Path;

use anyhow::Context;
use genie_core::{resolve_config_path, GenieServer, ServerConfig};
use tokio::sync::watch;
use tracing::{info, warn};

/// Run the dispatcher until SIGINT or SIGTERM.
pub async fn run(config_arg: Option<&Path>) -> anyhow::Result<i32> {
    let config_path = resolve_config_path(config_arg)?;
    let config = ServerConfig::load(&config_path)?;
    let server = GenieServer::from_config(&config).context("cannot create server")?;
    info!("transport created");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, stopping");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(0)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
