//! # Serve Command

use std::sync::Arc;

use anyhow::{Context, Result};
use mxb_core::sync::MemoryPlatform;
use mxb_core::{Bridge, BridgeConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the bridge until Ctrl-C
pub async fn run(config: BridgeConfig) -> Result<()> {
    let platform = Arc::new(MemoryPlatform::new());
    let bridge = Bridge::build(config, platform)
        .await
        .context("failed to start bridge")?;

    match bridge.mapper().list_room_mappings().await {
        Ok(mappings) => info!("Loaded {} channel mappings", mappings.len()),
        Err(e) => error!("Failed to list channel mappings: {}", e),
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        trigger.cancel();
    });

    bridge.serve(shutdown).await.context("server error")?;
    Ok(())
}
