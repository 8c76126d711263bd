//! # Check Command
//!
//! Verifies the application-service token, the ghost namespace and the
//! homeserver software before the bridge is put into service.

use std::sync::Arc;

use anyhow::{Context, Result};
use mxb_core::sync::MemoryPlatform;
use mxb_core::{Bridge, BridgeConfig};
use serde_json::json;

pub async fn run(config: BridgeConfig, json_output: bool) -> Result<()> {
    let homeserver = config.matrix.homeserver_url.clone();
    let bridge = Bridge::build(config, Arc::new(MemoryPlatform::new()))
        .await
        .context("failed to set up bridge")?;
    let report = bridge
        .check()
        .await
        .with_context(|| format!("homeserver check against {} failed", homeserver))?;

    if json_output {
        let value = json!({
            "homeserver": homeserver,
            "user_id": report.whoami.user_id,
            "server_name": report.server_name,
            "server": {
                "name": report.server_version.name,
                "version": report.server_version.version,
            },
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Homeserver:  {}", homeserver);
        println!("Server name: {}", report.server_name);
        println!("Bridge user: {}", report.whoami.user_id);
        println!(
            "Software:    {} {}",
            report.server_version.name, report.server_version.version
        );
        println!("All checks passed");
    }
    Ok(())
}
