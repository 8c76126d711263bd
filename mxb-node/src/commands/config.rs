//! # Config Command

use std::path::Path;

use anyhow::{Context, Result};
use mxb_core::config::default_config_path;
use mxb_core::BridgeConfig;
use serde_json::json;

/// Print the effective configuration, then report whether it is usable
pub fn show(path: Option<&Path>, json_output: bool) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let mut config = if path.exists() {
        BridgeConfig::from_file(&path)?
    } else {
        BridgeConfig::default()
    };
    config
        .apply_env(|key| std::env::var(key).ok())
        .context("invalid environment override")?;

    let rendered = config.to_redacted_toml()?;
    let validation = config.validate();

    if json_output {
        let value = json!({
            "path": path.display().to_string(),
            "exists": path.exists(),
            "valid": validation.is_ok(),
            "error": validation.as_ref().err().map(|e| e.to_string()),
            "config": rendered,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if path.exists() {
        println!("# Loaded from {}", path.display());
    } else {
        println!("# {} not found, showing defaults", path.display());
    }
    println!("{}", rendered);
    if let Err(e) = validation {
        println!("# Invalid: {}", e);
    }
    Ok(())
}
