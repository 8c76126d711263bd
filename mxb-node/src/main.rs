//! # MXB CLI
//!
//! Runs the Mattermost <-> Matrix bridge as a Matrix application service.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mxb_core::BridgeConfig;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "mxb")]
#[command(about = "MXB - Mattermost <-> Matrix bridge")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $MXB_CONFIG, ./mxb.toml, then the user config dir)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Output JSON where supported
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the application-service API until Ctrl-C
    Serve,

    /// Check credentials, namespace permissions and the homeserver version
    Check,

    /// Print the effective configuration with secrets redacted
    Config,
}

/// `RUST_LOG`, then the configured level, then `info`
fn init_tracing(config_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            init_tracing(None);
            commands::config::show(cli.config.as_deref(), cli.json)
        }
        Commands::Serve => {
            let config = BridgeConfig::load(cli.config.as_deref())?;
            init_tracing(Some(&config.log_level));
            commands::serve::run(config).await
        }
        Commands::Check => {
            let config = BridgeConfig::load(cli.config.as_deref())?;
            init_tracing(Some(&config.log_level));
            commands::check::run(config, cli.json).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["mxb", "--config", "bridge.toml", "serve"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve));
        assert_eq!(cli.config, Some(PathBuf::from("bridge.toml")));

        let cli = Cli::try_parse_from(["mxb", "check", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Check));
        assert!(cli.json);

        assert!(Cli::try_parse_from(["mxb", "bogus"]).is_err());
    }
}
