//! # Bridge Assembly
//!
//! Wires configuration, the wire client, the trusted store, the mapper and
//! both sync directions into one runnable unit.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mxb_core::{Bridge, BridgeConfig};
//! use mxb_core::sync::MemoryPlatform;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mxb_core::error::BridgeResult<()> {
//! let config = BridgeConfig::load(None)?;
//! let bridge = Bridge::build(config, Arc::new(MemoryPlatform::new())).await?;
//! bridge.serve(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::appservice::{self, AppServiceState, TransactionLedger, TransactionProcessor};
use crate::config::{BridgeConfig, StoreConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::mapper::IdentityMapper;
use crate::matrix::{MatrixClient, ServerVersion, WhoAmI};
use crate::post_tracker::PostTracker;
use crate::store::{MemoryKvStore, SharedStore, SqliteKvStore};
use crate::sync::{LocalPlatform, OutboundSync, PlatformEventHandler};

/// Result of [`Bridge::check`]
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub whoami: WhoAmI,
    pub server_name: String,
    pub server_version: ServerVersion,
}

pub struct Bridge {
    config: BridgeConfig,
    client: MatrixClient,
    mapper: Arc<IdentityMapper>,
    processor: Arc<TransactionProcessor>,
    outbound: Arc<OutboundSync>,
}

impl Bridge {
    /// Discover the server name, open the store and assemble every component
    pub async fn build(config: BridgeConfig, platform: Arc<dyn LocalPlatform>) -> BridgeResult<Self> {
        config.validate()?;
        let client = MatrixClient::connect(config.matrix.clone(), &config.rate_limits).await?;
        let store = open_store(&config.store)?;
        Ok(Self::assemble(config, client, store, platform))
    }

    /// Assemble around an existing client and store
    pub fn assemble(
        config: BridgeConfig,
        client: MatrixClient,
        store: SharedStore,
        platform: Arc<dyn LocalPlatform>,
    ) -> Self {
        let mapper = Arc::new(IdentityMapper::new(client.clone(), store));
        let handler = Arc::new(PlatformEventHandler::new(platform.clone(), mapper.clone()));
        let processor = Arc::new(TransactionProcessor::new(
            Arc::new(TransactionLedger::from_config(&config.tracking)),
            mapper.clone(),
            handler,
            platform,
        ));
        let outbound = Arc::new(OutboundSync::new(
            mapper.clone(),
            Arc::new(PostTracker::from_config(&config.tracking)),
        ));

        Self {
            config,
            client,
            mapper,
            processor,
            outbound,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn client(&self) -> &MatrixClient {
        &self.client
    }

    pub fn mapper(&self) -> &Arc<IdentityMapper> {
        &self.mapper
    }

    pub fn processor(&self) -> &Arc<TransactionProcessor> {
        &self.processor
    }

    /// Entry point for local-side events
    pub fn outbound(&self) -> &Arc<OutboundSync> {
        &self.outbound
    }

    pub fn router(&self) -> Router {
        let state = AppServiceState::new(
            self.processor.clone(),
            self.config.appservice.hs_token.clone(),
        );
        appservice::router(state, self.config.appservice.max_body_bytes)
    }

    /// Credentials, namespace permissions and server software
    pub async fn check(&self) -> BridgeResult<CheckReport> {
        let whoami = self.client.test_connection().await?;
        self.client.test_appservice_permissions().await?;
        let server_version = self.client.get_server_version().await?;
        Ok(CheckReport {
            whoami,
            server_name: self.client.server_name().to_string(),
            server_version,
        })
    }

    /// Serve the application-service API until `shutdown` is cancelled
    pub async fn serve(&self, shutdown: CancellationToken) -> BridgeResult<()> {
        let addr = self.config.appservice.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::config(format!("failed to bind {}: {}", addr, e)))?;
        info!("Application service listening on {}", addr);

        let client = self.client.clone();
        let signal = async move {
            shutdown.cancelled().await;
            info!("Shutdown requested, draining in-flight transactions");
            client.shutdown();
        };

        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| BridgeError::network("serve", e))?;

        info!("Application service stopped");
        Ok(())
    }
}

/// SQLite when a path is configured, memory otherwise
pub fn open_store(config: &StoreConfig) -> BridgeResult<SharedStore> {
    match &config.path {
        Some(path) => {
            info!("Opening store at {}", path.display());
            Ok(Arc::new(SqliteKvStore::open(path)?))
        }
        None => {
            warn!("No store path configured, mappings will not survive a restart");
            Ok(Arc::new(MemoryKvStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatrixConfig, RateLimitConfig};
    use crate::sync::MemoryPlatform;

    #[test]
    fn test_open_store_variants() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_store(&StoreConfig::default()).is_ok());
        assert!(open_store(&StoreConfig {
            path: Some(dir.path().join("bridge.db")),
        })
        .is_ok());
        assert!(dir.path().join("bridge.db").exists());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let err = Bridge::build(BridgeConfig::default(), Arc::new(MemoryPlatform::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let matrix = MatrixConfig::new("http://127.0.0.1:9", "as-token");
        let mut config = BridgeConfig::new(matrix.clone());
        config.appservice.bind_address = "127.0.0.1".into();
        config.appservice.port = 0;
        let client = MatrixClient::new(matrix, &RateLimitConfig::unlimited(), "example.com").unwrap();
        let bridge = Bridge::assemble(
            config,
            client,
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryPlatform::new()),
        );

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        bridge.serve(shutdown).await.unwrap();
        assert!(bridge.client().is_shut_down());
    }
}
