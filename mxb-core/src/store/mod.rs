//! # Trusted Key-Value Store
//!
//! The bridge persists mappings through a minimal key-value contract: byte
//! values, prefix listing, no cross-key transactions.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mxb_core::store::{KvStore, MemoryKvStore};
//!
//! # async fn example() -> mxb_core::error::BridgeResult<()> {
//! let store = MemoryKvStore::new();
//! store.set("channel_room_abc", b"!room:example.com").await?;
//!
//! if let Some(room) = store.get_string("channel_room_abc").await? {
//!     println!("room: {}", room);
//! }
//! # Ok(())
//! # }
//! ```

pub mod keys;
mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{BridgeError, BridgeResult};

pub use sqlite::SqliteKvStore;

/// Key-value persistence consumed by the mapper and sync layers
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> BridgeResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> BridgeResult<()>;

    async fn delete(&self, key: &str) -> BridgeResult<()>;

    /// Keys starting with `prefix`, in ascending order
    async fn list_keys(&self, prefix: &str) -> BridgeResult<Vec<String>>;

    async fn get_string(&self, key: &str) -> BridgeResult<Option<String>> {
        match self.get(key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| BridgeError::store(format!("value of {} is not UTF-8: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn set_string(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.set(key, value.as_bytes()).await
    }
}

/// Shared store handle
pub type SharedStore = Arc<dyn KvStore>;

/// In-process store; used by tests and when no store path is configured
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        self.data
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> BridgeResult<Vec<String>> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
