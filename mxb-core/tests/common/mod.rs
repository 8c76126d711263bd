//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use httpmock::MockServer;
use mxb_core::config::{MatrixConfig, RateLimitConfig};
use mxb_core::store::MemoryKvStore;
use mxb_core::{IdentityMapper, MatrixClient};

pub const SERVER_NAME: &str = "example.com";

pub fn client_with_limits(server: &MockServer, limits: &RateLimitConfig) -> MatrixClient {
    MatrixClient::new(
        MatrixConfig::new(server.base_url(), "as-token"),
        limits,
        SERVER_NAME,
    )
    .expect("client")
}

pub fn client(server: &MockServer) -> MatrixClient {
    client_with_limits(server, &RateLimitConfig::unlimited())
}

pub fn mapper(server: &MockServer) -> (Arc<IdentityMapper>, MemoryKvStore) {
    let store = MemoryKvStore::new();
    let mapper = IdentityMapper::new(client(server), Arc::new(store.clone()));
    (Arc::new(mapper), store)
}
