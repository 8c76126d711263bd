//! # MXB Core Library
//!
//! Core of a Mattermost <-> Matrix bridge running as a Matrix application
//! service.
//!
//! ## Architecture
//!
//! - **Rate Limiter**: per-operation-class token bucket or interval gate
//! - **Matrix**: wire client for rooms, ghosts, messages, media and discovery
//! - **Events**: typed model of pushed homeserver events
//! - **Store**: trusted key-value persistence (memory or SQLite)
//! - **Mapper**: local user <-> ghost and channel <-> room mappings
//! - **Post Tracker**: bounded last-modified cache that suppresses redundant edits
//! - **App Service**: webhook, transaction ledger and event routing
//! - **Sync**: Matrix -> local and local -> Matrix propagation
//!
//! ```text
//! homeserver ──PUT /transactions──▶ appservice ──▶ sync::inbound ──▶ LocalPlatform
//! LocalPlatform events ──▶ sync::outbound ──▶ matrix::MatrixClient ──▶ homeserver
//! ```

pub mod appservice;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod mapper;
pub mod matrix;
pub mod post_tracker;
pub mod rate_limiter;
pub mod store;
pub mod sync;

pub use bridge::{Bridge, CheckReport};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use mapper::{GhostProfile, IdentityMapper};
pub use matrix::MatrixClient;
pub use rate_limiter::{OperationClass, RateLimiters};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
