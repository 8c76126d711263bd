//! Directional sync between Matrix and the local chat server.

pub mod inbound;
pub mod outbound;
pub mod platform;

pub use inbound::PlatformEventHandler;
pub use outbound::{LocalPost, LocalReaction, OutboundSync};
pub use platform::{LocalFile, LocalPlatform, MemoryPlatform, NewPost, StoredPost};
