//! # Matrix Wire Client
//!
//! Application-service client for the Matrix client-server, media and
//! federation version APIs.
//!
//! - `client`: connection, rooms, membership, ghost registration
//! - `media`: uploads and downloads
//! - `messages`: sends, edits, reactions, redactions, relations
//! - `discovery`: server name resolution
//! - `validate`: path component checks and URL building

mod client;
pub mod discovery;
pub mod media;
mod messages;
pub mod types;
pub mod validate;

pub use client::MatrixClient;
pub use discovery::ServerDiscovery;
pub use media::MxcUri;
pub use types::{
    AvatarData, CreateRoomOptions, FileAttachment, GhostUserCreation, GuestAccess,
    HistoryVisibility, ItemOutcome, MediaDownload, MessageRequest, Reaction, RelationsChunk, RoomPreset, SendItem, SendOutcome, ServerVersion,
    WhoAmI, BRIDGE_CHANNEL_EVENT_TYPE, FILE_ATTACHMENTS_EVENT_TYPE, POST_ID_METADATA_KEY,
};
pub use validate::validate_path_component;
