//! Request and response types for the homeserver APIs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// State event carrying the bridged channel id
pub const BRIDGE_CHANNEL_EVENT_TYPE: &str = "org.mxb.channel";

/// Metadata event listing the file replies of a text-plus-files send
pub const FILE_ATTACHMENTS_EVENT_TYPE: &str = "org.mxb.file_attachments";

/// Content key linking a Matrix event back to its local post
pub const POST_ID_METADATA_KEY: &str = "mattermost_post_id";

/// `GET /account/whoami`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WhoAmI {
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Homeserver software name and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub name: String,
    pub version: String,
}

/// Matrix error envelope
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub errcode: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RoomIdResponse {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EventIdResponse {
    pub event_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ContentUriResponse {
    pub content_uri: String,
}

/// `createRoom` preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPreset {
    #[default]
    PrivateChat,
    PublicChat,
    TrustedPrivateChat,
}

/// `m.room.history_visibility` for new rooms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryVisibility {
    Invited,
    Joined,
    #[default]
    Shared,
    WorldReadable,
}

/// `m.room.guest_access` for new rooms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestAccess {
    CanJoin,
    #[default]
    Forbidden,
}

/// Options for [`MatrixClient::create_room`](super::MatrixClient::create_room)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateRoomOptions {
    pub name: Option<String>,
    pub topic: Option<String>,
    /// Alias localpart without the bridge prefix; becomes `#{prefix}{name}:{domain}`
    pub alias_name: Option<String>,
    pub preset: RoomPreset,
    pub history_visibility: HistoryVisibility,
    pub guest_access: GuestAccess,
    /// Publish the room in the room directory
    pub publish: bool,
    /// Local channel recorded in the bridge state event
    pub channel_id: Option<String>,
    /// Also register the secondary bridge-filter alias
    pub filter_alias: bool,
    pub invite: Vec<String>,
    pub is_direct: bool,
}

impl CreateRoomOptions {
    pub fn for_channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_alias(mut self, alias_name: impl Into<String>) -> Self {
        self.alias_name = Some(alias_name.into());
        self
    }

    pub fn public(mut self) -> Self {
        self.preset = RoomPreset::PublicChat;
        self.publish = true;
        self
    }

    pub fn with_history_visibility(mut self, visibility: HistoryVisibility) -> Self {
        self.history_visibility = visibility;
        self
    }

    pub fn with_guest_access(mut self, access: GuestAccess) -> Self {
        self.guest_access = access;
        self
    }

    pub fn with_filter_alias(mut self) -> Self {
        self.filter_alias = true;
        self
    }

    pub fn with_invite(mut self, user_id: impl Into<String>) -> Self {
        self.invite.push(user_id.into());
        self
    }
}

/// Avatar image to upload while creating a ghost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarData {
    pub data: Bytes,
    pub content_type: String,
}

/// Result of ghost registration. Profile failures do not fail registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostUserCreation {
    pub user_id: String,
    /// Whether the account already existed (`M_USER_IN_USE`)
    pub already_existed: bool,
    pub display_name_error: Option<String>,
    pub avatar_error: Option<String>,
}

/// One file of a [`MessageRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Bytes,
}

impl FileAttachment {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// `m.image`, `m.video`, `m.audio` or `m.file` by MIME major type
    pub fn msgtype(&self) -> &'static str {
        msgtype_for_content_type(&self.content_type)
    }
}

pub fn msgtype_for_content_type(content_type: &str) -> &'static str {
    let major = content_type
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match major.as_str() {
        "image" => "m.image",
        "video" => "m.video",
        "audio" => "m.audio",
        _ => "m.file",
    }
}

/// Consolidated outbound message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRequest {
    pub room_id: String,
    pub ghost_user_id: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub files: Vec<FileAttachment>,
    pub thread_root: Option<String>,
    pub reply_to: Option<String>,
    /// Extra content keys; never override keys the client sets itself
    pub metadata: Map<String, Value>,
}

impl MessageRequest {
    pub fn new(room_id: impl Into<String>, ghost_user_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ghost_user_id: ghost_user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn with_file(mut self, file: FileAttachment) -> Self {
        self.files.push(file);
        self
    }

    pub fn in_thread(mut self, root_event_id: impl Into<String>) -> Self {
        self.thread_root = Some(root_event_id.into());
        self
    }

    pub fn replying_to(mut self, event_id: impl Into<String>) -> Self {
        self.reply_to = Some(event_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty())
            || self.html.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// What a single sub-send carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendItem {
    Text,
    File { filename: String },
    AttachmentMetadata,
}

/// Result of one sub-send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Sent { item: SendItem, event_id: String },
    Failed { item: SendItem, reason: String },
}

impl ItemOutcome {
    pub fn event_id(&self) -> Option<&str> {
        match self {
            ItemOutcome::Sent { event_id, .. } => Some(event_id),
            ItemOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }
}

/// Result of [`MatrixClient::send_message`](super::MatrixClient::send_message)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub primary_event_id: String,
    pub items: Vec<ItemOutcome>,
}

impl SendOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| i.is_failed())
    }

    pub fn all_sent(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Downloaded media body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDownload {
    pub data: Bytes,
    pub content_type: Option<String>,
    /// Endpoint that served the body
    pub source: String,
}

/// One page of `/relations`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelationsChunk {
    #[serde(default)]
    pub chunk: Vec<Value>,
    #[serde(default)]
    pub next_batch: Option<String>,
}

/// An `m.annotation` reaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub event_id: String,
    pub sender: String,
    pub key: String,
}

impl Reaction {
    pub(crate) fn from_event(event: &Value) -> Option<Self> {
        let relates = event.get("content")?.get("m.relates_to")?;
        if relates.get("rel_type")?.as_str()? != "m.annotation" {
            return None;
        }
        Some(Self {
            event_id: event.get("event_id")?.as_str()?.to_string(),
            sender: event.get("sender")?.as_str()?.to_string(),
            key: relates.get("key")?.as_str()?.to_string(),
        })
    }
}
