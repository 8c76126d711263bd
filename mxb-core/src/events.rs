//! # Matrix Event Model
//!
//! Events pushed by the homeserver are parsed once at ingestion. The wire
//! `type` string becomes an [`EventKind`] and the content is decoded into the
//! matching [`EventContent`] variant. Content fields stay optional here and
//! are checked by the handlers that need them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, BridgeResult};
use crate::matrix::{FILE_ATTACHMENTS_EVENT_TYPE, POST_ID_METADATA_KEY};

/// Event type after ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Reaction,
    Member,
    Redaction,
    BridgeMetadata,
    Other,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "m.room.message" => EventKind::Message,
            "m.reaction" => EventKind::Reaction,
            "m.room.member" => EventKind::Member,
            "m.room.redaction" => EventKind::Redaction,
            FILE_ATTACHMENTS_EVENT_TYPE => EventKind::BridgeMetadata,
            _ => EventKind::Other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: String,
}

/// `m.relates_to`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, rename = "m.in_reply_to", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<InReplyTo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_falling_back: Option<bool>,
}

impl RelatesTo {
    fn target_if(&self, rel_type: &str) -> Option<&str> {
        if self.rel_type.as_deref() == Some(rel_type) {
            self.event_id.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// `m.room.message`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub formatted_body: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub info: Option<MediaInfo>,
    #[serde(default, rename = "m.relates_to")]
    pub relates_to: Option<RelatesTo>,
    #[serde(default, rename = "m.new_content")]
    pub new_content: Option<Box<MessageContent>>,
    /// Set on events the bridge itself sent for a local post
    #[serde(default, rename = "mattermost_post_id")]
    pub post_id: Option<String>,
}

impl MessageContent {
    pub fn is_media(&self) -> bool {
        matches!(
            self.msgtype.as_deref(),
            Some("m.image" | "m.video" | "m.audio" | "m.file")
        ) && self.url.is_some()
    }

    /// Event replaced by this edit
    pub fn edit_target(&self) -> Option<&str> {
        self.relates_to.as_ref()?.target_if("m.replace")
    }

    pub fn thread_root(&self) -> Option<&str> {
        self.relates_to.as_ref()?.target_if("m.thread")
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.relates_to
            .as_ref()?
            .in_reply_to
            .as_ref()
            .map(|r| r.event_id.as_str())
    }

    /// HTML when present, else the plain body
    pub fn best_text(&self) -> Option<&str> {
        let html = self
            .formatted_body
            .as_deref()
            .filter(|_| self.format.as_deref() == Some("org.matrix.custom.html"));
        html.or(self.body.as_deref())
    }

    pub fn media_filename(&self) -> &str {
        self.filename
            .as_deref()
            .or(self.body.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or("attachment")
    }
}

/// `m.reaction`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionContent {
    #[serde(default, rename = "m.relates_to")]
    pub relates_to: Option<RelatesTo>,
}

impl ReactionContent {
    pub fn target(&self) -> Option<&str> {
        self.relates_to.as_ref()?.target_if("m.annotation")
    }

    pub fn key(&self) -> Option<&str> {
        self.relates_to.as_ref()?.key.as_deref()
    }
}

/// `membership` values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
    Other(String),
}

impl Membership {
    pub fn parse(value: &str) -> Self {
        match value {
            "join" => Membership::Join,
            "invite" => Membership::Invite,
            "leave" => Membership::Leave,
            "ban" => Membership::Ban,
            "knock" => Membership::Knock,
            other => Membership::Other(other.to_string()),
        }
    }
}

/// `m.room.member`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberContent {
    #[serde(default)]
    pub membership: String,
    #[serde(default)]
    pub displayname: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_direct: Option<bool>,
}

impl MemberContent {
    pub fn membership(&self) -> Membership {
        Membership::parse(&self.membership)
    }
}

/// `m.room.redaction`; newer room versions carry `redacts` in the content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionContent {
    #[serde(default)]
    pub redacts: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Attachment listing sent after a text-plus-files message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default, rename = "m.relates_to")]
    pub relates_to: Option<RelatesTo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventContent {
    Message(MessageContent),
    Reaction(ReactionContent),
    Member(MemberContent),
    Redaction(RedactionContent),
    BridgeMetadata(AttachmentMetadata),
    Other(Value),
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    event_id: String,
    sender: String,
    room_id: String,
    #[serde(default = "empty_object")]
    content: Value,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    origin_server_ts: Option<i64>,
    #[serde(default)]
    redacts: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A parsed homeserver event
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixEvent {
    pub event_id: String,
    /// Wire type string, kept for logging
    pub event_type: String,
    pub kind: EventKind,
    pub sender: String,
    pub room_id: String,
    pub state_key: Option<String>,
    pub origin_server_ts: Option<i64>,
    pub redacts: Option<String>,
    pub content: EventContent,
}

impl MatrixEvent {
    pub fn from_value(raw: Value) -> BridgeResult<Self> {
        let raw: RawEvent = serde_json::from_value(raw)
            .map_err(|e| BridgeError::Serialization(format!("invalid event: {}", e)))?;
        let kind = EventKind::from_type(&raw.event_type);
        let content = decode_content(kind, raw.content).map_err(|e| {
            BridgeError::Serialization(format!(
                "invalid {} content in {}: {}",
                raw.event_type, raw.event_id, e
            ))
        })?;

        Ok(Self {
            event_id: raw.event_id,
            event_type: raw.event_type,
            kind,
            sender: raw.sender,
            room_id: raw.room_id,
            state_key: raw.state_key,
            origin_server_ts: raw.origin_server_ts,
            redacts: raw.redacts,
            content,
        })
    }

    /// Redaction target from the top level or the content
    pub fn redaction_target(&self) -> Option<&str> {
        match &self.content {
            EventContent::Redaction(content) => {
                self.redacts.as_deref().or(content.redacts.as_deref())
            }
            _ => self.redacts.as_deref(),
        }
    }

    /// User a membership event applies to
    pub fn membership_target(&self) -> Option<&str> {
        match self.kind {
            EventKind::Member => self.state_key.as_deref().filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageContent> {
        match &self.content {
            EventContent::Message(content) => Some(content),
            _ => None,
        }
    }

    pub fn as_member(&self) -> Option<&MemberContent> {
        match &self.content {
            EventContent::Member(content) => Some(content),
            _ => None,
        }
    }

    /// Local post id when the event was sent by the bridge
    pub fn bridged_post_id(&self) -> Option<&str> {
        match &self.content {
            EventContent::Message(content) => content.post_id.as_deref(),
            EventContent::Other(value) => value.get(POST_ID_METADATA_KEY)?.as_str(),
            _ => None,
        }
    }
}

fn decode_content(kind: EventKind, content: Value) -> Result<EventContent, serde_json::Error> {
    Ok(match kind {
        EventKind::Message => EventContent::Message(serde_json::from_value(content)?),
        EventKind::Reaction => EventContent::Reaction(serde_json::from_value(content)?),
        EventKind::Member => EventContent::Member(serde_json::from_value(content)?),
        EventKind::Redaction => EventContent::Redaction(serde_json::from_value(content)?),
        EventKind::BridgeMetadata => EventContent::BridgeMetadata(serde_json::from_value(content)?),
        EventKind::Other => EventContent::Other(content),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, content: Value) -> Value {
        json!({
            "type": event_type,
            "event_id": "$e1",
            "sender": "@alice:example.com",
            "room_id": "!room:example.com",
            "origin_server_ts": 1700000000000i64,
            "content": content,
        })
    }

    #[test]
    fn test_parse_text_message() {
        let parsed = MatrixEvent::from_value(event(
            "m.room.message",
            json!({
                "msgtype": "m.text",
                "body": "hello",
                "format": "org.matrix.custom.html",
                "formatted_body": "<b>hello</b>",
                "m.relates_to": {"rel_type": "m.thread", "event_id": "$root"},
            }),
        ))
        .unwrap();

        assert_eq!(parsed.kind, EventKind::Message);
        let message = parsed.as_message().unwrap();
        assert_eq!(message.best_text(), Some("<b>hello</b>"));
        assert_eq!(message.thread_root(), Some("$root"));
        assert_eq!(message.edit_target(), None);
        assert!(!message.is_media());
    }

    #[test]
    fn test_parse_edit_and_media() {
        let edit = MatrixEvent::from_value(event(
            "m.room.message",
            json!({
                "msgtype": "m.text",
                "body": "* fixed",
                "m.new_content": {"msgtype": "m.text", "body": "fixed"},
                "m.relates_to": {"rel_type": "m.replace", "event_id": "$orig"},
            }),
        ))
        .unwrap();
        let message = edit.as_message().unwrap();
        assert_eq!(message.edit_target(), Some("$orig"));
        assert_eq!(
            message.new_content.as_ref().and_then(|c| c.body.as_deref()),
            Some("fixed")
        );

        let media = MatrixEvent::from_value(event(
            "m.room.message",
            json!({"msgtype": "m.image", "body": "cat.png", "url": "mxc://example.com/abc",
                   "info": {"mimetype": "image/png", "size": 12}}),
        ))
        .unwrap();
        let message = media.as_message().unwrap();
        assert!(message.is_media());
        assert_eq!(message.media_filename(), "cat.png");
    }

    #[test]
    fn test_parse_reaction_and_redaction() {
        let reaction = MatrixEvent::from_value(event(
            "m.reaction",
            json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": "$t", "key": "👍"}}),
        ))
        .unwrap();
        match &reaction.content {
            EventContent::Reaction(content) => {
                assert_eq!(content.target(), Some("$t"));
                assert_eq!(content.key(), Some("👍"));
            }
            other => panic!("unexpected content {:?}", other),
        }

        let mut raw = event("m.room.redaction", json!({}));
        raw["redacts"] = json!("$old");
        let redaction = MatrixEvent::from_value(raw).unwrap();
        assert_eq!(redaction.redaction_target(), Some("$old"));

        let in_content =
            MatrixEvent::from_value(event("m.room.redaction", json!({"redacts": "$v11"}))).unwrap();
        assert_eq!(in_content.redaction_target(), Some("$v11"));
    }

    #[test]
    fn test_parse_membership() {
        let mut raw = event("m.room.member", json!({"membership": "invite", "is_direct": true}));
        raw["state_key"] = json!("@_mattermost_bob:example.com");
        let parsed = MatrixEvent::from_value(raw).unwrap();
        assert_eq!(parsed.membership_target(), Some("@_mattermost_bob:example.com"));
        assert_eq!(parsed.as_member().unwrap().membership(), Membership::Invite);
    }

    #[test]
    fn test_unknown_type_kept_as_other() {
        let parsed =
            MatrixEvent::from_value(event("m.room.topic", json!({"topic": "hi"}))).unwrap();
        assert_eq!(parsed.kind, EventKind::Other);
        assert!(matches!(parsed.content, EventContent::Other(_)));
    }

    #[test]
    fn test_bridge_metadata_kind() {
        let parsed = MatrixEvent::from_value(event(
            FILE_ATTACHMENTS_EVENT_TYPE,
            json!({"attachments": ["$a", "$b"]}),
        ))
        .unwrap();
        match parsed.content {
            EventContent::BridgeMetadata(meta) => assert_eq!(meta.attachments.len(), 2),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_malformed_events_rejected() {
        let missing_sender = json!({"type": "m.room.message", "event_id": "$e", "room_id": "!r"});
        assert!(matches!(
            MatrixEvent::from_value(missing_sender),
            Err(BridgeError::Serialization(_))
        ));

        let bad_content = event("m.room.message", json!({"body": 42}));
        assert!(MatrixEvent::from_value(bad_content).is_err());

        assert!(MatrixEvent::from_value(json!("not an object")).is_err());
    }

    #[test]
    fn test_bridged_post_id() {
        let parsed = MatrixEvent::from_value(event(
            "m.room.message",
            json!({"msgtype": "m.text", "body": "x", "mattermost_post_id": "p1"}),
        ))
        .unwrap();
        assert_eq!(parsed.bridged_post_id(), Some("p1"));
    }
}
