//! Message sending, edits, reactions, redactions and relation queries.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::client::MatrixClient;
use super::types::{
    EventIdResponse, FileAttachment, ItemOutcome, MessageRequest, Reaction, RelationsChunk,
    SendItem, SendOutcome, FILE_ATTACHMENTS_EVENT_TYPE,
};
use super::validate::validate_path_component;
use crate::error::{BridgeError, BridgeResult};
use crate::rate_limiter::OperationClass;

/// Upper bound on `/relations` pages followed by [`MatrixClient::get_reactions`]
const MAX_RELATION_PAGES: usize = 20;

impl MatrixClient {
    /// Send one event, impersonating `user_id` when given
    pub async fn send_event(
        &self,
        room_id: &str,
        user_id: Option<&str>,
        event_type: &str,
        content: &Value,
    ) -> BridgeResult<String> {
        let url = self
            .url()
            .path("_matrix/client/v3/rooms")
            .param("room_id", room_id)?
            .path("send")
            .param("event_type", event_type)?
            .param("txn_id", &Self::new_txn_id())?
            .query_opt("user_id", user_id)
            .build();

        let sent: EventIdResponse = self
            .call(
                "send_event",
                Some(OperationClass::Message),
                self.http().put(url).json(content),
            )
            .await?;
        debug!("Sent {} {} to {}", event_type, sent.event_id, room_id);
        Ok(sent.event_id)
    }

    /// Send text, files, or both as one logical message.
    ///
    /// With text and files the text is the primary event, each file is a
    /// reply to it, and an attachment metadata event lists the replies.
    pub async fn send_message(&self, request: &MessageRequest) -> BridgeResult<SendOutcome> {
        validate_request(request)?;

        if request.files.is_empty() {
            let event_id = self.send_text(request).await?;
            return Ok(SendOutcome {
                primary_event_id: event_id.clone(),
                items: vec![ItemOutcome::Sent {
                    item: SendItem::Text,
                    event_id,
                }],
            });
        }

        if !request.has_text() {
            return self.send_files_only(request).await;
        }

        let primary = self.send_text(request).await?;
        let mut items = vec![ItemOutcome::Sent {
            item: SendItem::Text,
            event_id: primary.clone(),
        }];

        let mut reply_ids = Vec::new();
        for file in &request.files {
            let relation = relation_for(request, Some(&primary));
            let outcome = self.send_file(request, file, relation).await;
            if let Some(id) = outcome.event_id() {
                reply_ids.push(id.to_string());
            }
            items.push(outcome);
        }

        if !reply_ids.is_empty() {
            let content = json!({
                "attachments": reply_ids,
                "m.relates_to": {"rel_type": "m.reference", "event_id": primary},
            });
            let item = SendItem::AttachmentMetadata;
            items.push(
                match self
                    .send_event(
                        &request.room_id,
                        Some(&request.ghost_user_id),
                        FILE_ATTACHMENTS_EVENT_TYPE,
                        &content,
                    )
                    .await
                {
                    Ok(event_id) => ItemOutcome::Sent { item, event_id },
                    Err(e) => {
                        warn!("Failed to send attachment metadata for {}: {}", primary, e);
                        ItemOutcome::Failed {
                            item,
                            reason: e.to_string(),
                        }
                    }
                },
            );
        }

        Ok(SendOutcome {
            primary_event_id: primary,
            items,
        })
    }

    async fn send_files_only(&self, request: &MessageRequest) -> BridgeResult<SendOutcome> {
        let mut items = Vec::with_capacity(request.files.len());
        let mut primary: Option<String> = None;
        let mut first_error: Option<String> = None;

        for file in &request.files {
            let outcome = self
                .send_file(request, file, relation_for(request, None))
                .await;
            match &outcome {
                ItemOutcome::Sent { event_id, .. } if primary.is_none() => {
                    primary = Some(event_id.clone());
                }
                ItemOutcome::Failed { reason, .. } if first_error.is_none() => {
                    first_error = Some(reason.clone());
                }
                _ => {}
            }
            items.push(outcome);
        }

        match primary {
            Some(primary_event_id) => Ok(SendOutcome {
                primary_event_id,
                items,
            }),
            None => Err(BridgeError::platform(format!(
                "no file could be sent: {}",
                first_error.unwrap_or_default()
            ))),
        }
    }

    async fn send_text(&self, request: &MessageRequest) -> BridgeResult<String> {
        let mut content = text_content(request.text.as_deref(), request.html.as_deref());
        if let Some(relation) = relation_for(request, None) {
            content.insert("m.relates_to".to_string(), relation);
        }
        merge_metadata(&mut content, &request.metadata);

        self.send_event(
            &request.room_id,
            Some(&request.ghost_user_id),
            "m.room.message",
            &Value::Object(content),
        )
        .await
    }

    /// Upload and send one file; failures are reported, not returned
    async fn send_file(
        &self,
        request: &MessageRequest,
        file: &FileAttachment,
        relation: Option<Value>,
    ) -> ItemOutcome {
        let item = SendItem::File {
            filename: file.filename.clone(),
        };

        let result: BridgeResult<String> = async {
            let mxc = self
                .upload_media(
                    file.data.clone(),
                    &file.content_type,
                    &file.filename,
                    Some(&request.ghost_user_id),
                )
                .await?;

            let mut content = Map::new();
            content.insert("msgtype".into(), json!(file.msgtype()));
            content.insert("body".into(), json!(file.filename));
            content.insert("filename".into(), json!(file.filename));
            content.insert("url".into(), json!(mxc));
            content.insert(
                "info".into(),
                json!({"mimetype": file.content_type, "size": file.data.len()}),
            );
            if let Some(relation) = relation {
                content.insert("m.relates_to".into(), relation);
            }
            merge_metadata(&mut content, &request.metadata);

            self.send_event(
                &request.room_id,
                Some(&request.ghost_user_id),
                "m.room.message",
                &Value::Object(content),
            )
            .await
        }
        .await;

        match result {
            Ok(event_id) => ItemOutcome::Sent { item, event_id },
            Err(e) => {
                warn!("Failed to send file {}: {}", file.filename, e);
                ItemOutcome::Failed {
                    item,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Replace the content of `event_id`
    pub async fn edit_message(
        &self,
        room_id: &str,
        ghost_user_id: &str,
        event_id: &str,
        text: &str,
        html: Option<&str>,
    ) -> BridgeResult<String> {
        validate_path_component("event_id", event_id)?;

        let new_content = text_content(Some(text), html);
        let mut content = text_content(
            Some(&format!("* {}", text)),
            html.map(|h| format!("* {}", h)).as_deref(),
        );
        content.insert("m.new_content".into(), Value::Object(new_content));
        content.insert(
            "m.relates_to".into(),
            json!({"rel_type": "m.replace", "event_id": event_id}),
        );

        self.send_event(
            room_id,
            Some(ghost_user_id),
            "m.room.message",
            &Value::Object(content),
        )
        .await
    }

    /// `m.annotation` on `event_id`; returns the reaction event id
    pub async fn add_reaction(
        &self,
        room_id: &str,
        user_id: &str,
        event_id: &str,
        key: &str,
    ) -> BridgeResult<String> {
        validate_path_component("event_id", event_id)?;
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": event_id,
                "key": key,
            }
        });
        self.send_event(room_id, Some(user_id), "m.reaction", &content)
            .await
    }

    pub async fn remove_reaction(
        &self,
        room_id: &str,
        user_id: &str,
        reaction_event_id: &str,
    ) -> BridgeResult<String> {
        self.redact_event(room_id, Some(user_id), reaction_event_id, None)
            .await
    }

    /// Redact `event_id`; returns the redaction event id
    pub async fn redact_event(
        &self,
        room_id: &str,
        user_id: Option<&str>,
        event_id: &str,
        reason: Option<&str>,
    ) -> BridgeResult<String> {
        let url = self
            .url()
            .path("_matrix/client/v3/rooms")
            .param("room_id", room_id)?
            .path("redact")
            .param("event_id", event_id)?
            .param("txn_id", &Self::new_txn_id())?
            .query_opt("user_id", user_id)
            .build();

        let body = match reason {
            Some(reason) => json!({"reason": reason}),
            None => json!({}),
        };
        let redacted: EventIdResponse = self
            .call(
                "redact_event",
                Some(OperationClass::Message),
                self.http().put(url).json(&body),
            )
            .await?;
        Ok(redacted.event_id)
    }

    /// First page of child events related to `event_id`
    pub async fn get_event_relations(
        &self,
        room_id: &str,
        event_id: &str,
        rel_type: Option<&str>,
    ) -> BridgeResult<RelationsChunk> {
        self.relations_page(room_id, event_id, rel_type, None).await
    }

    async fn relations_page(
        &self,
        room_id: &str,
        event_id: &str,
        rel_type: Option<&str>,
        from: Option<&str>,
    ) -> BridgeResult<RelationsChunk> {
        let mut url = self
            .url()
            .path("_matrix/client/v1/rooms")
            .param("room_id", room_id)?
            .path("relations")
            .param("event_id", event_id)?;
        if let Some(rel_type) = rel_type {
            url = url.param("rel_type", rel_type)?;
        }
        let url = url.query_opt("from", from).build();

        self.call("get_event_relations", None, self.http().get(url))
            .await
    }

    /// Every `m.annotation` on `event_id`
    pub async fn get_reactions(&self, room_id: &str, event_id: &str) -> BridgeResult<Vec<Reaction>> {
        let mut reactions = Vec::new();
        let mut from: Option<String> = None;

        for _ in 0..MAX_RELATION_PAGES {
            let page = self
                .relations_page(room_id, event_id, Some("m.annotation"), from.as_deref())
                .await?;
            reactions.extend(page.chunk.iter().filter_map(Reaction::from_event));
            match page.next_batch {
                Some(next) if !page.chunk.is_empty() => from = Some(next),
                _ => break,
            }
        }

        Ok(reactions)
    }
}

fn validate_request(request: &MessageRequest) -> BridgeResult<()> {
    if request.room_id.is_empty() {
        return Err(BridgeError::validation("room_id is required"));
    }
    if request.ghost_user_id.is_empty() {
        return Err(BridgeError::validation("ghost_user_id is required"));
    }
    if !request.has_text() && request.files.is_empty() {
        return Err(BridgeError::validation("no message content or files to send"));
    }
    validate_path_component("room_id", &request.room_id)?;
    validate_path_component("ghost_user_id", &request.ghost_user_id)?;
    for root in [&request.thread_root, &request.reply_to].into_iter().flatten() {
        validate_path_component("event_id", root)?;
    }
    Ok(())
}

fn text_content(text: Option<&str>, html: Option<&str>) -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("msgtype".into(), json!("m.text"));
    let body = text.filter(|t| !t.is_empty()).or(html).unwrap_or_default();
    content.insert("body".into(), json!(body));
    if let Some(html) = html.filter(|h| !h.is_empty()) {
        content.insert("format".into(), json!("org.matrix.custom.html"));
        content.insert("formatted_body".into(), json!(html));
    }
    content
}

/// Thread and reply relation; `reply_override` replaces the reply target
fn relation_for(request: &MessageRequest, reply_override: Option<&str>) -> Option<Value> {
    let reply_to = reply_override.or(request.reply_to.as_deref());
    match (request.thread_root.as_deref(), reply_to) {
        (Some(root), reply) => Some(json!({
            "rel_type": "m.thread",
            "event_id": root,
            "is_falling_back": reply.is_none(),
            "m.in_reply_to": {"event_id": reply.unwrap_or(root)},
        })),
        (None, Some(reply)) => Some(json!({"m.in_reply_to": {"event_id": reply}})),
        (None, None) => None,
    }
}

/// Caller metadata never overrides keys already set
fn merge_metadata(content: &mut Map<String, Value>, metadata: &Map<String, Value>) {
    for (key, value) in metadata {
        content.entry(key.clone()).or_insert_with(|| value.clone());
    }
}
