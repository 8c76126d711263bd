//! Matrix -> local platform.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::platform::{LocalFile, LocalPlatform, NewPost};
use crate::appservice::EventHandler;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventContent, MatrixEvent, Membership, MessageContent};
use crate::mapper::IdentityMapper;
use crate::store::{keys, KvStore};

/// Local reaction created for a Matrix reaction event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BridgedReaction {
    pub post_id: String,
    pub user_id: String,
    pub emoji: String,
}

/// Applies routed Matrix events to the local platform
pub struct PlatformEventHandler {
    platform: Arc<dyn LocalPlatform>,
    mapper: Arc<IdentityMapper>,
}

impl PlatformEventHandler {
    pub fn new(platform: Arc<dyn LocalPlatform>, mapper: Arc<IdentityMapper>) -> Self {
        Self { platform, mapper }
    }

    fn store(&self) -> &dyn KvStore {
        self.mapper.store().as_ref()
    }

    async fn post_for_event(&self, event_id: &str) -> BridgeResult<Option<String>> {
        self.store().get_string(&keys::event_post(event_id)).await
    }

    async fn record_post(&self, post_id: &str, event_id: &str) -> BridgeResult<()> {
        self.store()
            .set_string(&keys::post_event(post_id), event_id)
            .await?;
        self.store()
            .set_string(&keys::event_post(event_id), post_id)
            .await
    }

    async fn apply_edit(
        &self,
        event: &MatrixEvent,
        content: &MessageContent,
        target: &str,
    ) -> BridgeResult<()> {
        let Some(post_id) = self.post_for_event(target).await? else {
            debug!("Edit {} targets unbridged event {}", event.event_id, target);
            return Ok(());
        };
        let text = content
            .new_content
            .as_deref()
            .and_then(MessageContent::best_text)
            .or_else(|| content.best_text())
            .unwrap_or_default();
        self.platform.update_post(&post_id, text).await?;
        debug!("Applied edit {} to post {}", event.event_id, post_id);
        Ok(())
    }

    async fn root_post(&self, content: &MessageContent) -> BridgeResult<Option<String>> {
        let Some(root_event) = content.thread_root().or_else(|| content.reply_to()) else {
            return Ok(None);
        };
        let root = self.post_for_event(root_event).await?;
        if root.is_none() {
            debug!("Thread root {} is not bridged, posting top-level", root_event);
        }
        Ok(root)
    }

    async fn download_attachment(&self, content: &MessageContent) -> BridgeResult<LocalFile> {
        let url = content
            .url
            .as_deref()
            .ok_or_else(|| BridgeError::validation("media message has no url"))?;
        let download = self.mapper.client().download_media(url).await?;
        let content_type = download
            .content_type
            .or_else(|| content.info.as_ref().and_then(|i| i.mimetype.clone()));
        Ok(LocalFile {
            filename: content.media_filename().to_string(),
            content_type,
            data: download.data,
        })
    }
}

#[async_trait]
impl EventHandler for PlatformEventHandler {
    async fn on_message(&self, event: &MatrixEvent, channel_id: &str) -> BridgeResult<()> {
        let content = event
            .as_message()
            .ok_or_else(|| BridgeError::validation("not a message event"))?;

        if let Some(post_id) = event.bridged_post_id() {
            debug!("{} mirrors local post {}, skipping", event.event_id, post_id);
            return Ok(());
        }
        if self.post_for_event(&event.event_id).await?.is_some() {
            debug!("{} is already bridged", event.event_id);
            return Ok(());
        }

        if let Some(target) = content.edit_target() {
            return self.apply_edit(event, content, target).await;
        }

        let user_id = self.platform.ensure_remote_user(&event.sender, None).await?;
        let root_id = self.root_post(content).await?;

        let (message, files) = if content.is_media() {
            (String::new(), vec![self.download_attachment(content).await?])
        } else {
            (content.best_text().unwrap_or_default().to_string(), Vec::new())
        };

        let post_id = self
            .platform
            .create_post(NewPost {
                channel_id: channel_id.to_string(),
                user_id,
                message,
                root_id,
                files,
                matrix_event_id: Some(event.event_id.clone()),
            })
            .await?;
        self.record_post(&post_id, &event.event_id).await?;
        debug!("Bridged {} as post {}", event.event_id, post_id);
        Ok(())
    }

    async fn on_reaction(&self, event: &MatrixEvent, _channel_id: &str) -> BridgeResult<()> {
        let EventContent::Reaction(content) = &event.content else {
            return Err(BridgeError::validation("not a reaction event"));
        };
        let (Some(target), Some(emoji)) = (content.target(), content.key()) else {
            return Err(BridgeError::validation("reaction has no annotation"));
        };

        let Some(post_id) = self.post_for_event(target).await? else {
            debug!("Reaction {} targets unbridged event {}", event.event_id, target);
            return Ok(());
        };
        let user_id = self.platform.ensure_remote_user(&event.sender, None).await?;

        let record = BridgedReaction {
            post_id,
            user_id,
            emoji: emoji.to_string(),
        };
        self.store()
            .set(
                &keys::reaction_event(&event.event_id),
                &serde_json::to_vec(&record)?,
            )
            .await?;
        self.platform
            .add_reaction(&record.post_id, &record.user_id, &record.emoji)
            .await
    }

    async fn on_redaction(&self, event: &MatrixEvent, _channel_id: &str) -> BridgeResult<()> {
        let Some(target) = event.redaction_target() else {
            return Err(BridgeError::validation("redaction has no target"));
        };

        let reaction_key = keys::reaction_event(target);
        if let Some(raw) = self.store().get(&reaction_key).await? {
            let record: BridgedReaction = serde_json::from_slice(&raw)?;
            self.platform
                .remove_reaction(&record.post_id, &record.user_id, &record.emoji)
                .await?;
            self.store().delete(&reaction_key).await?;
            debug!("Removed reaction {} from post {}", target, record.post_id);
            return Ok(());
        }

        if let Some(post_id) = self.post_for_event(target).await? {
            self.platform.delete_post(&post_id).await?;
            self.store().delete(&keys::event_post(target)).await?;
            self.store().delete(&keys::post_event(&post_id)).await?;
            info!("Deleted post {} after redaction of {}", post_id, target);
            return Ok(());
        }

        debug!("Redaction {} targets unbridged event {}", event.event_id, target);
        Ok(())
    }

    async fn on_membership(&self, event: &MatrixEvent, channel_id: &str) -> BridgeResult<()> {
        let (Some(member), Some(target)) = (event.as_member(), event.membership_target()) else {
            return Err(BridgeError::validation("membership event has no target"));
        };
        if self.mapper.is_ghost_user(target) {
            return Ok(());
        }

        match member.membership() {
            Membership::Join => {
                let user_id = self
                    .platform
                    .ensure_remote_user(target, member.displayname.as_deref())
                    .await?;
                self.platform.add_channel_member(channel_id, &user_id).await
            }
            Membership::Leave | Membership::Ban => {
                let user_id = self.platform.ensure_remote_user(target, None).await?;
                self.platform
                    .remove_channel_member(channel_id, &user_id)
                    .await
            }
            Membership::Invite | Membership::Knock => Ok(()),
            Membership::Other(value) => {
                warn!("Unknown membership {:?} for {} in {}", value, target, event.room_id);
                Ok(())
            }
        }
    }
}
