//! Local platform -> Matrix.
//!
//! Posts and reactions made on the local server are sent into the mapped room
//! as the author's ghost. Anything that originated on Matrix is skipped so
//! the two directions never echo each other.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::BridgeResult;
use crate::mapper::{GhostProfile, IdentityMapper};
use crate::matrix::{FileAttachment, MessageRequest, SendOutcome, POST_ID_METADATA_KEY};
use crate::post_tracker::PostTracker;
use crate::store::{keys, KvStore};

/// A post as seen on the local server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalPost {
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    pub user_display_name: Option<String>,
    pub message: String,
    pub html: Option<String>,
    pub root_id: Option<String>,
    pub files: Vec<FileAttachment>,
    /// Last-modified timestamp in milliseconds
    pub update_at: i64,
    /// Created by the bridge from a Matrix event
    pub from_matrix: bool,
}

/// A reaction as seen on the local server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalReaction {
    pub post_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub emoji: String,
    pub from_matrix: bool,
}

pub struct OutboundSync {
    mapper: Arc<IdentityMapper>,
    tracker: Arc<PostTracker>,
}

impl OutboundSync {
    pub fn new(mapper: Arc<IdentityMapper>, tracker: Arc<PostTracker>) -> Self {
        Self { mapper, tracker }
    }

    pub fn tracker(&self) -> &PostTracker {
        &self.tracker
    }

    fn store(&self) -> &dyn KvStore {
        self.mapper.store().as_ref()
    }

    /// Ghost for `user_id`, joined to `room_id`
    async fn ghost_in_room(
        &self,
        user_id: &str,
        display_name: Option<&str>,
        room_id: &str,
    ) -> BridgeResult<String> {
        let mut profile = GhostProfile::new(user_id);
        if let Some(name) = display_name {
            profile = profile.with_display_name(name);
        }
        let ghost = self.mapper.get_or_create_ghost_user(&profile).await?;
        self.mapper
            .client()
            .invite_and_join_ghost_user(room_id, &ghost)
            .await?;
        Ok(ghost)
    }

    async fn event_for_post(&self, post_id: &str) -> BridgeResult<Option<String>> {
        self.store().get_string(&keys::post_event(post_id)).await
    }

    /// Send a new post; `None` when it is not bridged
    pub async fn on_post_created(&self, post: &LocalPost) -> BridgeResult<Option<SendOutcome>> {
        if post.from_matrix {
            return Ok(None);
        }
        let Some(room_id) = self.mapper.room_for_channel(&post.channel_id).await? else {
            debug!("Channel {} is not bridged, skipping post {}", post.channel_id, post.id);
            return Ok(None);
        };
        if self.event_for_post(&post.id).await?.is_some() {
            debug!("Post {} was already sent", post.id);
            return Ok(None);
        }

        let ghost = self
            .ghost_in_room(&post.user_id, post.user_display_name.as_deref(), &room_id)
            .await?;

        let mut request = MessageRequest::new(&room_id, &ghost)
            .with_metadata(POST_ID_METADATA_KEY, post.id.as_str());
        if !post.message.is_empty() {
            request = request.with_text(post.message.as_str());
        }
        if let Some(html) = &post.html {
            request = request.with_html(html.as_str());
        }
        request.files = post.files.clone();
        if let Some(root_id) = &post.root_id {
            match self.event_for_post(root_id).await? {
                Some(root_event) => request = request.in_thread(root_event),
                None => debug!("Root post {} is not bridged, sending top-level", root_id),
            }
        }

        let outcome = self.mapper.client().send_message(&request).await?;
        for failure in outcome.failures() {
            warn!("Post {}: partial send failure {:?}", post.id, failure);
        }

        self.store()
            .set_string(&keys::post_event(&post.id), &outcome.primary_event_id)
            .await?;
        self.store()
            .set_string(&keys::event_post(&outcome.primary_event_id), &post.id)
            .await?;
        self.tracker.put(&post.id, post.update_at);
        info!("Sent post {} as {}", post.id, outcome.primary_event_id);
        Ok(Some(outcome))
    }

    /// Edit the bridged event; `None` for a redundant re-save or an unbridged post
    pub async fn on_post_updated(&self, post: &LocalPost) -> BridgeResult<Option<String>> {
        if post.from_matrix {
            return Ok(None);
        }
        if self.tracker.get(&post.id) == Some(post.update_at) {
            debug!("Post {} unchanged since last sync", post.id);
            return Ok(None);
        }
        let Some(event_id) = self.event_for_post(&post.id).await? else {
            return Ok(None);
        };
        let Some(room_id) = self.mapper.room_for_channel(&post.channel_id).await? else {
            return Ok(None);
        };

        // the original send already joined the ghost
        let ghost = match self.mapper.ghost_for_local_user(&post.user_id).await? {
            Some(ghost) => ghost,
            None => {
                self.ghost_in_room(&post.user_id, post.user_display_name.as_deref(), &room_id)
                    .await?
            }
        };
        let edit_id = self
            .mapper
            .client()
            .edit_message(&room_id, &ghost, &event_id, &post.message, post.html.as_deref())
            .await?;
        self.tracker.put(&post.id, post.update_at);
        debug!("Edited {} for post {}", event_id, post.id);
        Ok(Some(edit_id))
    }

    /// Redact the bridged event; `None` when the post was never bridged
    pub async fn on_post_deleted(&self, post: &LocalPost) -> BridgeResult<Option<String>> {
        self.tracker.delete(&post.id);
        if post.from_matrix {
            return Ok(None);
        }
        let Some(event_id) = self.event_for_post(&post.id).await? else {
            return Ok(None);
        };
        let Some(room_id) = self.mapper.room_for_channel(&post.channel_id).await? else {
            return Ok(None);
        };

        let ghost = self.mapper.ghost_for_local_user(&post.user_id).await?;
        let redaction = self
            .mapper
            .client()
            .redact_event(&room_id, ghost.as_deref(), &event_id, None)
            .await?;

        self.store().delete(&keys::post_event(&post.id)).await?;
        self.store().delete(&keys::event_post(&event_id)).await?;
        info!("Redacted {} for deleted post {}", event_id, post.id);
        Ok(Some(redaction))
    }

    /// Send the reaction; returns the Matrix reaction event id
    pub async fn on_reaction_added(&self, reaction: &LocalReaction) -> BridgeResult<Option<String>> {
        if reaction.from_matrix {
            return Ok(None);
        }
        let key = keys::local_reaction(&reaction.post_id, &reaction.user_id, &reaction.emoji);
        if self.store().get_string(&key).await?.is_some() {
            return Ok(None);
        }
        let Some(event_id) = self.event_for_post(&reaction.post_id).await? else {
            return Ok(None);
        };
        let Some(room_id) = self.mapper.room_for_channel(&reaction.channel_id).await? else {
            return Ok(None);
        };

        let ghost = self.ghost_in_room(&reaction.user_id, None, &room_id).await?;
        let reaction_event = self
            .mapper
            .client()
            .add_reaction(&room_id, &ghost, &event_id, &reaction.emoji)
            .await?;
        self.store().set_string(&key, &reaction_event).await?;
        Ok(Some(reaction_event))
    }

    /// Redact the reaction event sent for this local reaction
    pub async fn on_reaction_removed(
        &self,
        reaction: &LocalReaction,
    ) -> BridgeResult<Option<String>> {
        if reaction.from_matrix {
            return Ok(None);
        }
        let key = keys::local_reaction(&reaction.post_id, &reaction.user_id, &reaction.emoji);
        let Some(reaction_event) = self.store().get_string(&key).await? else {
            return Ok(None);
        };
        let Some(room_id) = self.mapper.room_for_channel(&reaction.channel_id).await? else {
            return Ok(None);
        };
        let Some(ghost) = self.mapper.ghost_for_local_user(&reaction.user_id).await? else {
            return Ok(None);
        };

        let redaction = self
            .mapper
            .client()
            .remove_reaction(&room_id, &ghost, &reaction_event)
            .await?;
        self.store().delete(&key).await?;
        Ok(Some(redaction))
    }
}
