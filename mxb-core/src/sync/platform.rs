//! Contract for the local chat server, plus an in-memory implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{BridgeError, BridgeResult};

/// File attached to a post created from Matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Post to create on the local server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPost {
    pub channel_id: String,
    pub user_id: String,
    pub message: String,
    pub root_id: Option<String>,
    pub files: Vec<LocalFile>,
    /// Matrix event the post mirrors
    pub matrix_event_id: Option<String>,
}

/// Operations the bridge performs on the local server
#[async_trait]
pub trait LocalPlatform: Send + Sync {
    /// Create a post and return its id
    async fn create_post(&self, post: NewPost) -> BridgeResult<String>;

    async fn update_post(&self, post_id: &str, message: &str) -> BridgeResult<()>;

    async fn delete_post(&self, post_id: &str) -> BridgeResult<()>;

    async fn add_reaction(&self, post_id: &str, user_id: &str, emoji: &str) -> BridgeResult<()>;

    async fn remove_reaction(&self, post_id: &str, user_id: &str, emoji: &str) -> BridgeResult<()>;

    /// Local mirror of a Matrix user; returns the local user id
    async fn ensure_remote_user(
        &self,
        matrix_user_id: &str,
        display_name: Option<&str>,
    ) -> BridgeResult<String>;

    /// Direct channel between two local users, created if missing
    async fn direct_channel(&self, user_a: &str, user_b: &str) -> BridgeResult<String>;

    async fn add_channel_member(&self, channel_id: &str, user_id: &str) -> BridgeResult<()>;

    async fn remove_channel_member(&self, channel_id: &str, user_id: &str) -> BridgeResult<()>;
}

/// Post as held by [`MemoryPlatform`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPost {
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    pub message: String,
    pub root_id: Option<String>,
    pub filenames: Vec<String>,
    pub matrix_event_id: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    posts: BTreeMap<String, StoredPost>,
    reactions: BTreeSet<(String, String, String)>,
    remote_users: HashMap<String, String>,
    direct_channels: HashMap<(String, String), String>,
    members: BTreeSet<(String, String)>,
    next_id: u64,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }
}

/// Standalone local platform that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryPlatform {
    state: Mutex<MemoryState>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn posts(&self) -> Vec<StoredPost> {
        self.state.lock().posts.values().cloned().collect()
    }

    pub fn post(&self, post_id: &str) -> Option<StoredPost> {
        self.state.lock().posts.get(post_id).cloned()
    }

    pub fn reactions(&self) -> Vec<(String, String, String)> {
        self.state.lock().reactions.iter().cloned().collect()
    }

    pub fn is_member(&self, channel_id: &str, user_id: &str) -> bool {
        self.state
            .lock()
            .members
            .contains(&(channel_id.to_string(), user_id.to_string()))
    }

    pub fn remote_user(&self, matrix_user_id: &str) -> Option<String> {
        self.state.lock().remote_users.get(matrix_user_id).cloned()
    }
}

#[async_trait]
impl LocalPlatform for MemoryPlatform {
    async fn create_post(&self, post: NewPost) -> BridgeResult<String> {
        let mut state = self.state.lock();
        let id = state.next_id("post");
        info!("Created post {} in channel {}", id, post.channel_id);
        state.posts.insert(
            id.clone(),
            StoredPost {
                id: id.clone(),
                channel_id: post.channel_id,
                user_id: post.user_id,
                message: post.message,
                root_id: post.root_id,
                filenames: post.files.into_iter().map(|f| f.filename).collect(),
                matrix_event_id: post.matrix_event_id,
            },
        );
        Ok(id)
    }

    async fn update_post(&self, post_id: &str, message: &str) -> BridgeResult<()> {
        let mut state = self.state.lock();
        let post = state
            .posts
            .get_mut(post_id)
            .ok_or_else(|| BridgeError::platform(format!("post {} not found", post_id)))?;
        post.message = message.to_string();
        Ok(())
    }

    async fn delete_post(&self, post_id: &str) -> BridgeResult<()> {
        self.state.lock().posts.remove(post_id);
        Ok(())
    }

    async fn add_reaction(&self, post_id: &str, user_id: &str, emoji: &str) -> BridgeResult<()> {
        self.state.lock().reactions.insert((
            post_id.to_string(),
            user_id.to_string(),
            emoji.to_string(),
        ));
        Ok(())
    }

    async fn remove_reaction(&self, post_id: &str, user_id: &str, emoji: &str) -> BridgeResult<()> {
        self.state.lock().reactions.remove(&(
            post_id.to_string(),
            user_id.to_string(),
            emoji.to_string(),
        ));
        Ok(())
    }

    async fn ensure_remote_user(
        &self,
        matrix_user_id: &str,
        _display_name: Option<&str>,
    ) -> BridgeResult<String> {
        let mut state = self.state.lock();
        if let Some(id) = state.remote_users.get(matrix_user_id) {
            return Ok(id.clone());
        }
        let id = state.next_id("remote");
        state
            .remote_users
            .insert(matrix_user_id.to_string(), id.clone());
        Ok(id)
    }

    async fn direct_channel(&self, user_a: &str, user_b: &str) -> BridgeResult<String> {
        let key = if user_a <= user_b {
            (user_a.to_string(), user_b.to_string())
        } else {
            (user_b.to_string(), user_a.to_string())
        };
        let mut state = self.state.lock();
        if let Some(id) = state.direct_channels.get(&key) {
            return Ok(id.clone());
        }
        let id = format!("{}__{}", key.0, key.1);
        state.direct_channels.insert(key, id.clone());
        Ok(id)
    }

    async fn add_channel_member(&self, channel_id: &str, user_id: &str) -> BridgeResult<()> {
        self.state
            .lock()
            .members
            .insert((channel_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn remove_channel_member(&self, channel_id: &str, user_id: &str) -> BridgeResult<()> {
        self.state
            .lock()
            .members
            .remove(&(channel_id.to_string(), user_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remote_users_are_stable() {
        let platform = MemoryPlatform::new();
        let a = platform.ensure_remote_user("@alice:x", None).await.unwrap();
        let again = platform.ensure_remote_user("@alice:x", Some("Alice")).await.unwrap();
        let b = platform.ensure_remote_user("@bob:x", None).await.unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_direct_channel_is_order_independent() {
        let platform = MemoryPlatform::new();
        let one = platform.direct_channel("u1", "u2").await.unwrap();
        let two = platform.direct_channel("u2", "u1").await.unwrap();
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn test_post_lifecycle() {
        let platform = MemoryPlatform::new();
        let id = platform
            .create_post(NewPost {
                channel_id: "c".into(),
                user_id: "u".into(),
                message: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        platform.update_post(&id, "edited").await.unwrap();
        assert_eq!(platform.post(&id).unwrap().message, "edited");

        platform.delete_post(&id).await.unwrap();
        assert!(platform.post(&id).is_none());
        assert!(platform.update_post(&id, "x").await.is_err());
    }
}
