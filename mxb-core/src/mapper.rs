//! # Identity / Room Mapper
//!
//! Owns the two mappings the bridge depends on:
//!
//! - local user id <-> ghost user id (`@{ghost_prefix}{local}:{domain}`)
//! - local channel id <-> Matrix room id
//!
//! The trusted store is authoritative. When a room has no stored mapping the
//! room's `org.mxb.channel` state event is consulted, read-only.

use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::matrix::{
    validate_path_component, AvatarData, CreateRoomOptions, MatrixClient,
    BRIDGE_CHANNEL_EVENT_TYPE,
};
use crate::store::{keys, SharedStore};

/// A local user to mirror as a ghost
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GhostProfile {
    pub local_user_id: String,
    pub display_name: Option<String>,
    pub avatar: Option<AvatarData>,
}

impl GhostProfile {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_avatar(mut self, avatar: AvatarData) -> Self {
        self.avatar = Some(avatar);
        self
    }
}

/// One channel <-> room association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMapping {
    pub channel_id: String,
    pub room_id: String,
}

#[derive(Clone)]
pub struct IdentityMapper {
    client: MatrixClient,
    store: SharedStore,
    ghost_prefix: String,
    server_name: String,
}

impl IdentityMapper {
    pub fn new(client: MatrixClient, store: SharedStore) -> Self {
        let ghost_prefix = client.config().ghost_prefix.clone();
        let server_name = client.server_name().to_string();
        Self {
            client,
            store,
            ghost_prefix,
            server_name,
        }
    }

    pub fn client(&self) -> &MatrixClient {
        &self.client
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ==================== Ghost users ====================

    pub fn ghost_localpart(&self, local_user_id: &str) -> String {
        format!("{}{}", self.ghost_prefix, local_user_id)
    }

    pub fn ghost_user_id(&self, local_user_id: &str) -> String {
        format!("@{}:{}", self.ghost_localpart(local_user_id), self.server_name)
    }

    /// Local id inside a ghost user id on our domain
    pub fn local_user_id_from_ghost<'a>(&self, user_id: &'a str) -> Option<&'a str> {
        let (localpart, domain) = user_id.strip_prefix('@')?.split_once(':')?;
        if domain != self.server_name {
            return None;
        }
        localpart
            .strip_prefix(self.ghost_prefix.as_str())
            .filter(|local| !local.is_empty())
    }

    pub fn is_ghost_user(&self, user_id: &str) -> bool {
        self.local_user_id_from_ghost(user_id).is_some()
    }

    /// Local id of a ghost the bridge actually created
    pub async fn verified_ghost_local_id(&self, user_id: &str) -> BridgeResult<Option<String>> {
        let Some(local) = self.local_user_id_from_ghost(user_id) else {
            return Ok(None);
        };
        let stored = self.store.get_string(&keys::ghost_user(local)).await?;
        Ok((stored.as_deref() == Some(user_id)).then(|| local.to_string()))
    }

    /// Stored ghost for a local user, without creating one
    pub async fn ghost_for_local_user(&self, local_user_id: &str) -> BridgeResult<Option<String>> {
        self.store.get_string(&keys::ghost_user(local_user_id)).await
    }

    /// Ghost id for `profile`, registering it on first use
    pub async fn get_or_create_ghost_user(&self, profile: &GhostProfile) -> BridgeResult<String> {
        validate_path_component("local_user_id", &profile.local_user_id)?;

        let key = keys::ghost_user(&profile.local_user_id);
        if let Some(existing) = self.store.get_string(&key).await? {
            return Ok(existing);
        }

        let creation = self
            .client
            .create_ghost_user(
                &self.ghost_localpart(&profile.local_user_id),
                profile.display_name.as_deref(),
                profile.avatar.as_ref(),
            )
            .await?;
        if creation.display_name_error.is_some() || creation.avatar_error.is_some() {
            warn!(
                "Ghost {} created with incomplete profile",
                creation.user_id
            );
        }

        self.store.set_string(&key, &creation.user_id).await?;
        info!(
            "Mapped local user {} to ghost {}",
            profile.local_user_id, creation.user_id
        );
        Ok(creation.user_id)
    }

    // ==================== Rooms ====================

    pub async fn room_for_channel(&self, channel_id: &str) -> BridgeResult<Option<String>> {
        self.store.get_string(&keys::channel_room(channel_id)).await
    }

    /// Stored mapping first, then the room's bridge state event
    pub async fn channel_for_room(&self, room_id: &str) -> BridgeResult<Option<String>> {
        if let Some(channel) = self.store.get_string(&keys::room_channel(room_id)).await? {
            return Ok(Some(channel));
        }

        match self
            .client
            .get_room_state_event(room_id, BRIDGE_CHANNEL_EVENT_TYPE, "")
            .await
        {
            Ok(Some(content)) => Ok(content
                .get("channel_id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)),
            Ok(None) => Ok(None),
            Err(e @ BridgeError::Protocol { .. }) => {
                debug!("No readable bridge state in {}: {}", room_id, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write both directions; an existing mapping of either side to something else is a conflict
    pub async fn map_channel_to_room(&self, channel_id: &str, room_id: &str) -> BridgeResult<()> {
        validate_path_component("channel_id", channel_id)?;
        validate_path_component("room_id", room_id)?;

        if let Some(existing) = self.room_for_channel(channel_id).await? {
            if existing != room_id {
                return Err(BridgeError::Conflict(format!(
                    "channel {} is already mapped to {}",
                    channel_id, existing
                )));
            }
        }
        if let Some(existing) = self.store.get_string(&keys::room_channel(room_id)).await? {
            if existing != channel_id {
                return Err(BridgeError::Conflict(format!(
                    "room {} is already mapped to {}",
                    room_id, existing
                )));
            }
        }

        self.store
            .set_string(&keys::channel_room(channel_id), room_id)
            .await?;
        self.store
            .set_string(&keys::room_channel(room_id), channel_id)
            .await?;
        debug!("Mapped channel {} to room {}", channel_id, room_id);
        Ok(())
    }

    /// Existing room, or a new room carrying the bridge state event
    pub async fn ensure_room_for_channel(
        &self,
        channel_id: &str,
        options: CreateRoomOptions,
    ) -> BridgeResult<String> {
        if let Some(room_id) = self.room_for_channel(channel_id).await? {
            return Ok(room_id);
        }

        let options = CreateRoomOptions {
            channel_id: Some(channel_id.to_string()),
            ..options
        };
        let room_id = self.client.create_room(&options).await?;

        match self.map_channel_to_room(channel_id, &room_id).await {
            Ok(()) => {
                info!("Created room {} for channel {}", room_id, channel_id);
                Ok(room_id)
            }
            Err(BridgeError::Conflict(_)) => {
                // another caller mapped the channel while the room was being created
                let winner = self.room_for_channel(channel_id).await?;
                warn!(
                    "Room {} for channel {} lost a creation race to {:?}",
                    room_id, channel_id, winner
                );
                winner.ok_or_else(|| {
                    BridgeError::store(format!("mapping for {} vanished", channel_id))
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_room_mappings(&self) -> BridgeResult<Vec<RoomMapping>> {
        let stored_keys = self.store.list_keys(keys::CHANNEL_ROOM_PREFIX).await?;
        let mut mappings = Vec::with_capacity(stored_keys.len());
        for key in stored_keys {
            let Some(channel_id) = key.strip_prefix(keys::CHANNEL_ROOM_PREFIX) else {
                continue;
            };
            if let Some(room_id) = self.store.get_string(&key).await? {
                mappings.push(RoomMapping {
                    channel_id: channel_id.to_string(),
                    room_id,
                });
            }
        }
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatrixConfig, RateLimitConfig};
    use crate::store::{KvStore, MemoryKvStore};
    use std::sync::Arc;

    fn mapper() -> (IdentityMapper, MemoryKvStore) {
        let client = MatrixClient::new(
            MatrixConfig::new("http://127.0.0.1:9", "as-token"),
            &RateLimitConfig::unlimited(),
            "example.com",
        )
        .unwrap();
        let store = MemoryKvStore::new();
        (IdentityMapper::new(client, Arc::new(store.clone())), store)
    }

    #[test]
    fn test_ghost_ids_are_deterministic() {
        let (mapper, _) = mapper();
        assert_eq!(mapper.ghost_user_id("u1"), "@_mattermost_u1:example.com");
        assert_eq!(mapper.ghost_user_id("u1"), mapper.ghost_user_id("u1"));
    }

    #[test]
    fn test_ghost_inversion_only_for_our_domain() {
        let (mapper, _) = mapper();
        assert_eq!(
            mapper.local_user_id_from_ghost("@_mattermost_u1:example.com"),
            Some("u1")
        );
        assert!(mapper.is_ghost_user("@_mattermost_u1:example.com"));
        assert!(!mapper.is_ghost_user("@_mattermost_u1:other.org"));
        assert!(!mapper.is_ghost_user("@alice:example.com"));
        assert!(!mapper.is_ghost_user("@_mattermost_:example.com"));
        assert!(!mapper.is_ghost_user("_mattermost_u1:example.com"));
    }

    #[tokio::test]
    async fn test_existing_ghost_is_read_from_store() {
        let (mapper, store) = mapper();
        store
            .set_string("ghost_user_u1", "@_mattermost_u1:example.com")
            .await
            .unwrap();

        // no homeserver is reachable, so this must come from the store
        let ghost = mapper
            .get_or_create_ghost_user(&GhostProfile::new("u1"))
            .await
            .unwrap();
        assert_eq!(ghost, "@_mattermost_u1:example.com");
    }

    #[tokio::test]
    async fn test_verified_ghost_requires_store_entry() {
        let (mapper, store) = mapper();
        let ghost = "@_mattermost_u1:example.com";
        assert_eq!(mapper.verified_ghost_local_id(ghost).await.unwrap(), None);

        store.set_string("ghost_user_u1", ghost).await.unwrap();
        assert_eq!(
            mapper.verified_ghost_local_id(ghost).await.unwrap().as_deref(),
            Some("u1")
        );
    }

    #[tokio::test]
    async fn test_map_channel_writes_both_directions() {
        let (mapper, _) = mapper();
        mapper.map_channel_to_room("c1", "!r1:example.com").await.unwrap();

        assert_eq!(
            mapper.room_for_channel("c1").await.unwrap().as_deref(),
            Some("!r1:example.com")
        );
        assert_eq!(
            mapper.channel_for_room("!r1:example.com").await.unwrap().as_deref(),
            Some("c1")
        );

        // same mapping again is fine
        mapper.map_channel_to_room("c1", "!r1:example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_map_channel_conflict() {
        let (mapper, _) = mapper();
        mapper.map_channel_to_room("c1", "!r1:example.com").await.unwrap();

        let err = mapper
            .map_channel_to_room("c1", "!r2:example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
        assert_eq!(
            mapper.room_for_channel("c1").await.unwrap().as_deref(),
            Some("!r1:example.com")
        );
    }

    #[tokio::test]
    async fn test_map_room_already_bridged_to_other_channel() {
        let (mapper, store) = mapper();
        mapper.map_channel_to_room("c1", "!r1:example.com").await.unwrap();

        let err = mapper
            .map_channel_to_room("c2", "!r1:example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
        assert_eq!(
            store.get_string("room_channel_!r1:example.com").await.unwrap().as_deref(),
            Some("c1")
        );
        assert!(mapper.room_for_channel("c2").await.unwrap().is_none());

        // re-mapping the same pair stays idempotent
        mapper.map_channel_to_room("c1", "!r1:example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_room_mappings() {
        let (mapper, _) = mapper();
        mapper.map_channel_to_room("a", "!ra:example.com").await.unwrap();
        mapper.map_channel_to_room("b", "!rb:example.com").await.unwrap();

        let mappings = mapper.list_room_mappings().await.unwrap();
        assert_eq!(
            mappings,
            vec![
                RoomMapping {
                    channel_id: "a".into(),
                    room_id: "!ra:example.com".into()
                },
                RoomMapping {
                    channel_id: "b".into(),
                    room_id: "!rb:example.com".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_room_returns_existing_mapping() {
        let (mapper, _) = mapper();
        mapper.map_channel_to_room("c1", "!r1:example.com").await.unwrap();
        let room = mapper
            .ensure_room_for_channel("c1", CreateRoomOptions::default())
            .await
            .unwrap();
        assert_eq!(room, "!r1:example.com");
    }
}
