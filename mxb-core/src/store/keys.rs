//! Key layout of the trusted store.

pub const CHANNEL_ROOM_PREFIX: &str = "channel_room_";
pub const ROOM_CHANNEL_PREFIX: &str = "room_channel_";
pub const GHOST_USER_PREFIX: &str = "ghost_user_";
pub const POST_EVENT_PREFIX: &str = "post_event_";
pub const EVENT_POST_PREFIX: &str = "event_post_";
pub const REACTION_EVENT_PREFIX: &str = "reaction_event_";
pub const LOCAL_REACTION_PREFIX: &str = "local_reaction_";

/// channel id -> room id
pub fn channel_room(channel_id: &str) -> String {
    format!("{}{}", CHANNEL_ROOM_PREFIX, channel_id)
}

/// room id -> channel id
pub fn room_channel(room_id: &str) -> String {
    format!("{}{}", ROOM_CHANNEL_PREFIX, room_id)
}

/// local user id -> ghost user id
pub fn ghost_user(local_user_id: &str) -> String {
    format!("{}{}", GHOST_USER_PREFIX, local_user_id)
}

/// post id -> event id
pub fn post_event(post_id: &str) -> String {
    format!("{}{}", POST_EVENT_PREFIX, post_id)
}

/// event id -> post id
pub fn event_post(event_id: &str) -> String {
    format!("{}{}", EVENT_POST_PREFIX, event_id)
}

/// Matrix reaction event id -> bridged local reaction
pub fn reaction_event(event_id: &str) -> String {
    format!("{}{}", REACTION_EVENT_PREFIX, event_id)
}

/// local reaction -> Matrix reaction event id
pub fn local_reaction(post_id: &str, user_id: &str, emoji: &str) -> String {
    format!("{}{}_{}_{}", LOCAL_REACTION_PREFIX, post_id, user_id, emoji)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(channel_room("c1"), "channel_room_c1");
        assert_eq!(room_channel("!r:x"), "room_channel_!r:x");
        assert_eq!(ghost_user("u1"), "ghost_user_u1");
        assert_eq!(local_reaction("p", "u", "smile"), "local_reaction_p_u_smile");
    }
}
