//! Persisted key layout.
//!
//! | Key | Value | TTL |
//! |---|---|---|
//! | `/node/rid/{room}/uid/{user}` | owning coordinator node id | 60s |
//! | `/media/rid/{room}/uid/{user}/mid/{stream}` | media-info JSON | 24h |
//! | `/pub/rid/{room}/uid/{user}/mid/{stream}` | owning relay node id | 24h |

use std::time::Duration;

/// Lease on user ownership. Refreshed by keepalive.
pub const USER_TTL: Duration = Duration::from_secs(60);

/// Lifetime of stream bookkeeping.
pub const STREAM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[must_use]
pub fn user_key(room_id: &str, user_id: &str) -> String {
    format!("/node/rid/{room_id}/uid/{user_id}")
}

/// Prefix of every user key in a room.
#[must_use]
pub fn room_users_prefix(room_id: &str) -> String {
    format!("/node/rid/{room_id}/uid/")
}

#[must_use]
pub fn media_key(room_id: &str, user_id: &str, stream_id: &str) -> String {
    format!("{}{stream_id}", user_media_prefix(room_id, user_id))
}

#[must_use]
pub fn user_media_prefix(room_id: &str, user_id: &str) -> String {
    format!("/media/rid/{room_id}/uid/{user_id}/mid/")
}

#[must_use]
pub fn pub_key(room_id: &str, user_id: &str, stream_id: &str) -> String {
    format!("{}{stream_id}", user_pub_prefix(room_id, user_id))
}

#[must_use]
pub fn user_pub_prefix(room_id: &str, user_id: &str) -> String {
    format!("/pub/rid/{room_id}/uid/{user_id}/mid/")
}

/// Prefix of every relay-ownership key in a room.
#[must_use]
pub fn room_pubs_prefix(room_id: &str) -> String {
    format!("/pub/rid/{room_id}/uid/")
}

/// User id of a key under [`room_users_prefix`].
#[must_use]
pub fn parse_user_key<'a>(room_id: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(&room_users_prefix(room_id))
        .filter(|user_id| !user_id.is_empty())
}

/// `(user id, stream id)` of a key under [`room_pubs_prefix`].
#[must_use]
pub fn parse_pub_key<'a>(room_id: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    key.strip_prefix(&room_pubs_prefix(room_id))?
        .split_once("/mid/")
        .filter(|(user_id, stream_id)| !user_id.is_empty() && !stream_id.is_empty())
}
