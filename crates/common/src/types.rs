//! Identifiers and records shared by the coordinator, the location registry
//! and the relay contract.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the publishing user id and the random suffix of a
/// stream id.
pub const STREAM_ID_SEPARATOR: char = '#';

/// Length of the random suffix of a generated stream id.
pub const STREAM_ID_SUFFIX_LEN: usize = 6;

/// Identifier of a published media stream, formatted `{user-id}#{suffix}`.
///
/// The publishing user can always be recovered from the id alone, which is
/// what lets the location registry resolve a stream's relay without a
/// secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Generate a fresh stream id owned by `user_id`.
    #[must_use]
    pub fn generate(user_id: &str) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STREAM_ID_SUFFIX_LEN)
            .map(char::from)
            .collect();
        Self(format!("{user_id}{STREAM_ID_SEPARATOR}{suffix}"))
    }

    /// User id of the publisher.
    #[must_use]
    pub fn owner(&self) -> &str {
        stream_owner(&self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything before the first `#` of a raw stream id.
///
/// A string without a separator is its own owner.
#[must_use]
pub fn stream_owner(stream_id: &str) -> &str {
    stream_id
        .split_once(STREAM_ID_SEPARATOR)
        .map_or(stream_id, |(owner, _)| owner)
}

/// Client-declared capabilities of a published stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
    /// Video profile selected by the client (0 = default resolution).
    #[serde(default, rename = "videotype")]
    pub video_type: u32,
}

impl MediaInfo {
    /// Parse media-info persisted as JSON text. Returns `None` for anything
    /// that is not a media-info object.
    #[must_use]
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Which coordinator node owns a user in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLocation {
    #[serde(rename = "rid")]
    pub room_id: String,
    #[serde(rename = "uid")]
    pub user_id: String,
    /// Owning coordinator node id.
    #[serde(rename = "bizid")]
    pub node_id: String,
}

/// Which relay node serves a published stream, plus its media-info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLocation {
    #[serde(rename = "rid")]
    pub room_id: String,
    #[serde(rename = "uid")]
    pub user_id: String,
    #[serde(rename = "mid")]
    pub stream_id: StreamId,
    /// Owning relay node id.
    #[serde(rename = "sfuid")]
    pub relay_id: String,
    #[serde(rename = "minfo", default)]
    pub media_info: Option<MediaInfo>,
}

/// A stream that was removed from the location registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemovedStream {
    #[serde(rename = "rid")]
    pub room_id: String,
    #[serde(rename = "uid")]
    pub user_id: String,
    #[serde(rename = "mid")]
    pub stream_id: StreamId,
}

/// A (room, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomUser {
    #[serde(rename = "rid")]
    pub room_id: String,
    #[serde(rename = "uid")]
    pub user_id: String,
}
