//! Registry operations over a [`LocationStore`].

use crate::error::LocationError;
use crate::keys;
use crate::store::LocationStore;
use common::types::{
    stream_owner, MediaInfo, RemovedStream, RoomUser, StreamId, StreamLocation, UserLocation,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Ownership records for users and streams.
///
/// Each operation is a sequence of independent key writes; a crash between
/// two writes leaves the other key behind until its TTL runs out.
#[derive(Clone)]
pub struct LocationRegistry {
    store: Arc<dyn LocationStore>,
}

impl LocationRegistry {
    pub fn new(store: Arc<dyn LocationStore>) -> Self {
        Self { store }
    }

    /// Claim ownership of `user_id` in `room_id` for `node_id`.
    ///
    /// Last write wins; there is no compare-and-swap against a current owner.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::JoinFailed`] if the store write fails.
    #[instrument(skip_all, fields(room_id = %room_id, user_id = %user_id, node_id = %node_id))]
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        node_id: &str,
    ) -> Result<UserLocation, LocationError> {
        self.store
            .set_ex(&keys::user_key(room_id, user_id), node_id, keys::USER_TTL)
            .await
            .map_err(|e| LocationError::JoinFailed(e.to_string()))?;

        Ok(UserLocation {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            node_id: node_id.to_string(),
        })
    }

    /// Drop the ownership record. Absent records are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::Store`] if the store delete fails.
    #[instrument(skip_all, fields(room_id = %room_id, user_id = %user_id))]
    pub async fn leave(&self, room_id: &str, user_id: &str) -> Result<RoomUser, LocationError> {
        let existed = self
            .store
            .del(&keys::user_key(room_id, user_id))
            .await
            .map_err(|e| LocationError::Store(e.to_string()))?;
        debug!(target: "location.registry", existed = existed, "User location removed");

        Ok(RoomUser {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        })
    }

    /// Extend the ownership lease.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::KeepAliveFailed`] if the record has already
    /// expired or the store fails.
    #[instrument(skip_all, fields(room_id = %room_id, user_id = %user_id))]
    pub async fn keepalive(&self, room_id: &str, user_id: &str) -> Result<RoomUser, LocationError> {
        let refreshed = self
            .store
            .expire(&keys::user_key(room_id, user_id), keys::USER_TTL)
            .await
            .map_err(|e| LocationError::KeepAliveFailed(e.to_string()))?;
        if !refreshed {
            return Err(LocationError::KeepAliveFailed(
                "user location already expired".to_string(),
            ));
        }

        Ok(RoomUser {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        })
    }

    /// Record a published stream: its media-info and its relay.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::StreamAddFailed`] if either write fails.
    #[instrument(skip_all, fields(room_id = %stream.room_id, user_id = %stream.user_id, stream_id = %stream.stream_id))]
    pub async fn stream_add(&self, stream: StreamLocation) -> Result<StreamLocation, LocationError> {
        let media_info = serde_json::to_string(&stream.media_info.unwrap_or_default())
            .map_err(|e| LocationError::StreamAddFailed(e.to_string()))?;

        self.store
            .set_ex(
                &keys::media_key(&stream.room_id, &stream.user_id, stream.stream_id.as_str()),
                &media_info,
                keys::STREAM_TTL,
            )
            .await
            .map_err(|e| LocationError::StreamAddFailed(format!("media-info: {e}")))?;
        self.store
            .set_ex(
                &keys::pub_key(&stream.room_id, &stream.user_id, stream.stream_id.as_str()),
                &stream.relay_id,
                keys::STREAM_TTL,
            )
            .await
            .map_err(|e| LocationError::StreamAddFailed(format!("relay: {e}")))?;

        Ok(stream)
    }

    /// Remove one stream, or every stream of the user when `stream_id` is
    /// `None`.
    ///
    /// Returns one record per relay-ownership key that was found.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::Store`] if a scan or delete fails.
    #[instrument(skip_all, fields(room_id = %room_id, user_id = %user_id, bulk = stream_id.is_none()))]
    pub async fn stream_remove(
        &self,
        room_id: &str,
        user_id: &str,
        stream_id: Option<&StreamId>,
    ) -> Result<Vec<RemovedStream>, LocationError> {
        let (media_keys, pub_keys) = match stream_id {
            Some(stream_id) => (
                vec![keys::media_key(room_id, user_id, stream_id.as_str())],
                vec![keys::pub_key(room_id, user_id, stream_id.as_str())],
            ),
            None => (
                self.scan(&keys::user_media_prefix(room_id, user_id)).await?,
                self.scan(&keys::user_pub_prefix(room_id, user_id)).await?,
            ),
        };

        for key in &media_keys {
            self.store
                .del(key)
                .await
                .map_err(|e| LocationError::Store(e.to_string()))?;
        }

        let mut removed = Vec::with_capacity(pub_keys.len());
        for key in pub_keys {
            let existed = self
                .store
                .del(&key)
                .await
                .map_err(|e| LocationError::Store(e.to_string()))?;
            if !existed {
                continue;
            }
            match keys::parse_pub_key(room_id, &key) {
                Some((_, stream)) => removed.push(RemovedStream {
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                    stream_id: StreamId::from(stream),
                }),
                None => warn!(target: "location.registry", key = %key, "Unparseable relay key"),
            }
        }

        debug!(target: "location.registry", removed = removed.len(), "Streams removed");
        Ok(removed)
    }

    /// Current owner of a user.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::OwnerNotFound`] if no record exists.
    pub async fn get_owner(&self, room_id: &str, user_id: &str) -> Result<UserLocation, LocationError> {
        let node_id = self
            .store
            .get(&keys::user_key(room_id, user_id))
            .await
            .map_err(|e| LocationError::Store(e.to_string()))?
            .ok_or_else(|| LocationError::OwnerNotFound {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            })?;

        Ok(UserLocation {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            node_id,
        })
    }

    /// Relay serving a stream. The publisher is recovered from the id.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::RelayNotFound`] if no record exists.
    pub async fn get_relay_for_stream(
        &self,
        room_id: &str,
        stream_id: &StreamId,
    ) -> Result<String, LocationError> {
        let user_id = stream_owner(stream_id.as_str());
        self.store
            .get(&keys::pub_key(room_id, user_id, stream_id.as_str()))
            .await
            .map_err(|e| LocationError::Store(e.to_string()))?
            .ok_or_else(|| LocationError::RelayNotFound(stream_id.to_string()))
    }

    /// Everyone in the room except `exclude_user`.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::Store`] if the scan fails.
    pub async fn get_room_users(
        &self,
        room_id: &str,
        exclude_user: &str,
    ) -> Result<Vec<UserLocation>, LocationError> {
        let mut users = Vec::new();
        for key in self.scan(&keys::room_users_prefix(room_id)).await? {
            let Some(user_id) = keys::parse_user_key(room_id, &key) else {
                continue;
            };
            if user_id == exclude_user {
                continue;
            }
            // Expired between scan and read.
            let Some(node_id) = self.read(&key).await? else {
                continue;
            };
            users.push(UserLocation {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                node_id,
            });
        }
        Ok(users)
    }

    /// Every stream in the room not published by `exclude_user`, with
    /// media-info attached by one extra read per stream.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::Store`] if the scan or a read fails.
    pub async fn get_room_streams(
        &self,
        room_id: &str,
        exclude_user: &str,
    ) -> Result<Vec<StreamLocation>, LocationError> {
        let mut streams = Vec::new();
        for key in self.scan(&keys::room_pubs_prefix(room_id)).await? {
            let Some((user_id, stream_id)) = keys::parse_pub_key(room_id, &key) else {
                continue;
            };
            if user_id == exclude_user {
                continue;
            }
            let Some(relay_id) = self.read(&key).await? else {
                continue;
            };
            let media_info = self
                .read(&keys::media_key(room_id, user_id, stream_id))
                .await?
                .and_then(|raw| MediaInfo::from_json(&raw));

            streams.push(StreamLocation {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                stream_id: StreamId::from(stream_id),
                relay_id,
                media_info,
            });
        }
        Ok(streams)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, LocationError> {
        self.store
            .scan_prefix(prefix)
            .await
            .map_err(|e| LocationError::Store(e.to_string()))
    }

    async fn read(&self, key: &str) -> Result<Option<String>, LocationError> {
        self.store
            .get(key)
            .await
            .map_err(|e| LocationError::Store(e.to_string()))
    }
}
