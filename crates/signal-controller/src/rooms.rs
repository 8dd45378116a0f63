//! Local room membership.
//!
//! A room here is only the set of peers attached to *this* node. The
//! cluster-wide view lives in the location registry. Locks are never held
//! across an await: callers take a snapshot, release, then send.

use crate::transport::PeerHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Peers of one room attached to this node, keyed by user id.
#[derive(Debug)]
pub struct Room {
    id: String,
    peers: Mutex<HashMap<String, PeerHandle>>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach a peer, returning the handle it replaced, if any.
    pub fn insert(&self, user_id: &str, peer: PeerHandle) -> Option<PeerHandle> {
        self.peers.lock().insert(user_id.to_string(), peer)
    }

    pub fn remove(&self, user_id: &str) -> Option<PeerHandle> {
        self.peers.lock().remove(user_id)
    }

    /// Remove `user_id` only while it is still bound to `connection_id`.
    ///
    /// Guards against a late teardown detaching a newer connection for the
    /// same user.
    pub fn remove_if(&self, user_id: &str, connection_id: u64) -> Option<PeerHandle> {
        let mut peers = self.peers.lock();
        match peers.get(user_id) {
            Some(peer) if peer.id() == connection_id => peers.remove(user_id),
            _ => None,
        }
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PeerHandle> {
        self.peers.lock().get(user_id).cloned()
    }

    /// Snapshot of every peer except `user_id`.
    #[must_use]
    pub fn peers_except(&self, user_id: &str) -> Vec<PeerHandle> {
        self.peers
            .lock()
            .iter()
            .filter(|(uid, _)| uid.as_str() != user_id)
            .map(|(_, peer)| peer.clone())
            .collect()
    }

    /// Snapshot of `(user_id, peer)` pairs.
    #[must_use]
    pub fn members(&self) -> Vec<(String, PeerHandle)> {
        self.peers
            .lock()
            .iter()
            .map(|(uid, peer)| (uid.clone(), peer.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

/// All rooms with at least one local peer.
#[derive(Debug, Default)]
pub struct Rooms {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl Rooms {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().get(room_id).cloned()
    }

    /// Attach a peer, creating its room if needed. Returns the handle it
    /// replaced, if any.
    ///
    /// Creation and insertion happen under the rooms lock, the same lock
    /// [`Rooms::remove_if_empty`] checks emptiness under, so a room is never
    /// dropped between the two and the peer always lands in the live table.
    pub fn attach(&self, room_id: &str, user_id: &str, peer: PeerHandle) -> Option<PeerHandle> {
        let mut rooms = self.rooms.lock();
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_id)))
            .insert(user_id, peer)
    }

    /// Drop the room if it has no peers left. Returns whether it was removed.
    pub fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let empty = rooms.get(room_id).is_some_and(|room| room.is_empty());
        if empty {
            rooms.remove(room_id);
        }
        empty
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.snapshot().iter().map(|room| room.len()).sum()
    }
}
