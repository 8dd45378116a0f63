//! Session teardown shared by leave, rejoin, kick and the sweep.
//!
//! Registry cleanup here is secondary to whatever triggered it: failures are
//! logged and counted, never returned.

use super::Coordinator;
use crate::observability::metrics;
use common::types::RoomUser;
use location_registry::LocationClient;
use signal_protocol::RoomEvent;
use tracing::{debug, instrument, warn};

impl Coordinator {
    /// Full leave: remove the user's streams and ownership record, tell the
    /// room, then drop the local peer.
    ///
    /// The removed peer is closed unless it is `keep_connection`.
    #[instrument(skip_all, fields(room_id = %room_id, user_id = %user_id))]
    pub(crate) async fn teardown(&self, room_id: &str, user_id: &str, keep_connection: Option<u64>) {
        match self.location() {
            Ok(location) => self.release(&location, room_id, user_id).await,
            Err(e) => {
                warn!(target: "sc.coordinator", error = %e, "Registry cleanup skipped");
            }
        }
        self.announce(RoomEvent::PeerLeave(RoomUser {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        }))
        .await;
        self.detach(room_id, user_id, keep_connection);
    }

    /// Registry half of a teardown: streams first, then the ownership record.
    pub(crate) async fn release(&self, location: &LocationClient, room_id: &str, user_id: &str) {
        match location.stream_remove(room_id, user_id, None).await {
            Ok(removed) => {
                for stream in removed {
                    self.announce(RoomEvent::StreamRemove(stream)).await;
                }
            }
            Err(e) => {
                warn!(target: "sc.coordinator", room_id = %room_id, user_id = %user_id, error = %e, "Stream cleanup failed");
                metrics::record_rpc_failure("location");
            }
        }

        if let Err(e) = location.leave(room_id, user_id).await {
            warn!(target: "sc.coordinator", room_id = %room_id, user_id = %user_id, error = %e, "Ownership cleanup failed");
            metrics::record_rpc_failure("location");
        }
    }

    /// Local half of a teardown.
    pub(crate) fn detach(&self, room_id: &str, user_id: &str, keep_connection: Option<u64>) {
        if let Some(room) = self.rooms.get(room_id) {
            if let Some(peer) = room.remove(user_id) {
                if Some(peer.id()) != keep_connection {
                    peer.close();
                }
                debug!(target: "sc.coordinator", room_id = %room_id, user_id = %user_id, connection_id = peer.id(), "Peer detached");
            }
            self.rooms.remove_if_empty(room_id);
        }
        self.refresh_gauges();
    }
}
