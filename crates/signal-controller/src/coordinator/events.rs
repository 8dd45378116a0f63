//! Room event fan-out.
//!
//! Events raised here go to local peers directly and to siblings over this
//! node's event channel. Events received from siblings are delivered locally
//! only and never republished.

use super::Coordinator;
use crate::observability::metrics;
use common::catalog::MethodCatalog;
use common::types::StreamId;
use message_bus::{event_channel, BusEvent};
use signal_protocol::relay::RelayEvent;
use signal_protocol::RoomEvent;
use tracing::{debug, warn};

impl Coordinator {
    /// Notify every other local peer of the room, then siblings.
    pub(crate) async fn announce(&self, event: RoomEvent) {
        self.deliver_local(&event);

        let (method, data) = match event.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(target: "sc.coordinator", method = event.method(), error = %e, "Event not encodable");
                return;
            }
        };
        if let Err(e) = self
            .bus
            .publish(&event_channel(self.node_id()), &method, data)
            .await
        {
            warn!(target: "sc.coordinator", method = %method, error = %e, "Event publish failed");
        }
    }

    /// Returns how many local peers the event was queued for.
    pub(crate) fn deliver_local(&self, event: &RoomEvent) -> usize {
        let Some(room) = self.rooms.get(event.room_id()) else {
            return 0;
        };
        let (method, data) = match event.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(target: "sc.coordinator", method = event.method(), error = %e, "Event not encodable");
                return 0;
            }
        };
        room.peers_except(event.user_id())
            .iter()
            .filter(|peer| peer.notify(&method, data.clone()))
            .count()
    }

    pub(super) fn relay_sibling_event(&self, event: BusEvent) {
        match RoomEvent::decode(&event.method, event.data) {
            Ok(room_event) => {
                let delivered = self.deliver_local(&room_event);
                if delivered > 0 {
                    metrics::record_event_relayed(room_event.method());
                }
                debug!(target: "sc.coordinator", channel = %event.channel, method = room_event.method(), room_id = %room_event.room_id(), delivered, "Sibling event relayed");
            }
            Err(e) => {
                debug!(target: "sc.coordinator", channel = %event.channel, method = %event.method, error = %e, "Ignoring unknown sibling event");
            }
        }
    }

    pub(super) async fn on_relay_event(&self, event: BusEvent) {
        match RelayEvent::decode(&event.method, event.data) {
            Ok(RelayEvent::StreamRemove(removed)) => {
                debug!(target: "sc.coordinator", channel = %event.channel, room_id = %removed.room_id, stream_id = %removed.stream_id, "Relay dropped stream");
                metrics::record_event_relayed("stream-remove");
                self.forget_stream(&removed.room_id, &removed.stream_id).await;
            }
            Err(e) => {
                debug!(target: "sc.coordinator", channel = %event.channel, method = %event.method, error = %e, "Ignoring unknown relay event");
            }
        }
    }

    /// Drop a stream the relay no longer serves and tell the room.
    ///
    /// Only records the registry actually removed are announced, so a stream
    /// already cleaned up (unpublished, or reported twice) stays quiet.
    pub(crate) async fn forget_stream(&self, room_id: &str, stream_id: &StreamId) {
        let location = match self.location() {
            Ok(location) => location,
            Err(e) => {
                warn!(target: "sc.coordinator", room_id = %room_id, stream_id = %stream_id, error = %e, "Stream cleanup skipped");
                return;
            }
        };
        let removed = match location
            .stream_remove(room_id, stream_id.owner(), Some(stream_id))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(target: "sc.coordinator", room_id = %room_id, stream_id = %stream_id, error = %e, "Stream cleanup failed");
                metrics::record_rpc_failure("location");
                return;
            }
        };
        if removed.is_empty() {
            debug!(target: "sc.coordinator", room_id = %room_id, stream_id = %stream_id, "Stream already gone from the registry");
        }

        for stream in removed {
            self.announce(RoomEvent::StreamRemove(stream)).await;
        }
    }
}
