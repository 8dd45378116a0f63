//! Reconciliation sweep.
//!
//! The backstop for missed leaves, disconnects and kicks: every local peer is
//! checked against the registry's owner record.

use super::Coordinator;
use crate::observability::metrics;
use location_registry::client::is_not_found;
use tracing::{debug, info, instrument, warn};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers confirmed as owned by this node.
    pub kept: usize,
    /// Peers owned elsewhere; local entry dropped, registry untouched.
    pub dropped: usize,
    /// Peers with no owner record or a failed lookup; fully torn down.
    pub torn_down: usize,
    /// Empty rooms removed.
    pub rooms_removed: usize,
    /// The sweep could not reach a location registry and did nothing.
    pub skipped: bool,
}

impl Coordinator {
    /// Run one reconciliation pass.
    #[instrument(skip_all, fields(node_id = %self.node_id()))]
    pub async fn reconcile(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let location = match self.location() {
            Ok(location) => location,
            Err(e) => {
                warn!(target: "sc.sweep", error = %e, "No location registry, skipping reconciliation");
                report.skipped = true;
                return report;
            }
        };

        for room in self.rooms.snapshot() {
            for (user_id, peer) in room.members() {
                match location.get_owner(room.id(), &user_id).await {
                    Ok(owner) if owner == self.node_id() => report.kept += 1,
                    Ok(owner) => {
                        debug!(target: "sc.sweep", room_id = %room.id(), user_id = %user_id, owner = %owner, "Peer owned elsewhere, dropping");
                        if room.remove_if(&user_id, peer.id()).is_some() {
                            peer.close();
                        }
                        metrics::record_eviction("not_owner");
                        report.dropped += 1;
                    }
                    Err(e) => {
                        let reason = if is_not_found(&e) {
                            "owner_missing"
                        } else {
                            metrics::record_rpc_failure("location");
                            "lookup_failed"
                        };
                        debug!(target: "sc.sweep", room_id = %room.id(), user_id = %user_id, reason, "Evicting peer");
                        self.teardown(room.id(), &user_id, None).await;
                        metrics::record_eviction(reason);
                        report.torn_down += 1;
                    }
                }
            }
            if self.rooms.remove_if_empty(room.id()) {
                report.rooms_removed += 1;
            }
        }

        self.refresh_gauges();
        if report.dropped + report.torn_down + report.rooms_removed > 0 {
            info!(
                target: "sc.sweep",
                kept = report.kept,
                dropped = report.dropped,
                torn_down = report.torn_down,
                rooms_removed = report.rooms_removed,
                "Reconciliation evicted peers"
            );
        }
        report
    }
}
