//! TCP accept loop for peer connections.

use super::{serve_connection, PeerHandler};
use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept peers until `cancel_token` fires. Each connection gets its own
/// task; cancelling also closes every open connection.
pub async fn run_listener<H>(
    listener: TcpListener,
    handler: Arc<H>,
    mailbox_capacity: usize,
    cancel_token: CancellationToken,
) where
    H: PeerHandler,
{
    let active = Arc::new(AtomicU64::new(0));
    if let Ok(addr) = listener.local_addr() {
        info!(target: "sc.transport", addr = %addr, "Signal listener accepting connections");
    }

    loop {
        let accepted = tokio::select! {
            () = cancel_token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                // Per-connection failures (e.g. reset before accept) are not fatal.
                warn!(target: "sc.transport", error = %e, "Accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "sc.transport", error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = Arc::clone(&handler);
        let active = Arc::clone(&active);
        let shutdown = cancel_token.child_token();
        tokio::spawn(async move {
            metrics::set_connections_active(active.fetch_add(1, Ordering::Relaxed) + 1);
            debug!(target: "sc.transport", peer_addr = %peer_addr, "Peer connected");

            serve_connection(stream, handler, mailbox_capacity, &shutdown).await;

            metrics::set_connections_active(
                active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1),
            );
            debug!(target: "sc.transport", peer_addr = %peer_addr, "Peer disconnected");
        });
    }

    info!(target: "sc.transport", "Signal listener stopped");
}
