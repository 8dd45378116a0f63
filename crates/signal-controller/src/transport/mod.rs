//! Peer transport: one framed, bidirectional connection per peer.
//!
//! The transport knows nothing about rooms or methods. It decodes frames into
//! envelopes, hands requests and notifications to a [`PeerHandler`],
//! correlates responses to server-initiated requests, and writes outbound
//! envelopes through a bounded per-connection mailbox.

mod connection;
mod listener;

pub use connection::{serve_connection, PeerHandle, DEFAULT_MAILBOX_CAPACITY};
pub use listener::run_listener;

use crate::errors::ScError;
use serde_json::Value;
use signal_protocol::envelope::{Envelope, NotificationMessage, RequestMessage};
use signal_protocol::ErrorCode;
use tracing::{debug, warn};


/// What a connection does with decoded traffic.
///
/// Callbacks run inline in the connection's read loop. Anything that waits
/// on the network must be dispatched to its own task.
pub trait PeerHandler: Send + Sync + 'static {
    /// A peer request. Exactly one answer goes back through `responder`.
    fn on_request(&self, peer: &PeerHandle, request: RequestMessage, responder: Responder);

    fn on_notification(&self, peer: &PeerHandle, notification: NotificationMessage);

    /// The connection is gone. Outstanding server-initiated requests have
    /// already been discarded.
    fn on_close(&self, peer: &PeerHandle);
}

/// Answer slot for one peer request.
///
/// Consumed by [`Responder::accept`] or [`Responder::reject`], so a request
/// is answered at most once.
#[derive(Debug)]
pub struct Responder {
    id: u64,
    peer: PeerHandle,
}

impl Responder {
    pub(crate) fn new(id: u64, peer: PeerHandle) -> Self {
        Self { id, peer }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Answer with data. A reply too large for one frame is turned into an
    /// `unknown error` rejection so the peer is never left waiting.
    pub async fn accept(self, data: Value) {
        match self.peer.send(&Envelope::accept(self.id, data)).await {
            Ok(()) => {}
            Err(ScError::PeerClosed) => self.dropped(),
            Err(e) => {
                warn!(target: "sc.transport", connection_id = self.peer.id(), request_id = self.id, error = %e, "Response not sendable");
                let unknown = ErrorCode::Unknown;
                self.reject(unknown.code(), unknown.reason()).await;
            }
        }
    }

    pub async fn reject(self, code: i32, reason: impl Into<String>) {
        if self
            .peer
            .send(&Envelope::reject(self.id, code, reason))
            .await
            .is_err()
        {
            self.dropped();
        }
    }

    fn dropped(&self) {
        debug!(target: "sc.transport", connection_id = self.peer.id(), request_id = self.id, "Response dropped, connection closed");
    }
}
