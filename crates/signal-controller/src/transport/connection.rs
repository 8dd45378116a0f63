//! Per-connection read loop, writer task and request correlation.

use super::{PeerHandler, Responder};
use crate::errors::ScError;
use crate::observability::metrics;
use parking_lot::Mutex;
use serde_json::Value;
use signal_protocol::codec::{read_frame, write_frame, MAX_PAYLOAD_LEN};
use signal_protocol::envelope::{Envelope, Outcome, ResponseMessage};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Outbound frames buffered per connection before notifications are shed.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live peer connection.
///
/// Cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    id: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    /// Server-initiated requests awaiting a response.
    pending: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    next_request_id: AtomicU64,
    /// Identity bound by a successful join.
    user_id: Mutex<Option<String>>,
    closed: CancellationToken,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.inner.id)
            .field("user_id", &*self.inner.user_id.lock())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PeerHandle {
    fn new(outbound: mpsc::Sender<Vec<u8>>, closed: CancellationToken) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                outbound,
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                user_id: Mutex::new(None),
                closed,
            }),
        }
    }

    /// A handle with no socket behind it; outbound frames land in the
    /// returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(mailbox_capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(mailbox_capacity);
        (Self::new(tx, CancellationToken::new()), rx)
    }

    /// Process-unique connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id.lock().clone()
    }

    pub fn bind_user(&self, user_id: &str) {
        *self.inner.user_id.lock() = Some(user_id.to_string());
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Queue an envelope, waiting for mailbox space.
    ///
    /// # Errors
    ///
    /// Returns [`ScError::PeerClosed`] if the connection is closed, or
    /// [`ScError::Internal`] if the envelope cannot be framed.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ScError> {
        let payload = frame_payload(envelope)?;
        if self.is_closed() {
            return Err(ScError::PeerClosed);
        }
        tokio::select! {
            () = self.inner.closed.cancelled() => Err(ScError::PeerClosed),
            sent = self.inner.outbound.send(payload) => sent.map_err(|_| ScError::PeerClosed),
        }
    }

    /// Queue a notification without waiting. A full mailbox drops it.
    ///
    /// Returns whether the notification was queued.
    pub fn notify(&self, method: &str, data: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        let payload = match frame_payload(&Envelope::notification(method, data)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "sc.transport", connection_id = self.id(), method = %method, error = %e, "Notification not sendable");
                return false;
            }
        };
        match self.inner.outbound.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "sc.transport", connection_id = self.id(), method = %method, "Mailbox full, notification dropped");
                metrics::record_notification_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send a server-initiated request and wait for the peer's answer.
    ///
    /// # Errors
    ///
    /// Returns [`ScError::PeerRejected`] if the peer rejects, and
    /// [`ScError::PeerClosed`] if the connection closes first.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, ScError> {
        if self.is_closed() {
            return Err(ScError::PeerClosed);
        }
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        if let Err(e) = self.send(&Envelope::request(id, method, data)).await {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Outcome::Accept(data)) => Ok(data),
            Ok(Outcome::Reject { code, reason }) => Err(ScError::PeerRejected { code, reason }),
            Err(_) => Err(ScError::PeerClosed),
        }
    }

    fn resolve(&self, response: ResponseMessage) {
        let waiter = self.inner.pending.lock().remove(&response.id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response.outcome);
            }
            None => {
                debug!(target: "sc.transport", connection_id = self.id(), request_id = response.id, "Response for unknown transaction");
            }
        }
    }

    /// Drop every outstanding transaction without resolving it.
    fn discard_pending(&self) {
        let discarded = std::mem::take(&mut *self.inner.pending.lock());
        if !discarded.is_empty() {
            debug!(target: "sc.transport", connection_id = self.id(), count = discarded.len(), "Discarded outstanding transactions");
        }
    }
}

fn frame_payload(envelope: &Envelope) -> Result<Vec<u8>, ScError> {
    let payload = envelope
        .encode()
        .map_err(|e| ScError::Internal(format!("envelope encode: {e}")))?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ScError::Internal(format!(
            "envelope of {} bytes exceeds frame limit",
            payload.len()
        )));
    }
    Ok(payload)
}

/// Drive one peer connection until either side closes it or `shutdown`
/// fires.
///
/// Malformed frames and envelopes close the connection.
#[instrument(skip_all, name = "sc.connection")]
pub async fn serve_connection<S, H>(
    stream: S,
    handler: Arc<H>,
    mailbox_capacity: usize,
    shutdown: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: PeerHandler + ?Sized,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::channel(mailbox_capacity);
    let closed = shutdown.child_token();
    let peer = PeerHandle::new(outbound_tx, closed.clone());
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, closed, peer.id()));

    debug!(target: "sc.transport", connection_id = peer.id(), "Connection opened");

    loop {
        let frame = tokio::select! {
            () = peer.closed() => break,
            frame = read_frame(&mut reader) => frame,
        };

        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(target: "sc.transport", connection_id = peer.id(), "Peer closed connection");
                break;
            }
            Err(e) => {
                debug!(target: "sc.transport", connection_id = peer.id(), code = e.code(), error = %e, "Framing error, closing connection");
                metrics::record_framing_error(e.kind());
                break;
            }
        };

        match Envelope::decode(&payload) {
            Ok(Envelope::Request(request)) => {
                let responder = Responder::new(request.id, peer.clone());
                handler.on_request(&peer, request, responder);
            }
            Ok(Envelope::Response(response)) => peer.resolve(response),
            Ok(Envelope::Notification(notification)) => {
                handler.on_notification(&peer, notification);
            }
            Err(e) => {
                debug!(target: "sc.transport", connection_id = peer.id(), error = %e, "Malformed envelope, closing connection");
                metrics::record_framing_error("envelope");
                break;
            }
        }
    }

    peer.close();
    peer.discard_pending();
    handler.on_close(&peer);
    let _ = writer_task.await;
    debug!(target: "sc.transport", connection_id = peer.id(), "Connection closed");
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
    connection_id: u64,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let payload = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        if let Err(e) = write_frame(&mut writer, &payload).await {
            debug!(target: "sc.transport", connection_id = connection_id, code = e.code(), error = %e, "Write failed, closing connection");
            metrics::record_framing_error(e.kind());
            closed.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use signal_protocol::codec::encode_frame;
    use signal_protocol::envelope::{NotificationMessage, RequestMessage};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Echoes requests back and records what it saw.
    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<RequestMessage>>,
        notifications: Mutex<Vec<NotificationMessage>>,
        peers: Mutex<Vec<PeerHandle>>,
        closed: AtomicU64,
    }

    impl PeerHandler for Recorder {
        fn on_request(&self, peer: &PeerHandle, request: RequestMessage, responder: Responder) {
            self.peers.lock().push(peer.clone());
            self.requests.lock().push(request.clone());
            tokio::spawn(async move {
                if request.method == "fail" {
                    responder.reject(-14, "nope").await;
                } else {
                    responder.accept(request.data).await;
                }
            });
        }

        fn on_notification(&self, peer: &PeerHandle, notification: NotificationMessage) {
            self.peers.lock().push(peer.clone());
            self.notifications.lock().push(notification);
        }

        fn on_close(&self, _peer: &PeerHandle) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn start(handler: Arc<Recorder>) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            serve_connection(server, handler, 8, &CancellationToken::new()).await;
        });
        (client, task)
    }

    async fn send(client: &mut DuplexStream, envelope: &Envelope) {
        write_frame(client, &envelope.encode().unwrap()).await.unwrap();
    }

    async fn recv(client: &mut DuplexStream) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(client))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        Envelope::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_request_is_answered_with_matching_id() {
        let handler = Arc::new(Recorder::default());
        let (mut client, _task) = start(Arc::clone(&handler));

        send(&mut client, &Envelope::request(7, "echo", json!({"x": 1}))).await;
        assert_eq!(recv(&mut client).await, Envelope::accept(7, json!({"x": 1})));

        send(&mut client, &Envelope::request(8, "fail", json!({}))).await;
        assert_eq!(recv(&mut client).await, Envelope::reject(8, -14, "nope"));
    }

    #[tokio::test]
    async fn test_frame_split_across_writes_is_delivered_intact() {
        let handler = Arc::new(Recorder::default());
        let (mut client, _task) = start(Arc::clone(&handler));

        // Written one byte at a time.
        let payload = br#"{"request":true,"id":1,"method":"a"}"#;
        let frame = encode_frame(payload).unwrap();
        for byte in frame.iter() {
            client.write_all(&[*byte]).await.unwrap();
        }

        let Envelope::Response(response) = recv(&mut client).await else {
            unreachable!("expected a response");
        };
        assert_eq!(response.id, 1);
        let requests = handler.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests.first().unwrap().method, "a");
    }

    #[tokio::test]
    async fn test_oversized_length_closes_connection() {
        let handler = Arc::new(Recorder::default());
        let (mut client, task) = start(Arc::clone(&handler));

        // 4097 = 0x1001, little endian.
        client.write_all(&[0x01, 0x10]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0, "server side shut down");
    }

    #[tokio::test]
    async fn test_malformed_json_closes_connection() {
        let handler = Arc::new(Recorder::default());
        let (mut client, task) = start(Arc::clone(&handler));

        write_frame(&mut client, b"not json").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        assert!(handler.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_server_initiated_request_is_correlated() {
        let handler = Arc::new(Recorder::default());
        let (mut client, _task) = start(Arc::clone(&handler));

        send(&mut client, &Envelope::notification("hello", json!({}))).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.peers.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let peer = handler.peers.lock().first().cloned().unwrap();

        let pending = tokio::spawn({
            let peer = peer.clone();
            async move { peer.request("ping", json!({"n": 1})).await }
        });

        let Envelope::Request(request) = recv(&mut client).await else {
            unreachable!("expected a request");
        };
        assert_eq!(request.method, "ping");
        send(&mut client, &Envelope::accept(request.id, json!({"pong": true}))).await;

        assert_eq!(pending.await.unwrap().unwrap(), json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_close_discards_outstanding_requests() {
        let handler = Arc::new(Recorder::default());
        let (mut client, task) = start(Arc::clone(&handler));

        send(&mut client, &Envelope::notification("hello", json!({}))).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.peers.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let peer = handler.peers.lock().first().cloned().unwrap();

        let pending = tokio::spawn({
            let peer = peer.clone();
            async move { peer.request("ping", json!({})).await }
        });
        let _ = recv(&mut client).await;

        drop(client);
        task.await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(ScError::PeerClosed)));
        assert!(peer.is_closed());
        assert!(!peer.notify("late", json!({})));
    }

    #[tokio::test]
    async fn test_oversized_outbound_envelope_is_refused() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = PeerHandle::new(tx, CancellationToken::new());
        let big = "x".repeat(MAX_PAYLOAD_LEN);

        let err = peer
            .send(&Envelope::notification("big", json!({ "blob": big })))
            .await
            .unwrap_err();
        assert!(matches!(err, ScError::Internal(_)));
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_notifications() {
        let (tx, mut rx) = mpsc::channel(1);
        let peer = PeerHandle::new(tx, CancellationToken::new());

        assert!(peer.notify("a", json!({})));
        assert!(!peer.notify("b", json!({})));
        assert!(rx.try_recv().is_ok());
        assert!(peer.notify("c", json!({})));
    }
}
