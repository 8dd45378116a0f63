//! Wire-level peer client.
//!
//! Speaks framed JSON envelopes over any byte stream, so tests can drive a
//! coordinator through a `tokio::io::duplex` pipe or a real TCP socket.
//! Notifications and server-initiated requests that arrive while a response
//! is awaited are buffered, never lost.

use crate::within;
use serde_json::{json, Value};
use signal_protocol::client::JoinResponse;
use signal_protocol::codec::{read_frame, write_frame};
use signal_protocol::envelope::{NotificationMessage, Outcome, RequestMessage};
use signal_protocol::Envelope;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct TestClient {
    writer: BoxedWriter,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    notifications: VecDeque<NotificationMessage>,
    server_requests: VecDeque<RequestMessage>,
    next_id: u64,
    closed: bool,
}

impl TestClient {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Ends on EOF, a framing error or an undecodable envelope; the
            // closed inbox is what the test observes.
            while let Ok(Some(payload)) = read_frame(&mut reader).await {
                let Ok(envelope) = Envelope::decode(&payload) else {
                    break;
                };
                if inbox_tx.send(envelope).is_err() {
                    break;
                }
            }
        });

        Self {
            writer: Box::new(writer),
            inbox,
            notifications: VecDeque::new(),
            server_requests: VecDeque::new(),
            next_id: 0,
            closed: false,
        }
    }

    async fn send(&mut self, envelope: &Envelope) {
        let payload = envelope.encode().expect("envelope encodes");
        write_frame(&mut self.writer, &payload)
            .await
            .expect("frame written");
    }

    /// Write bytes as-is, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("raw write");
        self.writer.flush().await.expect("raw flush");
    }

    /// Next envelope from the connection, or `None` once it closed.
    async fn recv(&mut self) -> Option<Envelope> {
        if self.closed {
            return None;
        }
        let envelope = self.inbox.recv().await;
        if envelope.is_none() {
            self.closed = true;
        }
        envelope
    }

    fn stash(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Notification(note) => self.notifications.push_back(note),
            Envelope::Request(request) => self.server_requests.push_back(request),
            Envelope::Response(_) => {}
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Returns the accept payload, or the reject code and reason.
    pub async fn request(&mut self, method: &str, data: Value) -> Result<Value, (i32, String)> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(&Envelope::request(id, method, data)).await;

        within(&format!("response to {method}"), async {
            loop {
                match self.recv().await {
                    Some(Envelope::Response(response)) if response.id == id => {
                        return match response.outcome {
                            Outcome::Accept(data) => Ok(data),
                            Outcome::Reject { code, reason } => Err((code, reason)),
                        };
                    }
                    Some(other) => self.stash(other),
                    None => panic!("connection closed while awaiting {method}"),
                }
            }
        })
        .await
    }

    /// Join a room, expecting success.
    pub async fn join(&mut self, room_id: &str, user_id: &str) -> JoinResponse {
        let data = self
            .request("join", json!({"rid": room_id, "uid": user_id}))
            .await
            .unwrap_or_else(|(code, reason)| panic!("join rejected: {code} {reason}"));
        serde_json::from_value(data).expect("join response decodes")
    }

    /// Next notification of any method.
    pub async fn next_notification(&mut self) -> NotificationMessage {
        if let Some(note) = self.notifications.pop_front() {
            return note;
        }
        within("notification", async {
            loop {
                match self.recv().await {
                    Some(Envelope::Notification(note)) => return note,
                    Some(other) => self.stash(other),
                    None => panic!("connection closed while awaiting a notification"),
                }
            }
        })
        .await
    }

    /// Wait for a notification of `method` and return its data. Other
    /// notifications stay buffered in order.
    pub async fn expect_notification(&mut self, method: &str) -> Value {
        if let Some(pos) = self.notifications.iter().position(|n| n.method == method) {
            if let Some(note) = self.notifications.remove(pos) {
                return note.data;
            }
        }
        within(&format!("{method} notification"), async {
            loop {
                match self.recv().await {
                    Some(Envelope::Notification(note)) if note.method == method => {
                        return note.data;
                    }
                    Some(other) => self.stash(other),
                    None => panic!("connection closed while awaiting {method}"),
                }
            }
        })
        .await
    }

    /// Everything already received, without waiting.
    pub fn try_notifications(&mut self) -> Vec<NotificationMessage> {
        while let Ok(envelope) = self.inbox.try_recv() {
            self.stash(envelope);
        }
        self.notifications.drain(..).collect()
    }

    /// Next request the server sent us.
    pub async fn next_server_request(&mut self) -> RequestMessage {
        if let Some(request) = self.server_requests.pop_front() {
            return request;
        }
        within("server request", async {
            loop {
                match self.recv().await {
                    Some(Envelope::Request(request)) => return request,
                    Some(other) => self.stash(other),
                    None => panic!("connection closed while awaiting a server request"),
                }
            }
        })
        .await
    }

    /// Answer a server-initiated request.
    pub async fn respond(&mut self, id: u64, outcome: Outcome) {
        let envelope = match outcome {
            Outcome::Accept(data) => Envelope::accept(id, data),
            Outcome::Reject { code, reason } => Envelope::reject(id, code, reason),
        };
        self.send(&envelope).await;
    }

    /// Wait for the server to close the connection. Anything still arriving
    /// is buffered.
    pub async fn wait_closed(&mut self) {
        within("connection close", async {
            while let Some(envelope) = self.recv().await {
                self.stash(envelope);
            }
        })
        .await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
