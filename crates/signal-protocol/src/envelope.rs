//! JSON envelopes carried inside frames.
//!
//! Three shapes share one object, told apart by a boolean tag:
//!
//! ```text
//! {"request":true,"id":1,"method":"join","data":{...}}
//! {"response":true,"ok":true,"id":1,"data":{...}}
//! {"response":true,"ok":false,"id":1,"errorCode":-2,"errorReason":"rid not found"}
//! {"notification":true,"method":"peer-join","data":{...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for envelope decoding
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Payload is not valid JSON
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// None of the request/response/notification tags is set
    #[error("Unknown envelope shape")]
    UnknownShape,

    /// A field the shape requires is absent
    #[error("Envelope missing field: {0}")]
    MissingField(&'static str),
}

/// A request in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub id: u64,
    pub method: String,
    pub data: Value,
}

/// Outcome half of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accept(Value),
    Reject { code: i32, reason: String },
}

/// A response correlated to a request by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub id: u64,
    pub outcome: Outcome,
}

/// A one-way message.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub method: String,
    pub data: Value,
}

/// Any message that can travel over a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(RequestMessage),
    Response(ResponseMessage),
    Notification(NotificationMessage),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    request: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    response: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    notification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(id: u64, method: impl Into<String>, data: Value) -> Self {
        Envelope::Request(RequestMessage {
            id,
            method: method.into(),
            data,
        })
    }

    /// Build an accepting response.
    #[must_use]
    pub fn accept(id: u64, data: Value) -> Self {
        Envelope::Response(ResponseMessage {
            id,
            outcome: Outcome::Accept(data),
        })
    }

    /// Build a rejecting response.
    pub fn reject(id: u64, code: i32, reason: impl Into<String>) -> Self {
        Envelope::Response(ResponseMessage {
            id,
            outcome: Outcome::Reject {
                code,
                reason: reason.into(),
            },
        })
    }

    /// Build a notification envelope.
    pub fn notification(method: impl Into<String>, data: Value) -> Self {
        Envelope::Notification(NotificationMessage {
            method: method.into(),
            data,
        })
    }

    /// Serialize to the JSON body of a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let raw = match self {
            Envelope::Request(req) => RawEnvelope {
                request: true,
                id: Some(req.id),
                method: Some(req.method.clone()),
                data: Some(req.data.clone()),
                ..RawEnvelope::default()
            },
            Envelope::Response(resp) => match &resp.outcome {
                Outcome::Accept(data) => RawEnvelope {
                    response: true,
                    ok: Some(true),
                    id: Some(resp.id),
                    data: Some(data.clone()),
                    ..RawEnvelope::default()
                },
                Outcome::Reject { code, reason } => RawEnvelope {
                    response: true,
                    ok: Some(false),
                    id: Some(resp.id),
                    error_code: Some(*code),
                    error_reason: Some(reason.clone()),
                    ..RawEnvelope::default()
                },
            },
            Envelope::Notification(note) => RawEnvelope {
                notification: true,
                method: Some(note.method.clone()),
                data: Some(note.data.clone()),
                ..RawEnvelope::default()
            },
        };
        Ok(serde_json::to_vec(&raw)?)
    }

    /// Parse the JSON body of a frame.
    ///
    /// A missing `data` decodes as an empty object.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid JSON, an unknown shape, or a missing
    /// `id`/`method`.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_slice(payload)?;
        let data = raw
            .data
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        if raw.request {
            Ok(Envelope::Request(RequestMessage {
                id: raw.id.ok_or(EnvelopeError::MissingField("id"))?,
                method: raw.method.ok_or(EnvelopeError::MissingField("method"))?,
                data,
            }))
        } else if raw.response {
            let id = raw.id.ok_or(EnvelopeError::MissingField("id"))?;
            let outcome = if raw.ok.ok_or(EnvelopeError::MissingField("ok"))? {
                Outcome::Accept(data)
            } else {
                Outcome::Reject {
                    code: raw.error_code.unwrap_or_default(),
                    reason: raw.error_reason.unwrap_or_default(),
                }
            };
            Ok(Envelope::Response(ResponseMessage { id, outcome }))
        } else if raw.notification {
            Ok(Envelope::Notification(NotificationMessage {
                method: raw.method.ok_or(EnvelopeError::MissingField("method"))?,
                data,
            }))
        } else {
            Err(EnvelopeError::UnknownShape)
        }
    }
}
