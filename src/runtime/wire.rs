//! Wire envelopes exchanged with the client

use crate::db::Message;
use crate::payload::{Payload, PayloadError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

/// Id carried by envelopes that were never persisted
pub const EPHEMERAL_ID: i64 = -1;

/// `{id, payload, createdAt, isSystem}` as sent to the client
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: i64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub is_system: bool,
}

impl Envelope {
    pub fn stored(message: &Message) -> Self {
        Self {
            id: message.id,
            payload: message.payload.to_value(),
            created_at: message.created_at,
            is_system: message.is_system,
        }
    }

    pub fn ephemeral(payload: &Payload, is_system: bool) -> Self {
        Self {
            id: EPHEMERAL_ID,
            payload: payload.to_value(),
            created_at: Utc::now(),
            is_system,
        }
    }

    pub fn notice(notice: &Notice) -> Self {
        Self {
            id: EPHEMERAL_ID,
            payload: notice.to_value(),
            created_at: Utc::now(),
            is_system: true,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "payload": self.payload,
            "createdAt": self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "isSystem": self.is_system,
        })
    }
}

/// Loop-level notices that are not conversation payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected,
    SessionCreated { id: i64 },
    Error { code: u16, message: String },
}

impl Notice {
    pub fn to_value(&self) -> Value {
        match self {
            Notice::Connected => json!({ "type": "connected" }),
            Notice::SessionCreated { id } => json!({ "type": "session_created", "id": id }),
            Notice::Error { code, message } => {
                json!({ "type": "error", "code": code, "message": message })
            }
        }
    }
}

/// Decode a client frame. Clients may send either a bare payload or a full
/// envelope carrying one.
pub fn inbound_payload(frame: &Value) -> Result<Payload, PayloadError> {
    match frame.get("payload") {
        Some(inner) if inner.is_object() => Payload::from_value(inner),
        _ => Payload::from_value(frame),
    }
}
