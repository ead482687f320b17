//! Conversation payloads
//!
//! A payload is one unit of conversation content. The same wire object is
//! sent over the socket and stored verbatim in the message log.


use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Errors raised while decoding a payload wire object
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("payload is missing its type")]
    MissingType,
    #[error("unknown payload type: {0}")]
    UnknownType(String),
    #[error("unknown chat state: {0}")]
    UnknownState(String),
    #[error("{payload_type} payload is missing field `{field}`")]
    MissingField {
        payload_type: &'static str,
        field: &'static str,
    },
}

/// One unit of conversation content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Payload {
    /// Plain chat text
    Chat { message: String },
    /// Asks the client for exactly one reply
    OpenChat,
    /// Tells the client no reply is expected
    CloseChat,
    /// The conversation has finished
    EndSession,
    /// Opaque structured data
    Dict { data: Map<String, Value> },
    /// A text document
    TextFile {
        name: String,
        mime_type: String,
        content: String,
    },
}

impl Payload {
    pub fn chat(message: impl Into<String>) -> Self {
        Payload::Chat {
            message: message.into(),
        }
    }

    /// Whether the loop must block for one client reply after emitting this payload
    pub fn requires_user_input(&self) -> bool {
        matches!(self, Payload::OpenChat)
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Chat { .. } => "chat",
            Payload::OpenChat => "open_chat",
            Payload::CloseChat => "close_chat",
            Payload::EndSession => "end_session",
            Payload::Dict { .. } => "dict",
            Payload::TextFile { .. } => "text_file",
        }
    }

    /// The chat text, if this is a chat payload
    pub fn as_chat(&self) -> Option<&str> {
        match self {
            Payload::Chat { message } => Some(message),
            _ => None,
        }
    }

    /// Encode as the discriminated wire object
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Chat { message } => json!({ "type": "message", "message": message }),
            Payload::OpenChat => json!({ "type": "state", "state": "opened" }),
            Payload::CloseChat => json!({ "type": "state", "state": "closed" }),
            Payload::EndSession => json!({ "type": "end" }),
            Payload::Dict { data } => json!({ "type": "dict", "data": data }),
            Payload::TextFile {
                name,
                mime_type,
                content,
            } => json!({
                "type": "text-file",
                "file": { "name": name, "type": mime_type, "content": content }
            }),
        }
    }

    /// Decode a wire object, dispatching on `type` and, for `state`, on `state`
    pub fn from_value(value: &Value) -> Result<Self, PayloadError> {
        let object = value.as_object().ok_or(PayloadError::NotAnObject)?;
        let payload_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(PayloadError::MissingType)?;

        match payload_type {
            "message" => Ok(Payload::Chat {
                message: required_str(object, "message", "message")?,
            }),
            "state" => match object.get("state").and_then(Value::as_str) {
                Some("opened") => Ok(Payload::OpenChat),
                Some("closed") => Ok(Payload::CloseChat),
                Some(other) => Err(PayloadError::UnknownState(other.to_string())),
                None => Err(PayloadError::MissingField {
                    payload_type: "state",
                    field: "state",
                }),
            },
            "end" => Ok(Payload::EndSession),
            "dict" => {
                let data = object
                    .get("data")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or(PayloadError::MissingField {
                        payload_type: "dict",
                        field: "data",
                    })?;
                Ok(Payload::Dict { data })
            }
            "text-file" => {
                let file = object
                    .get("file")
                    .and_then(Value::as_object)
                    .ok_or(PayloadError::MissingField {
                        payload_type: "text-file",
                        field: "file",
                    })?;
                Ok(Payload::TextFile {
                    name: required_str(file, "text-file", "name")?,
                    mime_type: required_str(file, "text-file", "type")?,
                    content: required_str(file, "text-file", "content")?,
                })
            }
            other => Err(PayloadError::UnknownType(other.to_string())),
        }
    }
}

fn required_str(
    object: &Map<String, Value>,
    payload_type: &'static str,
    field: &'static str,
) -> Result<String, PayloadError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or(PayloadError::MissingField {
            payload_type,
            field,
        })
}

impl TryFrom<Value> for Payload {
    type Error = PayloadError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Payload::from_value(&value)
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        payload.to_value()
    }
}
