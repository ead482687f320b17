//! API request and response types

use crate::db::Session;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Session as listed to its owner; state data stays server-side
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub is_open: bool,
    /// Tag of the persisted state, `None` if the row holds no tag
    pub state: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            title: session.title.clone(),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            is_open: session.is_open,
            state: session.system_state["type"].as_str().map(str::to_string),
        }
    }
}

/// Response with the caller's sessions, newest activity first
#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

/// Response with one session and its message log as wire envelopes
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: SessionSummary,
    pub messages: Vec<Value>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
