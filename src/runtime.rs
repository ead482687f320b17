//! Session interaction loop
//!
//! One [`SessionLoop`] runs per accepted connection. It reaches storage and
//! the client only through the traits in [`traits`], so the same loop runs
//! against SQLite and a websocket in production and against in-memory
//! doubles in tests.

mod executor;
pub mod traits;
pub mod wire;

#[cfg(test)]
pub mod testing;

pub use executor::{SessionLoop, NEW_SESSION_ID};
pub use traits::*;
pub use wire::Envelope;

use crate::state_machine::StateError;
use thiserror::Error;

/// Failures that abort the loop and are surfaced to the caller
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("session {session_id} belongs to another user")]
    Unauthorized { session_id: i64 },
    #[error("session {0} not found")]
    SessionNotFound(i64),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("cannot resume session: {0}")]
    StateResolution(#[from] StateError),
}

impl LoopError {
    /// HTTP-style status used in the error notice
    pub fn status_code(&self) -> u16 {
        match self {
            LoopError::Unauthorized { .. } => 401,
            LoopError::SessionNotFound(_) => 404,
            LoopError::Storage(_) | LoopError::StateResolution(_) => 500,
        }
    }

    /// Websocket close code sent after the error notice
    pub fn close_code(&self) -> u16 {
        match self {
            LoopError::Unauthorized { .. } => 1008,
            _ => 1011,
        }
    }
}

/// Why the run phase stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The client went away
    ClientClosed,
    /// The flow reached the absorbing state
    Finished,
    /// The client sent a frame that is not a valid payload
    ProtocolViolation,
    /// A transition failed for a reason other than the client leaving
    TransitionFailed,
}

/// What teardown did with the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// No user message was ever stored, so the session was removed
    Deleted,
    /// Marked closed and kept for later resumption
    Closed,
    /// The client left before a session was acquired
    Untouched,
}

/// Result of a loop that did not abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    pub session_id: Option<i64>,
    pub exit: ExitReason,
    pub disposal: Disposal,
}
