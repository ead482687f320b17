//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the loop with mock implementations.

use crate::db::{Database, DbError, Message, Session, UserState};
use crate::payload::Payload;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(i64),
    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for session rows
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        owner_id: &str,
        title: &str,
        state: &Value,
        user_state: &UserState,
    ) -> StoreResult<Session>;

    async fn get_session(&self, id: i64) -> StoreResult<Session>;

    async fn open_session(&self, id: i64) -> StoreResult<()>;

    async fn close_session(&self, id: i64) -> StoreResult<()>;

    async fn delete_session(&self, id: i64) -> StoreResult<()>;

    /// Checkpoint state and user scratch data in one write
    async fn update_session_state(
        &self,
        id: i64,
        state: &Value,
        user_state: &UserState,
    ) -> StoreResult<()>;

    /// Copy a session and its whole message log; returns the copy
    async fn duplicate_session(&self, id: i64) -> StoreResult<Session>;
}

/// Append-only message log
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a batch in order; the store assigns ids
    async fn append_messages(
        &self,
        session_id: i64,
        payloads: &[Payload],
        is_system: bool,
    ) -> StoreResult<Vec<Message>>;

    async fn list_messages(&self, session_id: i64) -> StoreResult<Vec<Message>>;
}

/// Combined storage trait for convenience
pub trait Storage: SessionStore + MessageStore {}
impl<T: SessionStore + MessageStore> Storage for T {}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// One bidirectional, message-framed client connection
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Value) -> Result<(), TransportError>;

    /// Wait for the next client frame
    async fn receive(&mut self) -> Result<Value, TransportError>;

    /// Close the connection. Errors are ignored; the peer may already be gone.
    async fn close(&mut self, code: u16, reason: &str);
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn create_session(
        &self,
        owner_id: &str,
        title: &str,
        state: &Value,
        user_state: &UserState,
    ) -> StoreResult<Session> {
        (**self)
            .create_session(owner_id, title, state, user_state)
            .await
    }

    async fn get_session(&self, id: i64) -> StoreResult<Session> {
        (**self).get_session(id).await
    }

    async fn open_session(&self, id: i64) -> StoreResult<()> {
        (**self).open_session(id).await
    }

    async fn close_session(&self, id: i64) -> StoreResult<()> {
        (**self).close_session(id).await
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        (**self).delete_session(id).await
    }

    async fn update_session_state(
        &self,
        id: i64,
        state: &Value,
        user_state: &UserState,
    ) -> StoreResult<()> {
        (**self).update_session_state(id, state, user_state).await
    }

    async fn duplicate_session(&self, id: i64) -> StoreResult<Session> {
        (**self).duplicate_session(id).await
    }
}

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn append_messages(
        &self,
        session_id: i64,
        payloads: &[Payload],
        is_system: bool,
    ) -> StoreResult<Vec<Message>> {
        (**self)
            .append_messages(session_id, payloads, is_system)
            .await
    }

    async fn list_messages(&self, session_id: i64) -> StoreResult<Vec<Message>> {
        (**self).list_messages(session_id).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::SessionNotFound(id) => StoreError::NotFound(id),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for DatabaseStorage {
    async fn create_session(
        &self,
        owner_id: &str,
        title: &str,
        state: &Value,
        user_state: &UserState,
    ) -> StoreResult<Session> {
        Ok(self.db.create_session(owner_id, title, state, user_state)?)
    }

    async fn get_session(&self, id: i64) -> StoreResult<Session> {
        Ok(self.db.get_session(id)?)
    }

    async fn open_session(&self, id: i64) -> StoreResult<()> {
        Ok(self.db.open_session(id)?)
    }

    async fn close_session(&self, id: i64) -> StoreResult<()> {
        Ok(self.db.close_session(id)?)
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        Ok(self.db.delete_session(id)?)
    }

    async fn update_session_state(
        &self,
        id: i64,
        state: &Value,
        user_state: &UserState,
    ) -> StoreResult<()> {
        Ok(self.db.update_session_state(id, state, user_state)?)
    }

    async fn duplicate_session(&self, id: i64) -> StoreResult<Session> {
        Ok(self.db.duplicate_session(id)?)
    }
}

#[async_trait]
impl MessageStore for DatabaseStorage {
    async fn append_messages(
        &self,
        session_id: i64,
        payloads: &[Payload],
        is_system: bool,
    ) -> StoreResult<Vec<Message>> {
        Ok(self.db.append_messages(session_id, payloads, is_system)?)
    }

    async fn list_messages(&self, session_id: i64) -> StoreResult<Vec<Message>> {
        Ok(self.db.list_messages(session_id)?)
    }
}
