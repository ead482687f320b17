//! Database module for Turnstile
//!
//! Provides persistence for sessions, their message logs and user profiles.

mod schema;

pub use schema::*;

use crate::payload::{Payload, PayloadError};
use crate::session_title::next_duplicate_title;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(i64),
    #[error("Stored payload of message {message_id} is invalid: {source}")]
    Payload {
        message_id: i64,
        source: PayloadError,
    },
    #[error("Stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const SESSION_COLUMNS: &str =
    "id, owner_id, title, system_state, user_state, is_open, created_at, last_activity_at";

type SessionRow = (i64, String, String, String, String, bool, String, String);
type MessageRow = (i64, i64, String, bool, String);

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> DbResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Session Operations ====================

    /// Create a new, closed session
    pub fn create_session(
        &self,
        owner_id: &str,
        title: &str,
        system_state: &Value,
        user_state: &UserState,
    ) -> DbResult<Session> {
        let conn = self.lock();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO sessions (owner_id, title, system_state, user_state, is_open, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![
                owner_id,
                title,
                serde_json::to_string(system_state)?,
                serde_json::to_string(user_state)?,
                now.to_rfc3339(),
            ],
        )?;

        Ok(Session {
            id: conn.last_insert_rowid(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            created_at: now,
            last_activity_at: now,
            system_state: system_state.clone(),
            user_state: user_state.clone(),
            is_open: false,
        })
    }

    /// Get session by ID
    pub fn get_session(&self, id: i64) -> DbResult<Session> {
        let conn = self.lock();
        get_session_with(&conn, id)
    }

    /// Owner's sessions, most recently active first
    pub fn list_sessions(&self, owner_id: &str) -> DbResult<Vec<Session>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE owner_id = ?1 ORDER BY last_activity_at DESC, id DESC"
        ))?;

        let rows = stmt
            .query_map(params![owner_id], read_session_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(session_from_row).collect()
    }

    /// Mark a session as owned by a live connection
    pub fn open_session(&self, id: i64) -> DbResult<()> {
        self.set_open(id, true)
    }

    /// Release a session
    pub fn close_session(&self, id: i64) -> DbResult<()> {
        self.set_open(id, false)
    }

    fn set_open(&self, id: i64, is_open: bool) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE sessions SET is_open = ?1 WHERE id = ?2",
            params![is_open, id],
        )?;
        if updated == 0 {
            return Err(DbError::SessionNotFound(id));
        }
        Ok(())
    }

    /// Close every session still marked open. Returns how many were closed.
    pub fn close_all_open_sessions(&self) -> DbResult<usize> {
        let conn = self.lock();
        Ok(conn.execute("UPDATE sessions SET is_open = 0 WHERE is_open = 1", [])?)
    }

    /// Delete a session and (by cascade) its messages
    pub fn delete_session(&self, id: i64) -> DbResult<()> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::SessionNotFound(id));
        }
        Ok(())
    }

    /// Checkpoint the state-machine position and user scratch data
    pub fn update_session_state(
        &self,
        id: i64,
        system_state: &Value,
        user_state: &UserState,
    ) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE sessions SET system_state = ?1, user_state = ?2, last_activity_at = ?3
             WHERE id = ?4",
            params![
                serde_json::to_string(system_state)?,
                serde_json::to_string(user_state)?,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::SessionNotFound(id));
        }
        Ok(())
    }

    /// Copy a session and its whole message log under a new id.
    ///
    /// The copy is closed and titled with the owner's next free suffix for
    /// the original's base title. Messages keep their payloads, authorship
    /// and timestamps but get fresh ids in the original order.
    pub fn duplicate_session(&self, id: i64) -> DbResult<Session> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let original = get_session_with(&tx, id)?;
        let titles: Vec<String> = {
            let mut stmt = tx.prepare("SELECT title FROM sessions WHERE owner_id = ?1")?;
            let titles = stmt
                .query_map(params![original.owner_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            titles
        };
        let title = next_duplicate_title(&original.title, titles.iter().map(String::as_str));
        let now = Utc::now();

        tx.execute(
            "INSERT INTO sessions (owner_id, title, system_state, user_state, is_open, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![
                original.owner_id,
                title,
                serde_json::to_string(&original.system_state)?,
                serde_json::to_string(&original.user_state)?,
                now.to_rfc3339(),
            ],
        )?;
        let new_id = tx.last_insert_rowid();

        let copied = tx.execute(
            "INSERT INTO messages (session_id, payload, is_system, created_at)
             SELECT ?1, payload, is_system, created_at FROM messages
             WHERE session_id = ?2 ORDER BY id ASC",
            params![new_id, id],
        )?;
        tx.commit()?;

        tracing::debug!(from = id, to = new_id, messages = copied, "Duplicated session");

        Ok(Session {
            id: new_id,
            title,
            created_at: now,
            last_activity_at: now,
            is_open: false,
            ..original
        })
    }

    // ==================== Message Operations ====================

    /// Append a batch of payloads in order. Ids are assigned by the store.
    pub fn append_messages(
        &self,
        session_id: i64,
        payloads: &[Payload],
        is_system: bool,
    ) -> DbResult<Vec<Message>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let created_at = now.to_rfc3339();

        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(DbError::SessionNotFound(session_id));
        }

        let mut messages = Vec::with_capacity(payloads.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (session_id, payload, is_system, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for payload in payloads {
                stmt.execute(params![
                    session_id,
                    serde_json::to_string(payload)?,
                    is_system,
                    created_at,
                ])?;
                messages.push(Message {
                    id: tx.last_insert_rowid(),
                    session_id,
                    payload: payload.clone(),
                    created_at: now,
                    is_system,
                });
            }
        }

        tx.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![created_at, session_id],
        )?;
        tx.commit()?;
        Ok(messages)
    }

    /// Messages of a session in canonical (id ascending) order
    pub fn list_messages(&self, session_id: i64) -> DbResult<Vec<Message>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, payload, is_system, created_at
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt
            .query_map(params![session_id], |row| -> rusqlite::Result<MessageRow> {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(message_from_row).collect()
    }

    // ==================== User Profiles ====================

    pub fn get_user_profile(&self, id: &str) -> DbResult<Option<UserProfile>> {
        let conn = self.lock();
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT id, username, plan, created_at FROM user_profiles WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        Ok(row.map(|(id, username, plan, created_at)| UserProfile {
            id,
            username,
            plan,
            created_at: parse_datetime(&created_at),
        }))
    }

    pub fn upsert_user_profile(&self, profile: &UserProfile) -> DbResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO user_profiles (id, username, plan, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username, plan = excluded.plan",
            params![
                profile.id,
                profile.username,
                profile.plan,
                profile.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

fn get_session_with(conn: &Connection, id: i64) -> DbResult<Session> {
    let row = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
            read_session_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id),
            other => DbError::Sqlite(other),
        })?;
    session_from_row(row)
}

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn session_from_row(row: SessionRow) -> DbResult<Session> {
    let (id, owner_id, title, system_state, user_state, is_open, created_at, last_activity_at) =
        row;
    Ok(Session {
        id,
        owner_id,
        title,
        created_at: parse_datetime(&created_at),
        last_activity_at: parse_datetime(&last_activity_at),
        system_state: serde_json::from_str(&system_state)?,
        user_state: serde_json::from_str(&user_state)?,
        is_open,
    })
}

fn message_from_row(row: MessageRow) -> DbResult<Message> {
    let (id, session_id, payload, is_system, created_at) = row;
    let raw: Value = serde_json::from_str(&payload)?;
    let payload = Payload::from_value(&raw).map_err(|source| DbError::Payload {
        message_id: id,
        source,
    })?;
    Ok(Message {
        id,
        session_id,
        payload,
        created_at: parse_datetime(&created_at),
        is_system,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
