//! HTTP request handlers

use super::types::{ErrorResponse, SessionListResponse, SessionResponse, SessionSummary};
use super::ws::WsTransport;
use super::AppState;
use crate::db::{DbError, Session, UserProfile};
use crate::runtime::{DatabaseStorage, Envelope, SessionLoop, NEW_SESSION_ID};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, State, WebSocketUpgrade},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

/// Header set by the upstream authenticator
pub const USER_HEADER: &str = "x-authenticated-user";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_name))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        // Websocket interaction loop; -1 creates a new session
        .route("/chat/:session_id", get(open_chat))
        .with_state(state)
}

async fn service_name() -> &'static str {
    concat!("turnstile ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Caller Identity
// ============================================================

/// Id of the authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| Caller(id.to_string()))
            .ok_or_else(|| AppError::Unauthorized(format!("missing {USER_HEADER} header")))
    }
}

// ============================================================
// Session Listing
// ============================================================

async fn list_sessions(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state.db.list_sessions(&user_id).map_err(AppError::from)?;

    Ok(Json(SessionListResponse {
        sessions: sessions.iter().map(SessionSummary::from).collect(),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = owned_session(&state, &user_id, id)?;
    let messages = state.db.list_messages(id).map_err(AppError::from)?;

    Ok(Json(SessionResponse {
        session: SessionSummary::from(&session),
        messages: messages
            .iter()
            .map(|m| Envelope::stored(m).to_value())
            .collect(),
    }))
}

fn owned_session(state: &AppState, user_id: &str, id: i64) -> Result<Session, AppError> {
    let session = state.db.get_session(id).map_err(AppError::from)?;
    if session.owner_id != user_id {
        return Err(AppError::Unauthorized(format!(
            "session {id} belongs to another user"
        )));
    }
    Ok(session)
}

// ============================================================
// Interaction Loop
// ============================================================

/// Upgrade to a websocket and run the session loop on it.
///
/// Ownership and existence are checked by the loop itself so that the
/// client receives an error notice and a close code rather than an HTTP
/// status.
async fn open_chat(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(session_id): Path<i64>,
) -> Result<Response, AppError> {
    let user = load_profile(&state, user_id)?;
    tracing::info!(
        user_id = %user.id,
        session_id,
        new_session = session_id == NEW_SESSION_ID,
        "Websocket upgrade requested"
    );

    Ok(ws
        .on_upgrade(move |socket| async move {
            let session_loop = SessionLoop::new(
                DatabaseStorage::new(state.db.clone()),
                WsTransport::new(socket),
                state.states.clone(),
                state.generator.clone(),
                user,
            );
            if let Err(e) = session_loop.run(session_id).await {
                tracing::debug!(session_id, error = %e, "Websocket closed after loop error");
            }
        })
        .into_response())
}

/// Stored profile of the caller. A caller seen for the first time gets a
/// placeholder profile, which is stored so later lookups find it.
fn load_profile(state: &AppState, user_id: String) -> Result<UserProfile, AppError> {
    if let Some(profile) = state
        .db
        .get_user_profile(&user_id)
        .map_err(AppError::from)?
    {
        return Ok(profile);
    }

    let profile = UserProfile::unregistered(user_id);
    state
        .db
        .upsert_user_profile(&profile)
        .map_err(AppError::from)?;
    tracing::info!(user_id = %profile.id, "Registered placeholder profile");
    Ok(profile)
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::SessionNotFound(_) => AppError::NotFound(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
