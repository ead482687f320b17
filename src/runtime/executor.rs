//! Session loop executor
//!
//! Drives one connection through handshake, acquire, open, replay,
//! pending-input resolution, the run loop and teardown.

use super::traits::{Storage, StoreError, Transport, TransportError};
use super::wire::{inbound_payload, Envelope, Notice};
use super::{Disposal, ExitReason, LoopError, LoopOutcome};
use crate::db::{Message, Session, UserProfile, UserState};
use crate::llm::TextGenerator;
use crate::payload::Payload;
use crate::session_title::generate_title;
use crate::state_machine::{
    Interaction, InteractionError, StateContext, StateError, StateRegistry, SystemState,
    TransitionError,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Requested session id meaning "create a new session"
pub const NEW_SESSION_ID: i64 = -1;

/// Status code carried by the error notice for an invalid client frame
const PROTOCOL_ERROR_CODE: u16 = 400;

/// Interaction loop for one accepted connection
pub struct SessionLoop<S: Storage, T: Transport> {
    storage: S,
    transport: T,
    states: Arc<StateRegistry>,
    generator: Arc<dyn TextGenerator>,
    user: UserProfile,
}

impl<S: Storage, T: Transport> SessionLoop<S, T> {
    pub fn new(
        storage: S,
        transport: T,
        states: Arc<StateRegistry>,
        generator: Arc<dyn TextGenerator>,
        user: UserProfile,
    ) -> Self {
        Self {
            storage,
            transport,
            states,
            generator,
            user,
        }
    }

    /// Run the loop to completion and close the transport.
    ///
    /// On failure the client receives an error notice before the close frame.
    pub async fn run(mut self, requested_id: i64) -> Result<LoopOutcome, LoopError> {
        let result = self.drive(requested_id).await;

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    user_id = %self.user.id,
                    session_id = ?outcome.session_id,
                    exit = ?outcome.exit,
                    disposal = ?outcome.disposal,
                    "Session loop finished"
                );
                self.transport.close(1000, "session ended").await;
            }
            Err(e) => {
                tracing::error!(
                    user_id = %self.user.id,
                    requested_id,
                    error = %e,
                    "Session loop aborted"
                );
                let notice = Notice::Error {
                    code: e.status_code(),
                    message: e.to_string(),
                };
                // The client may already be gone; the close below is what matters
                let _ = self.transport.send(Envelope::notice(&notice).to_value()).await;
                self.transport.close(e.close_code(), &e.to_string()).await;
            }
        }

        result
    }

    async fn drive(&mut self, requested_id: i64) -> Result<LoopOutcome, LoopError> {
        if self.send_notice(Notice::Connected).await.is_err() {
            return Ok(LoopOutcome {
                session_id: None,
                exit: ExitReason::ClientClosed,
                disposal: Disposal::Untouched,
            });
        }
        tracing::info!(user_id = %self.user.id, requested_id, "Client connected");

        let (session, state, created) = self.acquire(requested_id).await?;
        let session_id = session.id;

        let exit = self.interact(session, state, created).await;
        let disposal = self.teardown(session_id).await;

        match (exit, disposal) {
            (Ok(exit), Ok(disposal)) => Ok(LoopOutcome {
                session_id: Some(session_id),
                exit,
                disposal,
            }),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), disposal) => {
                if let Err(teardown_error) = disposal {
                    tracing::warn!(
                        session_id,
                        error = %teardown_error,
                        "Teardown after failure also failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Resolve the session to act on. Nothing is written until the persisted
    /// state is known to be registered.
    async fn acquire(
        &mut self,
        requested_id: i64,
    ) -> Result<(Session, SystemState, bool), LoopError> {
        if requested_id == NEW_SESSION_ID {
            let state = self.states.initial_state();
            let session = self
                .storage
                .create_session(
                    &self.user.id,
                    &generate_title(),
                    &state.to_value(),
                    &UserState::new(),
                )
                .await?;
            tracing::info!(
                user_id = %self.user.id,
                session_id = session.id,
                title = %session.title,
                "Created session"
            );
            return Ok((session, state, true));
        }

        let session = self
            .storage
            .get_session(requested_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => LoopError::SessionNotFound(id),
                other => LoopError::Storage(other),
            })?;

        if session.owner_id != self.user.id {
            return Err(LoopError::Unauthorized {
                session_id: requested_id,
            });
        }

        let state = self.states.instantiate(&session.system_state)?;

        // Read-then-branch, not compare-and-swap: two near-simultaneous opens
        // of a closed session can both proceed against the original.
        if session.is_open {
            let copy = self.storage.duplicate_session(session.id).await?;
            tracing::info!(
                user_id = %self.user.id,
                from = session.id,
                session_id = copy.id,
                title = %copy.title,
                "Session already open, continuing on a duplicate"
            );
            return Ok((copy, state, false));
        }

        Ok((session, state, false))
    }

    /// Open, replay, resolve pending input, then run transitions until the
    /// flow ends or the client leaves.
    async fn interact(
        &mut self,
        session: Session,
        mut state: SystemState,
        created: bool,
    ) -> Result<ExitReason, LoopError> {
        let session_id = session.id;
        let user_state = session.user_state;

        if created
            && self
                .send_notice(Notice::SessionCreated { id: session_id })
                .await
                .is_err()
        {
            return Ok(ExitReason::ClientClosed);
        }

        self.storage.open_session(session_id).await?;
        tracing::debug!(session_id, "Opened session");

        let mut history = self.storage.list_messages(session_id).await?;
        for message in &history {
            if self.send_message(message).await.is_err() {
                return Ok(ExitReason::ClientClosed);
            }
        }
        tracing::info!(session_id, count = history.len(), "Replayed history");

        let pending = history
            .last()
            .is_some_and(|m| m.is_system && m.payload.requires_user_input());
        if pending {
            if let Some(exit) = self.await_reply(session_id, &mut history).await? {
                return Ok(exit);
            }
        }

        // Resumed at the end of a finished flow
        if state.is_null() {
            return Ok(ExitReason::Finished);
        }

        loop {
            let outcome = {
                let mut io = LoopInteraction {
                    transport: &mut self.transport,
                };
                let mut ctx = StateContext {
                    user: &self.user,
                    history: &history,
                    generator: self.generator.as_ref(),
                    io: &mut io,
                };
                self.states.execute(&state, &mut ctx).await
            };

            let transition = match outcome {
                Ok(transition) => transition,
                Err(e) if e.is_closed() => {
                    tracing::info!(session_id, tag = state.tag(), "Client left during transition");
                    return Ok(ExitReason::ClientClosed);
                }
                Err(TransitionError::State(e)) => return Err(LoopError::StateResolution(e)),
                Err(TransitionError::Interaction(e)) => {
                    self.protocol_violation(session_id, &e.to_string()).await;
                    return Ok(ExitReason::ProtocolViolation);
                }
                Err(e) => {
                    tracing::error!(session_id, tag = state.tag(), error = %e, "Transition failed");
                    return Ok(ExitReason::TransitionFailed);
                }
            };

            // Never checkpoint a state that could not be resumed
            if !self.states.is_registered(transition.next.tag()) {
                tracing::error!(
                    session_id,
                    from = state.tag(),
                    to = transition.next.tag(),
                    "Transition produced an unregistered state"
                );
                return Err(LoopError::StateResolution(StateError::Unregistered(
                    transition.next.tag().to_string(),
                )));
            }

            self.storage
                .update_session_state(session_id, &transition.next.to_value(), &user_state)
                .await?;

            let stored = if transition.payloads.is_empty() {
                Vec::new()
            } else {
                self.storage
                    .append_messages(session_id, &transition.payloads, true)
                    .await?
            };

            tracing::info!(
                session_id,
                from = state.tag(),
                to = transition.next.tag(),
                count = stored.len(),
                "State transition"
            );

            for message in stored {
                let needs_reply = message.payload.requires_user_input();
                let sent = self.send_message(&message).await;
                history.push(message);
                if sent.is_err() {
                    return Ok(ExitReason::ClientClosed);
                }
                if needs_reply {
                    if let Some(exit) = self.await_reply(session_id, &mut history).await? {
                        return Ok(exit);
                    }
                }
            }

            if transition.next.is_null() {
                return Ok(ExitReason::Finished);
            }
            state = transition.next;
        }
    }

    /// Block for exactly one client payload, persist it as a user message and
    /// echo it back. Returns an exit reason when the loop must stop instead.
    async fn await_reply(
        &mut self,
        session_id: i64,
        history: &mut Vec<Message>,
    ) -> Result<Option<ExitReason>, LoopError> {
        let frame = match self.transport.receive().await {
            Ok(frame) => frame,
            Err(TransportError::Closed) => return Ok(Some(ExitReason::ClientClosed)),
            Err(TransportError::Malformed(reason)) => {
                self.protocol_violation(session_id, &reason).await;
                return Ok(Some(ExitReason::ProtocolViolation));
            }
        };

        let payload = match inbound_payload(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                self.protocol_violation(session_id, &e.to_string()).await;
                return Ok(Some(ExitReason::ProtocolViolation));
            }
        };

        let kind = payload.kind();
        let stored = self
            .storage
            .append_messages(session_id, &[payload], false)
            .await?;
        tracing::debug!(session_id, kind, count = stored.len(), "Stored user reply");

        let mut closed = false;
        for message in stored {
            closed |= self.send_message(&message).await.is_err();
            history.push(message);
        }

        Ok(closed.then_some(ExitReason::ClientClosed))
    }

    /// Delete a session nobody replied in, otherwise release it
    async fn teardown(&mut self, session_id: i64) -> Result<Disposal, LoopError> {
        let messages = self.storage.list_messages(session_id).await?;

        if messages.iter().all(|m| m.is_system) {
            self.storage.delete_session(session_id).await?;
            tracing::info!(session_id, "Deleted session without user messages");
            Ok(Disposal::Deleted)
        } else {
            self.storage.close_session(session_id).await?;
            tracing::info!(session_id, count = messages.len(), "Closed session");
            Ok(Disposal::Closed)
        }
    }

    async fn protocol_violation(&mut self, session_id: i64, reason: &str) {
        tracing::warn!(session_id, reason, "Invalid client frame");
        let notice = Notice::Error {
            code: PROTOCOL_ERROR_CODE,
            message: reason.to_string(),
        };
        let _ = self.send_notice(notice).await;
    }

    async fn send_notice(&mut self, notice: Notice) -> Result<(), TransportError> {
        self.transport
            .send(Envelope::notice(&notice).to_value())
            .await
    }

    async fn send_message(&mut self, message: &Message) -> Result<(), TransportError> {
        self.transport
            .send(Envelope::stored(message).to_value())
            .await
    }
}

/// Client channel handed to transitions while the loop is suspended in them
struct LoopInteraction<'a, T: Transport> {
    transport: &'a mut T,
}

impl From<TransportError> for InteractionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => InteractionError::Closed,
            TransportError::Malformed(reason) => InteractionError::Malformed(reason),
        }
    }
}

#[async_trait]
impl<T: Transport> Interaction for LoopInteraction<'_, T> {
    async fn notify(&mut self, payload: Payload) -> Result<(), InteractionError> {
        self.transport
            .send(Envelope::ephemeral(&payload, true).to_value())
            .await?;
        Ok(())
    }

    async fn request(&mut self) -> Result<Payload, InteractionError> {
        self.transport
            .send(Envelope::ephemeral(&Payload::OpenChat, true).to_value())
            .await?;
        let frame = self.transport.receive().await?;
        let payload = inbound_payload(&frame)?;
        self.transport
            .send(Envelope::ephemeral(&payload, false).to_value())
            .await?;
        Ok(payload)
    }
}
