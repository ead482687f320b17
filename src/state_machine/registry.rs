//! Registry mapping state tags to their transition handlers

use super::state::{StateError, SystemState};
use crate::db::{Message, UserProfile};
use crate::llm::{LlmError, TextGenerator};
use crate::payload::{Payload, PayloadError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Result of executing one state
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SystemState,
    /// Payloads the loop persists as system messages, in order
    pub payloads: Vec<Payload>,
}

impl Transition {
    pub fn new(next: SystemState, payloads: Vec<Payload>) -> Self {
        Self { next, payloads }
    }
}

/// Failure of the client channel seen from inside a transition
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("connection closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Protocol(#[from] PayloadError),
}

/// Channel a transition uses to talk to the client mid-execution.
///
/// Implementations decide how suspension happens; handlers only await.
#[async_trait]
pub trait Interaction: Send {
    /// Send an ephemeral, non-persisted notice
    async fn notify(&mut self, payload: Payload) -> Result<(), InteractionError>;

    /// Ask the client for exactly one payload and wait for it
    async fn request(&mut self) -> Result<Payload, InteractionError>;
}

/// Why a transition did not produce a next state
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error(transparent)]
    Interaction(#[from] InteractionError),
    #[error("text generation failed: {0}")]
    Generation(#[from] LlmError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("invalid state data: {0}")]
    InvalidState(String),
}

impl TransitionError {
    /// Whether the client went away (normal termination, not a failure)
    pub fn is_closed(&self) -> bool {
        matches!(self, TransitionError::Interaction(InteractionError::Closed))
    }
}

/// Everything a transition may read or call
pub struct StateContext<'a> {
    pub user: &'a UserProfile,
    pub history: &'a [Message],
    pub generator: &'a dyn TextGenerator,
    pub io: &'a mut dyn Interaction,
}

/// Transition function for one state tag
#[async_trait]
pub trait StateHandler: Send + Sync {
    async fn execute(
        &self,
        state: &SystemState,
        ctx: &mut StateContext<'_>,
    ) -> Result<Transition, TransitionError>;
}

/// Tag → handler table, built once at start-up and shared read-only
pub struct StateRegistry {
    handlers: HashMap<String, Arc<dyn StateHandler>>,
    initial: SystemState,
}

impl StateRegistry {
    /// Create a registry whose new sessions start in `initial_tag`.
    ///
    /// The absorbing `null` state is always registered.
    pub fn new(initial_tag: impl Into<String>) -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            initial: SystemState::new(initial_tag),
        };
        registry.register(super::state::NULL_TAG, super::builtin::NullState);
        registry
    }

    /// Associate a handler with a tag. Registering a tag again replaces it.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        handler: impl StateHandler + 'static,
    ) -> &mut Self {
        let tag = tag.into();
        if self.handlers.insert(tag.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(tag = %tag, "Replaced state handler");
        }
        self
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Registered tags, sorted
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// State given to freshly created sessions
    pub fn initial_state(&self) -> SystemState {
        self.initial.clone()
    }

    /// Parse a persisted state and check its tag is known
    pub fn instantiate(&self, raw: &Value) -> Result<SystemState, StateError> {
        let state = SystemState::from_value(raw)?;
        if !self.is_registered(state.tag()) {
            return Err(StateError::Unregistered(state.tag().to_string()));
        }
        Ok(state)
    }

    /// Run the handler registered for `state`
    pub async fn execute(
        &self,
        state: &SystemState,
        ctx: &mut StateContext<'_>,
    ) -> Result<Transition, TransitionError> {
        let handler = self
            .handlers
            .get(state.tag())
            .cloned()
            .ok_or_else(|| StateError::Unregistered(state.tag().to_string()))?;
        handler.execute(state, ctx).await
    }
}
