//! Utility states shared by every flow

use super::registry::{StateContext, StateHandler, Transition, TransitionError};
use super::state::SystemState;
use crate::payload::Payload;
use async_trait::async_trait;

/// Absorbing terminal state: stays put and emits nothing
pub struct NullState;

#[async_trait]
impl StateHandler for NullState {
    async fn execute(
        &self,
        _state: &SystemState,
        _ctx: &mut StateContext<'_>,
    ) -> Result<Transition, TransitionError> {
        Ok(Transition::new(SystemState::null(), vec![]))
    }
}

pub const GOODBYE_TAG: &str = "goodbye";

/// Says goodbye, ends the session, then becomes `null`
pub struct GoodbyeState;

impl GoodbyeState {
    pub fn state() -> SystemState {
        SystemState::new(GOODBYE_TAG)
    }
}

#[async_trait]
impl StateHandler for GoodbyeState {
    async fn execute(
        &self,
        _state: &SystemState,
        _ctx: &mut StateContext<'_>,
    ) -> Result<Transition, TransitionError> {
        Ok(Transition::new(
            SystemState::null(),
            vec![Payload::chat("Goodbye!"), Payload::EndSession],
        ))
    }
}
