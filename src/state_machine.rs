//! Conversation state machine
//!
//! A session's position in the flow is a tagged [`SystemState`]. The
//! [`StateRegistry`] maps each tag to the handler that computes the next
//! state and the payloads produced on the way.

pub mod builtin;
pub mod registry;
pub mod search_flow;
pub mod state;

#[cfg(test)]
mod proptests;

pub use builtin::{GoodbyeState, GOODBYE_TAG};
pub use registry::{
    Interaction, InteractionError, StateContext, StateHandler, StateRegistry, Transition,
    TransitionError,
};
pub use search_flow::{ExpandState, SearchState, StartState, EXPAND_TAG, SEARCH_TAG, START_TAG};
pub use state::{StateError, SystemState, NULL_TAG};

/// Registry with the search flow and the shared utility states
pub fn default_registry() -> StateRegistry {
    let mut registry = StateRegistry::new(START_TAG);
    registry
        .register(START_TAG, StartState)
        .register(EXPAND_TAG, ExpandState)
        .register(SEARCH_TAG, SearchState)
        .register(GOODBYE_TAG, GoodbyeState);
    registry
}
