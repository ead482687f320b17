//! HTTP and websocket surface
//!
//! Read-only session listing plus the websocket endpoint that runs one
//! [`SessionLoop`](crate::runtime::SessionLoop) per connection.

mod handlers;
mod types;
mod ws;

pub use handlers::create_router;

use crate::db::Database;
use crate::llm::TextGenerator;
use crate::state_machine::StateRegistry;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub states: Arc<StateRegistry>,
    pub generator: Arc<dyn TextGenerator>,
}

impl AppState {
    pub fn new(db: Database, states: Arc<StateRegistry>, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            db,
            states,
            generator,
        }
    }
}
