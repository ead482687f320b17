//! Turnstile - resumable conversational sessions
//!
//! Drives per-connection interaction loops over a registry of persisted
//! state machines, with SQLite-backed sessions and message logs.

mod api;
mod db;
mod llm;
mod payload;
mod runtime;
mod session_title;
mod state_machine;

use api::{create_router, AppState};
use db::Database;
use llm::{LlmConfig, ModelRegistry};
use state_machine::default_registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnstile=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("TURNSTILE_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.turnstile/turnstile.db")
    });

    let port: u16 = std::env::var("TURNSTILE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    // No loop survives a restart
    let released = db.close_all_open_sessions()?;
    if released > 0 {
        tracing::info!(count = released, "Closed sessions left open by a previous run");
    }

    let llm_registry = Arc::new(ModelRegistry::new(&LlmConfig::from_env()));
    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!(
            "No LLM API keys configured. Set ANTHROPIC_API_KEY, MISTRAL_API_KEY, PERPLEXITY_API_KEY or GROQ_API_KEY."
        );
    }

    let states = Arc::new(default_registry());
    tracing::info!(tags = ?states.tags(), "State registry initialized");

    let state = AppState::new(db, states, llm_registry);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Turnstile server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
