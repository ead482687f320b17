//! Reference conversation flow: greet, sharpen the user's question, search it

use super::builtin::GoodbyeState;
use super::registry::{StateContext, StateHandler, Transition, TransitionError};
use super::state::SystemState;
use crate::db::Message;
use crate::llm::GenerateOptions;
use crate::payload::Payload;
use async_trait::async_trait;

pub const START_TAG: &str = "start";
pub const EXPAND_TAG: &str = "expand";
pub const SEARCH_TAG: &str = "search";

const GREETING: &str = "Hello! I'm Turnstile.\nI can search things for you! Chat with me.";

const EXPAND_SYSTEM_PROMPT: &str =
    "You rewrite search queries. Answer with the rewritten query and nothing else.";

/// Model used to sharpen queries
pub const EXPAND_MODEL: &str = "mistral-small";
/// Online model used to answer queries
pub const SEARCH_MODEL: &str = "sonar";

/// Greets the user and asks for a question
pub struct StartState;

#[async_trait]
impl StateHandler for StartState {
    async fn execute(
        &self,
        _state: &SystemState,
        _ctx: &mut StateContext<'_>,
    ) -> Result<Transition, TransitionError> {
        Ok(Transition::new(
            ExpandState::state(),
            vec![Payload::chat(GREETING), Payload::OpenChat],
        ))
    }
}

/// Turns the latest user question into a more precise search query
pub struct ExpandState;

impl ExpandState {
    pub fn state() -> SystemState {
        SystemState::new(EXPAND_TAG)
    }
}

#[async_trait]
impl StateHandler for ExpandState {
    async fn execute(
        &self,
        _state: &SystemState,
        ctx: &mut StateContext<'_>,
    ) -> Result<Transition, TransitionError> {
        let Some(prompt) = latest_user_chat(ctx.history) else {
            return Ok(Transition::new(
                Self::state(),
                vec![
                    Payload::chat("What would you like me to search for?"),
                    Payload::OpenChat,
                ],
            ));
        };

        tracing::debug!(user_id = %ctx.user.id, prompt_len = prompt.len(), "Expanding query");
        ctx.io
            .notify(Payload::chat("Thinking how to expand your query..."))
            .await?;

        let query = format!(
            "```\n{prompt}\n```\n\nAdd precision and context to the above internet search query.\n\nAnswer with only the modified query without text before or after:"
        );
        let options = GenerateOptions {
            model: Some(EXPAND_MODEL.to_string()),
            system_prompt: Some(EXPAND_SYSTEM_PROMPT.to_string()),
            temperature: Some(0.0),
            max_tokens: None,
        };
        let expanded = ctx.generator.generate(&query, &options).await?;
        let expanded = expanded.trim().to_string();

        Ok(Transition::new(
            SearchState::state(&expanded),
            vec![Payload::chat(expanded)],
        ))
    }
}

/// Answers the expanded query with an online model
pub struct SearchState;

impl SearchState {
    pub fn state(query: &str) -> SystemState {
        SystemState::new(SEARCH_TAG).with_field("query", query)
    }
}

#[async_trait]
impl StateHandler for SearchState {
    async fn execute(
        &self,
        state: &SystemState,
        ctx: &mut StateContext<'_>,
    ) -> Result<Transition, TransitionError> {
        let query = state
            .field("query")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| TransitionError::InvalidState("search state has no query".to_string()))?;

        tracing::debug!(user_id = %ctx.user.id, query, "Searching");
        ctx.io.notify(Payload::chat("Searching...")).await?;

        let options = GenerateOptions {
            model: Some(SEARCH_MODEL.to_string()),
            ..GenerateOptions::default()
        };
        let answer = ctx
            .generator
            .generate(&format!("What is {query}?"), &options)
            .await?;

        Ok(Transition::new(
            GoodbyeState::state(),
            vec![Payload::chat(answer)],
        ))
    }
}

/// Text of the most recent user-authored chat message
fn latest_user_chat(history: &[Message]) -> Option<&str> {
    history
        .iter()
        .rev()
        .filter(|message| !message.is_system)
        .find_map(|message| message.payload.as_chat())
}
