//! Mock implementations for testing
//!
//! These mocks enable end-to-end loop testing without real I/O.

use super::traits::*;
use super::{LoopError, LoopOutcome, SessionLoop};
use crate::db::{Message, Session, UserProfile, UserState};
use crate::llm::{GenerateOptions, LlmError, TextGenerator};
use crate::payload::Payload;
use crate::session_title::next_duplicate_title;
use crate::state_machine::{
    default_registry, Interaction, InteractionError, StateRegistry, SystemState,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Build a stored message for handler tests
pub fn message(id: i64, payload: Payload, is_system: bool) -> Message {
    Message {
        id,
        session_id: 1,
        payload,
        created_at: Utc::now(),
        is_system,
    }
}

// ============================================================================
// Mock Text Generator
// ============================================================================

/// Generator that returns queued responses and records every call
#[derive(Default)]
pub struct MockTextGenerator {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<(String, GenerateOptions)>>,
}

impl MockTextGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_response(&self, text: impl Into<String>) {
        self.responses.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Prompt and options of every call so far
    pub fn recorded_calls(&self) -> Vec<(String, GenerateOptions)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for MockTextGenerator {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), options.clone()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }
}

// ============================================================================
// Recording Interaction
// ============================================================================

/// Interaction for calling handlers directly, without a loop
#[derive(Default)]
pub struct RecordingInteraction {
    pub notices: Vec<Payload>,
    pub replies: VecDeque<Payload>,
    pub requests: usize,
}

#[async_trait]
impl Interaction for RecordingInteraction {
    async fn notify(&mut self, payload: Payload) -> Result<(), InteractionError> {
        self.notices.push(payload);
        Ok(())
    }

    async fn request(&mut self) -> Result<Payload, InteractionError> {
        self.requests += 1;
        self.replies.pop_front().ok_or(InteractionError::Closed)
    }
}

// ============================================================================
// Scripted Transport
// ============================================================================

#[derive(Default)]
struct Script {
    inbound: VecDeque<Result<Value, TransportError>>,
    sent: Vec<Value>,
    closed: Option<(u16, String)>,
}

/// Transport that replays queued client frames and records what was sent.
///
/// Clones share the same script, so a test keeps one clone for inspection.
/// Once the queue is empty the client counts as disconnected.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, frame: Value) {
        self.script.lock().unwrap().inbound.push_back(Ok(frame));
    }

    pub fn push_error(&self, error: TransportError) {
        self.script.lock().unwrap().inbound.push_back(Err(error));
    }

    /// Every envelope sent, in order
    pub fn sent(&self) -> Vec<Value> {
        self.script.lock().unwrap().sent.clone()
    }

    /// Payload field of every envelope sent, in order
    pub fn sent_payloads(&self) -> Vec<Value> {
        self.sent().into_iter().map(|e| e["payload"].clone()).collect()
    }

    pub fn closed(&self) -> Option<(u16, String)> {
        self.script.lock().unwrap().closed.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, frame: Value) -> Result<(), TransportError> {
        let mut script = self.script.lock().unwrap();
        if script.closed.is_some() {
            return Err(TransportError::Closed);
        }
        script.sent.push(frame);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Value, TransportError> {
        self.script
            .lock()
            .unwrap()
            .inbound
            .pop_front()
            .unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.script.lock().unwrap().closed = Some((code, reason.to_string()));
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// One storage call, recorded in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Create(i64),
    Get(i64),
    Open(i64),
    Close(i64),
    Delete(i64),
    UpdateState { id: i64, tag: String },
    Duplicate { from: i64, to: i64 },
    Append { session_id: i64, count: usize, is_system: bool },
    List(i64),
}

#[derive(Default)]
struct Memory {
    sessions: BTreeMap<i64, Session>,
    messages: Vec<Message>,
    last_session_id: i64,
    last_message_id: i64,
    calls: Vec<StoreCall>,
    failing: HashSet<&'static str>,
}

impl Memory {
    fn check(&self, op: &'static str) -> StoreResult<()> {
        if self.failing.contains(op) {
            return Err(StoreError::Backend(format!("injected {op} failure")));
        }
        Ok(())
    }

    fn session_mut(&mut self, id: i64) -> StoreResult<&mut Session> {
        self.sessions.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn push_message(&mut self, session_id: i64, payload: Payload, is_system: bool) -> Message {
        self.last_message_id += 1;
        let message = Message {
            id: self.last_message_id,
            session_id,
            payload,
            created_at: Utc::now(),
            is_system,
        };
        self.messages.push(message.clone());
        message
    }
}

/// Storage double with failure injection and a call log
#[derive(Default)]
pub struct InMemoryStorage {
    memory: Mutex<Memory>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail with a backend error.
    ///
    /// Ops: create, get, open, close, delete, update_state, duplicate,
    /// append, list.
    pub fn fail_on(&self, op: &'static str) {
        self.memory.lock().unwrap().failing.insert(op);
    }

    /// Insert a session directly, bypassing the call log
    pub fn insert_session(&self, owner_id: &str, title: &str, state: Value, is_open: bool) -> i64 {
        let mut memory = self.memory.lock().unwrap();
        memory.last_session_id += 1;
        let id = memory.last_session_id;
        let now = Utc::now();
        memory.sessions.insert(
            id,
            Session {
                id,
                owner_id: owner_id.to_string(),
                title: title.to_string(),
                created_at: now,
                last_activity_at: now,
                system_state: state,
                user_state: UserState::new(),
                is_open,
            },
        );
        id
    }

    /// Append messages directly, bypassing the call log
    pub fn seed_messages(&self, session_id: i64, payloads: Vec<Payload>, is_system: bool) {
        let mut memory = self.memory.lock().unwrap();
        for payload in payloads {
            memory.push_message(session_id, payload, is_system);
        }
    }

    pub fn session(&self, id: i64) -> Option<Session> {
        self.memory.lock().unwrap().sessions.get(&id).cloned()
    }

    pub fn messages(&self, session_id: i64) -> Vec<Message> {
        self.memory
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.memory.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl SessionStore for InMemoryStorage {
    async fn create_session(
        &self,
        owner_id: &str,
        title: &str,
        state: &Value,
        user_state: &UserState,
    ) -> StoreResult<Session> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("create")?;
        memory.last_session_id += 1;
        let id = memory.last_session_id;
        let now = Utc::now();
        let session = Session {
            id,
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            created_at: now,
            last_activity_at: now,
            system_state: state.clone(),
            user_state: user_state.clone(),
            is_open: false,
        };
        memory.sessions.insert(id, session.clone());
        memory.calls.push(StoreCall::Create(id));
        Ok(session)
    }

    async fn get_session(&self, id: i64) -> StoreResult<Session> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("get")?;
        memory.calls.push(StoreCall::Get(id));
        memory
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn open_session(&self, id: i64) -> StoreResult<()> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("open")?;
        memory.session_mut(id)?.is_open = true;
        memory.calls.push(StoreCall::Open(id));
        Ok(())
    }

    async fn close_session(&self, id: i64) -> StoreResult<()> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("close")?;
        memory.session_mut(id)?.is_open = false;
        memory.calls.push(StoreCall::Close(id));
        Ok(())
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("delete")?;
        memory.sessions.remove(&id).ok_or(StoreError::NotFound(id))?;
        memory.messages.retain(|m| m.session_id != id);
        memory.calls.push(StoreCall::Delete(id));
        Ok(())
    }

    async fn update_session_state(
        &self,
        id: i64,
        state: &Value,
        user_state: &UserState,
    ) -> StoreResult<()> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("update_state")?;
        let session = memory.session_mut(id)?;
        session.system_state = state.clone();
        session.user_state = user_state.clone();
        session.last_activity_at = Utc::now();
        let tag = state["type"].as_str().unwrap_or_default().to_string();
        memory.calls.push(StoreCall::UpdateState { id, tag });
        Ok(())
    }

    async fn duplicate_session(&self, id: i64) -> StoreResult<Session> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("duplicate")?;
        let original = memory
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;

        let title = next_duplicate_title(
            &original.title,
            memory
                .sessions
                .values()
                .filter(|s| s.owner_id == original.owner_id)
                .map(|s| s.title.as_str()),
        );
        memory.last_session_id += 1;
        let copy = Session {
            id: memory.last_session_id,
            title,
            is_open: false,
            ..original
        };
        memory.sessions.insert(copy.id, copy.clone());

        let source: Vec<Message> = memory
            .messages
            .iter()
            .filter(|m| m.session_id == id)
            .cloned()
            .collect();
        for m in source {
            memory.last_message_id += 1;
            let cloned = Message {
                id: memory.last_message_id,
                session_id: copy.id,
                ..m
            };
            memory.messages.push(cloned);
        }

        memory.calls.push(StoreCall::Duplicate {
            from: id,
            to: copy.id,
        });
        Ok(copy)
    }
}

#[async_trait]
impl MessageStore for InMemoryStorage {
    async fn append_messages(
        &self,
        session_id: i64,
        payloads: &[Payload],
        is_system: bool,
    ) -> StoreResult<Vec<Message>> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("append")?;
        memory.session_mut(session_id)?;
        let stored: Vec<Message> = payloads
            .iter()
            .map(|p| memory.push_message(session_id, p.clone(), is_system))
            .collect();
        memory.calls.push(StoreCall::Append {
            session_id,
            count: payloads.len(),
            is_system,
        });
        Ok(stored)
    }

    async fn list_messages(&self, session_id: i64) -> StoreResult<Vec<Message>> {
        let mut memory = self.memory.lock().unwrap();
        memory.check("list")?;
        memory.calls.push(StoreCall::List(session_id));
        Ok(memory
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Test Loop Harness
// ============================================================================

/// Wires a [`SessionLoop`] to in-memory doubles
pub struct TestLoop {
    pub storage: Arc<InMemoryStorage>,
    pub transport: ScriptedTransport,
    pub generator: Arc<MockTextGenerator>,
    pub user: UserProfile,
    states: Arc<StateRegistry>,
}

impl TestLoop {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            transport: ScriptedTransport::new(),
            generator: Arc::new(MockTextGenerator::new()),
            user: UserProfile::unregistered("u1"),
            states: Arc::new(default_registry()),
        }
    }

    pub fn with_registry(mut self, registry: StateRegistry) -> Self {
        self.states = Arc::new(registry);
        self
    }

    pub fn reply(&self, text: &str) {
        self.transport.push_frame(Payload::chat(text).to_value());
    }

    pub async fn run(&self, requested_id: i64) -> Result<LoopOutcome, LoopError> {
        SessionLoop::new(
            self.storage.clone(),
            self.transport.clone(),
            self.states.clone(),
            self.generator.clone(),
            self.user.clone(),
        )
        .run(requested_id)
        .await
    }

    /// Tags of every state checkpoint, in order
    pub fn checkpoints(&self) -> Vec<String> {
        self.storage
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::UpdateState { tag, .. } => Some(tag),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::wire::EPHEMERAL_ID;
    use crate::runtime::{Disposal, ExitReason, NEW_SESSION_ID};
    use crate::state_machine::{
        StateContext, StateError, StateHandler, Transition, TransitionError,
    };
    use serde_json::json;

    fn ids_strictly_increase(messages: &[Message]) -> bool {
        messages.windows(2).all(|w| w[0].id < w[1].id)
    }

    /// Asks the client mid-transition and repeats what it said
    struct EchoState;

    #[async_trait]
    impl StateHandler for EchoState {
        async fn execute(
            &self,
            _state: &SystemState,
            ctx: &mut StateContext<'_>,
        ) -> Result<Transition, TransitionError> {
            let reply = ctx.io.request().await?;
            let text = reply.as_chat().unwrap_or("nothing").to_string();
            Ok(Transition::new(
                SystemState::null(),
                vec![Payload::chat(format!("you said {text}"))],
            ))
        }
    }

    /// Prompts mid-batch, then keeps talking
    struct AskThenTalkState;

    #[async_trait]
    impl StateHandler for AskThenTalkState {
        async fn execute(
            &self,
            _state: &SystemState,
            _ctx: &mut StateContext<'_>,
        ) -> Result<Transition, TransitionError> {
            Ok(Transition::new(
                SystemState::null(),
                vec![Payload::OpenChat, Payload::chat("after")],
            ))
        }
    }

    /// Moves to a tag nobody registered
    struct GhostState;

    #[async_trait]
    impl StateHandler for GhostState {
        async fn execute(
            &self,
            _state: &SystemState,
            _ctx: &mut StateContext<'_>,
        ) -> Result<Transition, TransitionError> {
            Ok(Transition::new(
                SystemState::new("ghost"),
                vec![Payload::chat("boo"), Payload::OpenChat],
            ))
        }
    }

    fn echo_registry() -> StateRegistry {
        let mut registry = StateRegistry::new("echo");
        registry.register("echo", EchoState);
        registry
    }

    #[tokio::test]
    async fn test_mock_text_generator() {
        let mock = MockTextGenerator::new();
        mock.queue_response("Hello");

        let options = GenerateOptions::default();
        assert_eq!(mock.generate("hi", &options).await.unwrap(), "Hello");
        // Second call should fail (no more responses)
        assert!(mock.generate("hi", &options).await.is_err());
        assert_eq!(mock.recorded_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_new_session_runs_full_flow() {
        let harness = TestLoop::new();
        harness.generator.queue_response("tokio async runtime internals");
        harness.generator.queue_response("Tokio is an async runtime.");
        harness.reply("tokio");

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        let session_id = outcome.session_id.unwrap();
        assert_eq!(outcome.exit, ExitReason::Finished);
        assert_eq!(outcome.disposal, Disposal::Closed);

        let messages = harness.storage.messages(session_id);
        let payloads: Vec<&Payload> = messages.iter().map(|m| &m.payload).collect();
        assert_eq!(payloads[1], &Payload::OpenChat);
        assert_eq!(payloads[2], &Payload::chat("tokio"));
        assert_eq!(payloads[3], &Payload::chat("tokio async runtime internals"));
        assert_eq!(payloads[4], &Payload::chat("Tokio is an async runtime."));
        assert_eq!(payloads[5], &Payload::chat("Goodbye!"));
        assert_eq!(payloads[6], &Payload::EndSession);
        assert!(ids_strictly_increase(&messages));
        assert!(!messages[2].is_system);

        assert_eq!(
            harness.checkpoints(),
            vec!["expand", "search", "goodbye", "null"]
        );
        let session = harness.storage.session(session_id).unwrap();
        assert!(!session.is_open);
        assert_eq!(session.system_state, json!({ "type": "null" }));

        let sent = harness.transport.sent_payloads();
        assert_eq!(sent[0], json!({ "type": "connected" }));
        assert_eq!(sent[1], json!({ "type": "session_created", "id": session_id }));
        assert_eq!(harness.transport.closed().map(|(code, _)| code), Some(1000));
    }

    #[tokio::test]
    async fn test_user_reply_persisted_then_expand_runs() {
        let harness = TestLoop::new();
        harness.reply("hi");
        harness
            .generator
            .queue_error(LlmError::server_error("upstream unavailable"));

        // Expand reads the reply, then the generator fails
        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        let session_id = outcome.session_id.unwrap();
        assert_eq!(outcome.exit, ExitReason::TransitionFailed);
        assert_eq!(outcome.disposal, Disposal::Closed);

        let messages = harness.storage.messages(session_id);
        assert_eq!(messages.len(), 3);
        // Greeting and prompt take ids 1 and 2, so the reply is 3
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(messages[0].is_system);
        assert_eq!(messages[1].payload, Payload::OpenChat);
        assert_eq!(messages[2].payload, Payload::chat("hi"));
        assert!(!messages[2].is_system);
        assert!(messages[2].id > messages[1].id);

        let calls = harness.generator.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("hi"));

        // Checkpoint precedes the payloads it belongs to
        let log = harness.storage.calls();
        let update = log
            .iter()
            .position(|c| matches!(c, StoreCall::UpdateState { tag, .. } if tag == "expand"))
            .unwrap();
        let append = log
            .iter()
            .position(|c| matches!(c, StoreCall::Append { is_system: true, .. }))
            .unwrap();
        assert!(update < append);
    }

    #[tokio::test]
    async fn test_reply_is_echoed_with_stored_id() {
        let harness = TestLoop::new();
        harness.reply("hi");

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        let stored = harness.storage.messages(outcome.session_id.unwrap());

        let echoed = harness
            .transport
            .sent()
            .into_iter()
            .find(|e| e["isSystem"] == json!(false))
            .unwrap();
        assert_eq!(echoed["id"], json!(stored[2].id));
        assert_eq!(echoed["payload"], json!({ "type": "message", "message": "hi" }));
    }

    #[tokio::test]
    async fn test_open_session_is_duplicated() {
        let harness = TestLoop::new();
        let original = harness
            .storage
            .insert_session("u1", "T", json!({ "type": "expand" }), true);
        harness.storage.seed_messages(
            original,
            vec![Payload::chat("Hello!"), Payload::OpenChat],
            true,
        );
        harness.reply("hi");

        let outcome = harness.run(original).await.unwrap();
        let copy_id = outcome.session_id.unwrap();
        assert_ne!(copy_id, original);
        assert_eq!(outcome.disposal, Disposal::Closed);

        let copy = harness.storage.session(copy_id).unwrap();
        assert_eq!(copy.title, "T 1");
        assert!(!copy.is_open);
        let copied = harness.storage.messages(copy_id);
        assert_eq!(copied.len(), 3);
        assert_eq!(copied[2].payload, Payload::chat("hi"));

        // The original is left exactly as it was
        let untouched = harness.storage.session(original).unwrap();
        assert!(untouched.is_open);
        assert_eq!(harness.storage.messages(original).len(), 2);
        let calls = harness.storage.calls();
        assert!(calls.contains(&StoreCall::Duplicate {
            from: original,
            to: copy_id
        }));
        assert!(!calls.contains(&StoreCall::Open(original)));
        assert!(calls.contains(&StoreCall::Open(copy_id)));
    }

    #[tokio::test]
    async fn test_repeated_duplication_increments_suffix() {
        let harness = TestLoop::new();
        let original = harness
            .storage
            .insert_session("u1", "T", json!({ "type": "null" }), true);
        harness
            .storage
            .seed_messages(original, vec![Payload::chat("q")], false);

        let mut titles = Vec::new();
        for _ in 0..3 {
            let outcome = harness.run(original).await.unwrap();
            let copy = harness.storage.session(outcome.session_id.unwrap()).unwrap();
            assert_eq!(harness.storage.messages(copy.id).len(), 1);
            titles.push(copy.title);
        }
        assert_eq!(titles, vec!["T 1", "T 2", "T 3"]);
    }

    #[tokio::test]
    async fn test_session_without_reply_is_deleted() {
        let harness = TestLoop::new();

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        let session_id = outcome.session_id.unwrap();
        assert_eq!(outcome.exit, ExitReason::ClientClosed);
        assert_eq!(outcome.disposal, Disposal::Deleted);
        assert!(harness.storage.session(session_id).is_none());
        assert!(harness.storage.messages(session_id).is_empty());
    }

    #[tokio::test]
    async fn test_resume_replays_history_and_closes() {
        let harness = TestLoop::new();
        let id = harness
            .storage
            .insert_session("u1", "T", json!({ "type": "goodbye" }), false);
        harness
            .storage
            .seed_messages(id, vec![Payload::chat("Hello!"), Payload::OpenChat], true);
        harness
            .storage
            .seed_messages(id, vec![Payload::chat("hi")], false);

        let outcome = harness.run(id).await.unwrap();
        assert_eq!(outcome.session_id, Some(id));
        assert_eq!(outcome.exit, ExitReason::Finished);
        assert_eq!(outcome.disposal, Disposal::Closed);

        let sent = harness.transport.sent_payloads();
        // connected, then the three stored messages oldest first
        assert_eq!(sent[1], Payload::chat("Hello!").to_value());
        assert_eq!(sent[2], Payload::OpenChat.to_value());
        assert_eq!(sent[3], Payload::chat("hi").to_value());
        assert_eq!(sent[4], Payload::chat("Goodbye!").to_value());
        assert!(!harness.storage.session(id).unwrap().is_open);
    }

    #[tokio::test]
    async fn test_bogus_frame_does_not_advance_state() {
        let harness = TestLoop::new();
        harness.transport.push_frame(json!({ "type": "bogus" }));

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        assert_eq!(outcome.exit, ExitReason::ProtocolViolation);
        assert_eq!(harness.checkpoints(), vec!["expand"]);
        assert!(!harness
            .storage
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::Append { is_system: false, .. })));

        let error = harness.transport.sent_payloads().pop().unwrap();
        assert_eq!(error["type"], json!("error"));
        assert_eq!(error["code"], json!(400));
        assert_eq!(outcome.disposal, Disposal::Deleted);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_a_protocol_violation() {
        let harness = TestLoop::new();
        harness
            .transport
            .push_error(TransportError::Malformed("binary frame".to_string()));

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        assert_eq!(outcome.exit, ExitReason::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_foreign_session_is_unauthorized() {
        let harness = TestLoop::new();
        let id = harness
            .storage
            .insert_session("someone-else", "T", json!({ "type": "start" }), false);

        let err = harness.run(id).await.unwrap_err();
        assert!(matches!(err, LoopError::Unauthorized { session_id } if session_id == id));

        let error = harness.transport.sent_payloads().pop().unwrap();
        assert_eq!(error["code"], json!(401));
        assert_eq!(harness.transport.closed().map(|(code, _)| code), Some(1008));
        assert!(!harness.storage.session(id).unwrap().is_open);
        assert_eq!(harness.storage.calls(), vec![StoreCall::Get(id)]);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let harness = TestLoop::new();
        let err = harness.run(999).await.unwrap_err();
        assert!(matches!(err, LoopError::SessionNotFound(999)));
        assert_eq!(harness.transport.closed().map(|(code, _)| code), Some(1011));
    }

    #[tokio::test]
    async fn test_unregistered_state_fails_before_any_write() {
        let harness = TestLoop::new();
        let id = harness
            .storage
            .insert_session("u1", "T", json!({ "type": "mystery" }), true);

        let err = harness.run(id).await.unwrap_err();
        assert!(matches!(err, LoopError::StateResolution(_)));
        assert_eq!(harness.storage.calls(), vec![StoreCall::Get(id)]);
        assert_eq!(harness.transport.sent_payloads().pop().unwrap()["code"], json!(500));
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_and_tears_down() {
        let harness = TestLoop::new();
        harness.storage.fail_on("append");

        let err = harness.run(NEW_SESSION_ID).await.unwrap_err();
        assert!(matches!(err, LoopError::Storage(_)));

        let calls = harness.storage.calls();
        assert!(calls.iter().any(|c| matches!(c, StoreCall::Delete(_))));
        let error = harness.transport.sent_payloads().pop().unwrap();
        assert_eq!(error["type"], json!("error"));
        assert_eq!(error["code"], json!(500));
    }

    #[tokio::test]
    async fn test_request_inside_transition_is_ephemeral() {
        let harness = TestLoop::new().with_registry(echo_registry());
        harness.reply("ping");

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        assert_eq!(outcome.exit, ExitReason::Finished);

        let sent = harness.transport.sent();
        let ephemeral: Vec<&Value> = sent.iter().filter(|e| e["id"] == json!(EPHEMERAL_ID)).collect();
        assert!(ephemeral
            .iter()
            .any(|e| e["payload"] == Payload::OpenChat.to_value() && e["isSystem"] == json!(true)));
        assert!(ephemeral
            .iter()
            .any(|e| e["payload"] == Payload::chat("ping").to_value() && e["isSystem"] == json!(false)));

        // Only the transition's own payload is stored, so nobody "replied"
        assert_eq!(outcome.disposal, Disposal::Deleted);
    }

    #[tokio::test]
    async fn test_close_during_transition_skips_checkpoint() {
        let harness = TestLoop::new().with_registry(echo_registry());

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        assert_eq!(outcome.exit, ExitReason::ClientClosed);
        assert!(harness.checkpoints().is_empty());
        assert_eq!(outcome.disposal, Disposal::Deleted);
    }

    #[tokio::test]
    async fn test_null_state_ends_within_one_iteration() {
        let harness = TestLoop::new();
        let id = harness
            .storage
            .insert_session("u1", "T", json!({ "type": "null" }), false);
        harness
            .storage
            .seed_messages(id, vec![Payload::chat("hi")], false);

        let outcome = harness.run(id).await.unwrap();
        assert_eq!(outcome.exit, ExitReason::Finished);
        assert_eq!(outcome.disposal, Disposal::Closed);
        assert!(harness.checkpoints().is_empty());
        assert!(!harness
            .storage
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::Append { .. })));
    }

    #[tokio::test]
    async fn test_reply_mid_batch_precedes_rest_of_batch() {
        let mut registry = StateRegistry::new("ask");
        registry.register("ask", AskThenTalkState);
        let harness = TestLoop::new().with_registry(registry);
        harness.reply("hi");

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        let session_id = outcome.session_id.unwrap();
        assert_eq!(outcome.exit, ExitReason::Finished);

        let sent = harness.transport.sent_payloads();
        assert_eq!(
            sent[2..],
            [
                Payload::OpenChat.to_value(),
                Payload::chat("hi").to_value(),
                Payload::chat("after").to_value(),
            ]
        );

        // The batch is one store call, so the reply takes the next id
        let stored: Vec<Payload> = harness
            .storage
            .messages(session_id)
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(
            stored,
            vec![Payload::OpenChat, Payload::chat("after"), Payload::chat("hi")]
        );
    }

    #[tokio::test]
    async fn test_unregistered_next_state_is_never_checkpointed() {
        let mut registry = StateRegistry::new("haunted");
        registry.register("haunted", GhostState);
        let harness = TestLoop::new().with_registry(registry);
        let id = harness
            .storage
            .insert_session("u1", "T", json!({ "type": "haunted" }), false);
        harness
            .storage
            .seed_messages(id, vec![Payload::chat("hi")], false);

        let err = harness.run(id).await.unwrap_err();
        assert!(matches!(
            err,
            LoopError::StateResolution(StateError::Unregistered(ref tag)) if tag == "ghost"
        ));
        assert!(harness.checkpoints().is_empty());
        assert!(!harness
            .storage
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::Append { .. })));
        assert_eq!(harness.transport.sent_payloads().pop().unwrap()["code"], json!(500));

        // The session keeps its last good state and can be resumed
        let session = harness.storage.session(id).unwrap();
        assert_eq!(session.system_state, json!({ "type": "haunted" }));
        assert!(!session.is_open);
        assert_eq!(harness.storage.messages(id).len(), 1);
    }

    #[tokio::test]
    async fn test_client_gone_before_handshake() {
        let harness = TestLoop::new();
        let mut transport = harness.transport.clone();
        transport.close(1001, "gone").await;

        let outcome = harness.run(NEW_SESSION_ID).await.unwrap();
        assert_eq!(outcome.session_id, None);
        assert_eq!(outcome.disposal, Disposal::Untouched);
        assert!(harness.storage.calls().is_empty());
    }
}
