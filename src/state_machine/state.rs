//! System state values

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Tag of the absorbing terminal state
pub const NULL_TAG: &str = "null";

/// Errors resolving a persisted state
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("system state must be a JSON object")]
    NotAnObject,
    #[error("system state is missing its type tag")]
    MissingTag,
    #[error("unregistered system state: {0}")]
    Unregistered(String),
}

/// Position in the conversation flow: a type tag plus the fields its
/// transition needs.
///
/// Equality compares the tag as well as the fields, so two states with
/// overlapping fields but different tags are never equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct SystemState {
    tag: String,
    fields: Map<String, Value>,
}

impl SystemState {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            fields: Map::new(),
        }
    }

    /// The absorbing terminal state
    pub fn null() -> Self {
        Self::new(NULL_TAG)
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_null(&self) -> bool {
        self.tag == NULL_TAG
    }

    /// Flat wire form: `{"type": tag, ...fields}`
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("type".to_string(), Value::String(self.tag.clone()));
        Value::Object(object)
    }

    /// Parse the flat wire form. Registration is checked by the registry.
    pub fn from_value(value: &Value) -> Result<Self, StateError> {
        let object = value.as_object().ok_or(StateError::NotAnObject)?;
        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(StateError::MissingTag)?
            .to_string();
        let fields = object
            .iter()
            .filter(|(key, _)| key.as_str() != "type")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Self { tag, fields })
    }
}

impl TryFrom<Value> for SystemState {
    type Error = StateError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        SystemState::from_value(&value)
    }
}

impl From<SystemState> for Value {
    fn from(state: SystemState) -> Self {
        state.to_value()
    }
}
