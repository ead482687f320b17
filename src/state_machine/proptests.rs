//! Property-based tests for state persistence and the terminal state

use super::*;
use crate::db::UserProfile;
use crate::runtime::testing::{MockTextGenerator, RecordingInteraction};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn arb_field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-zA-Z0-9 ?]{0,24}".prop_map(Value::from),
    ]
}

fn arb_fields() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z][a-z_]{0,8}", arb_field_value(), 0..4).prop_map(
        |entries| {
            entries
                .into_iter()
                .filter(|(key, _)| key != "type")
                .collect()
        },
    )
}

fn arb_registered_tag() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just(START_TAG),
        Just(EXPAND_TAG),
        Just(SEARCH_TAG),
        Just(GOODBYE_TAG),
        Just(NULL_TAG),
    ]
}

fn arb_state() -> impl Strategy<Value = SystemState> {
    (arb_registered_tag(), arb_fields()).prop_map(|(tag, fields)| {
        fields
            .into_iter()
            .fold(SystemState::new(tag), |state, (key, value)| {
                state.with_field(key, value)
            })
    })
}

proptest! {
    #[test]
    fn prop_registered_states_survive_storage(state in arb_state()) {
        let registry = default_registry();
        let stored = serde_json::to_string(&state).unwrap();
        let raw: Value = serde_json::from_str(&stored).unwrap();
        let restored = registry.instantiate(&raw).unwrap();
        prop_assert_eq!(restored, state);
    }

    #[test]
    fn prop_unregistered_tags_are_rejected(tag in "[a-z]{4,12}", fields in arb_fields()) {
        let registry = default_registry();
        prop_assume!(!registry.is_registered(&tag));
        let mut object = fields;
        object.insert("type".to_string(), Value::String(tag.clone()));
        let result = registry.instantiate(&Value::Object(object));
        prop_assert_eq!(result, Err(StateError::Unregistered(tag)));
    }

    #[test]
    fn prop_null_is_absorbing(fields in arb_fields()) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let registry = default_registry();
        let state = fields
            .into_iter()
            .fold(SystemState::null(), |state, (key, value)| state.with_field(key, value));

        let transition = runtime.block_on(async {
            let user = UserProfile::unregistered("u1");
            let generator = MockTextGenerator::new();
            let mut io = RecordingInteraction::default();
            let mut ctx = StateContext {
                user: &user,
                history: &[],
                generator: &generator,
                io: &mut io,
            };
            registry.execute(&state, &mut ctx).await.unwrap()
        });

        prop_assert!(transition.next.is_null());
        prop_assert!(transition.payloads.is_empty());
    }
}
