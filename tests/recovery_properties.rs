//! Property tests for document recovery.
//!
//! Valid documents must come back unchanged however they are wrapped, and
//! recovering a recovered document must be a no-op.

use proptest::prelude::*;
use serde_json::{Map, Value};
use tokio_patch_pipeline::recover;
use tokio_patch_pipeline::recovery::repair::{RepairStage, AGGRESSIVE_REPAIRS, COMMON_REPAIRS};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-z ]{0,12}".prop_map(Value::String),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

fn document() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", value(), 1..5)
        .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn test_valid_document_round_trips(doc in document()) {
        let compact = doc.to_string();
        let recovered = recover(&compact).expect("test: recover compact");
        prop_assert_eq!(Value::Object(recovered.into_map()), doc);
    }

    #[test]
    fn test_repair_stages_leave_valid_json_alone(doc in document()) {
        let pretty = serde_json::to_string_pretty(&doc).expect("test: serialize");
        for stage in COMMON_REPAIRS.iter().chain(AGGRESSIVE_REPAIRS.iter()) {
            prop_assert_eq!(stage.apply(&pretty), pretty.clone(), "stage {} changed valid input", stage.name());
        }
    }

    #[test]
    fn test_fenced_document_with_trailing_comma_recovers(doc in document()) {
        let pretty = serde_json::to_string_pretty(&doc).expect("test: serialize");
        // Non-empty pretty objects end in "\n}".
        let damaged = format!("{},\n}}", &pretty[..pretty.len() - 2]);
        let raw = format!("Here is the plan:\n```json\n{damaged}\n```\nLet me know.");
        let recovered = recover(&raw).expect("test: recover damaged");
        prop_assert_eq!(Value::Object(recovered.into_map()), doc);
    }

    #[test]
    fn test_recovery_is_idempotent(doc in document()) {
        let first = recover(&doc.to_string()).expect("test: first recover");
        let second = recover(&first.to_canonical_string()).expect("test: second recover");
        prop_assert_eq!(first, second);
    }
}
