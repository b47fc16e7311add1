//! Property-based test generators using proptest.

use datasync_protocol::{Update, UpdateType};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for dataset ids.
pub fn dataset_id_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

/// Strategy for flat JSON records with a few scalar fields.
pub fn record_strategy() -> impl Strategy<Value = Value> {
    let scalar = prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ];
    prop::collection::btree_map("[a-z]{1,8}", scalar, 1..6)
        .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
}

/// Strategy for update types.
pub fn update_type_strategy() -> impl Strategy<Value = UpdateType> {
    prop_oneof![
        Just(UpdateType::Applied),
        Just(UpdateType::Failed),
        Just(UpdateType::Collision),
        Just(UpdateType::Create),
        Just(UpdateType::Update),
        Just(UpdateType::Delete),
    ]
}

/// Strategy for updates addressed to one client connection.
pub fn update_strategy() -> impl Strategy<Value = Update> {
    ("[a-f0-9]{8}", update_type_strategy(), "[a-z0-9]{4}")
        .prop_map(|(hash, update_type, uid)| Update::new("ds", "c1", hash, update_type, uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn records_are_objects(record in record_strategy()) {
            prop_assert!(record.as_object().is_some_and(|o| !o.is_empty()));
        }

        #[test]
        fn updates_address_one_connection(update in update_strategy()) {
            prop_assert_eq!(update.cuid.as_str(), "c1");
            prop_assert_eq!(update.hash.len(), 8);
        }
    }
}
