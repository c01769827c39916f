//! Property tests: collections behave like an ordered map.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use storekeep_core::{CollectionOptions, Key, StoreError};
use storekeep_testkit::{
    collection_name_strategy, operation_sequence_strategy, prefix_term_strategy, ready,
    record_strategy, text_key_strategy, PropTestConfig, RecordOperation, TestStore,
};

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest())]

    #[test]
    fn operations_match_an_ordered_map(ops in operation_sequence_strategy(1, 40)) {
        let store = TestStore::memory();
        let db = ready(store.open("model")).unwrap();
        let records = ready(db.create_collection("records", CollectionOptions::new())).unwrap();
        let mut model: BTreeMap<String, Value> = BTreeMap::new();

        for op in ops {
            match op {
                RecordOperation::Add { key, record } => {
                    let result = ready(records.add(record.clone(), Some(Key::from(key.as_str()))));
                    if model.contains_key(&key) {
                        let is_constraint = matches!(result, Err(StoreError::Constraint { .. }));
                        prop_assert!(is_constraint);
                    } else {
                        prop_assert_eq!(result.unwrap(), Key::from(key.as_str()));
                        model.insert(key, record);
                    }
                }
                RecordOperation::Remove { key } => {
                    ready(records.remove(key.as_str())).unwrap();
                    model.remove(&key);
                }
                RecordOperation::Get { key } => {
                    let found = ready(records.get(key.as_str())).unwrap();
                    prop_assert_eq!(found.as_ref(), model.get(&key));
                }
                RecordOperation::Clear => {
                    ready(records.clear()).unwrap();
                    model.clear();
                }
            }
        }

        let all = ready(records.all()).unwrap();
        let expected: Vec<Value> = model.values().cloned().collect();
        prop_assert_eq!(all, expected);
    }

    #[test]
    fn prefix_results_are_the_matching_keys_descending(
        keys in prop::collection::btree_set(text_key_strategy(), 0..20),
        term in prefix_term_strategy(),
    ) {
        let store = TestStore::memory();
        let db = ready(store.open("prefix")).unwrap();
        let words = ready(db.create_collection("words", CollectionOptions::new())).unwrap();
        for key in &keys {
            ready(words.add(json!({"key": key}), Some(Key::from(key.as_str())))).unwrap();
        }

        let found: Vec<String> = ready(words.find_by_prefix(&term))
            .unwrap()
            .into_iter()
            .filter_map(|r| r["key"].as_str().map(str::to_string))
            .collect();
        let expected: Vec<String> = keys
            .iter()
            .rev()
            .filter(|k| k.starts_with(&term))
            .cloned()
            .collect();
        prop_assert_eq!(found, expected);
    }

    #[test]
    fn creating_a_collection_twice_bumps_once(name in collection_name_strategy()) {
        let store = TestStore::memory();
        let db = ready(store.open("schema")).unwrap();

        let first = ready(db.create_collection(&name, CollectionOptions::new())).unwrap();
        let second = ready(db.create_collection(&name, CollectionOptions::new())).unwrap();
        prop_assert!(first.ptr_eq(&second));
        prop_assert_eq!(db.version(), 2);
    }

    #[test]
    fn auto_increment_round_trips(records in prop::collection::vec(record_strategy(), 1..10)) {
        let store = TestStore::memory();
        let db = ready(store.open("auto")).unwrap();
        let items = ready(db.create_collection(
            "items",
            CollectionOptions::new().auto_increment(true),
        ))
        .unwrap();

        let mut previous: Option<Key> = None;
        for record in records {
            let key = ready(items.add(record.clone(), None)).unwrap();
            if let Some(previous) = &previous {
                prop_assert!(*previous < key);
            }
            prop_assert_eq!(ready(items.get(key.clone())).unwrap(), Some(record));
            previous = Some(key);
        }
    }
}
