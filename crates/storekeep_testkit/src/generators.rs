//! Property-based test generators using proptest.
//!
//! Provides strategies for names, keys, key paths and records that satisfy
//! the store's validation rules.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use storekeep_core::{CollectionOptions, IndexOptions, Key};

/// Strategy for generating valid store names.
pub fn store_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating valid collection and index names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_]{0,31}")
        .expect("Invalid regex")
        .prop_filter("Collection name must not be empty", |s| !s.is_empty())
}

/// Strategy for generating valid dotted key paths.
pub fn key_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop::string::string_regex("[a-z_][a-z0-9_]{0,7}").expect("Invalid regex"),
        1..4,
    )
    .prop_map(|segments| segments.join("."))
}

/// Strategy for generating text keys, including characters outside the
/// basic multilingual plane.
pub fn text_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-c\u{e9}\u{4e2d}\u{ffff}\u{10000}\u{1F600}\u{10FFFF}]{1,6}")
        .expect("Invalid regex")
}

/// Strategy for generating prefix search terms over the same alphabet as
/// [`text_key_strategy`].
pub fn prefix_term_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-c\u{ffff}\u{1F600}\u{10FFFF}]{0,2}").expect("Invalid regex")
}

/// Strategy for generating keys of every kind.
pub fn key_strategy() -> impl Strategy<Value = Key> {
    prop_oneof![
        any::<i64>().prop_map(Key::from),
        text_key_strategy().prop_map(Key::from),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Key::from),
    ]
}

/// Strategy for generating scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
    ]
}

/// Strategy for generating record objects with string keys.
pub fn record_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,10}", scalar_strategy(), 0..6)
        .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
}

/// Strategy for generating collection options that pass validation.
pub fn collection_options_strategy() -> impl Strategy<Value = CollectionOptions> {
    (prop::option::of(key_path_strategy()), any::<bool>()).prop_map(|(key_path, auto)| {
        let options = CollectionOptions::new().auto_increment(auto);
        match key_path {
            Some(path) => options.key_path(path),
            None => options,
        }
    })
}

/// Strategy for generating index options.
pub fn index_options_strategy() -> impl Strategy<Value = IndexOptions> {
    (any::<bool>(), any::<bool>())
        .prop_map(|(unique, multi)| IndexOptions::new().unique(unique).multi_entry(multi))
}

/// A record operation against a keyed collection.
#[derive(Debug, Clone)]
pub enum RecordOperation {
    /// Add a record under a key
    Add {
        /// Key
        key: String,
        /// Record
        record: Value,
    },
    /// Remove a key
    Remove {
        /// Key
        key: String,
    },
    /// Get a key
    Get {
        /// Key
        key: String,
    },
    /// Clear the collection
    Clear,
}

/// Strategy for generating record operations over a small key space, so
/// that operations collide.
pub fn record_operation_strategy() -> impl Strategy<Value = RecordOperation> {
    let key = || prop::string::string_regex("[a-c]{1,2}").expect("Invalid regex");
    prop_oneof![
        4 => (key(), record_strategy())
            .prop_map(|(key, record)| RecordOperation::Add { key, record }),
        2 => key().prop_map(|key| RecordOperation::Remove { key }),
        2 => key().prop_map(|key| RecordOperation::Get { key }),
        1 => Just(RecordOperation::Clear),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<RecordOperation>> {
    prop::collection::vec(record_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a quick configuration for CI.
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to a proptest configuration.
    pub fn to_proptest(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;
    use storekeep_engine::KeyPath;

    #[test]
    fn key_paths_are_valid() {
        let mut runner = TestRunner::default();
        for _ in 0..50 {
            let path = key_path_strategy()
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert!(KeyPath::is_valid(&path), "{path}");
        }
    }

    proptest! {
        #[test]
        fn generated_options_validate(options in collection_options_strategy()) {
            prop_assert!(options.validate().is_ok());
        }

        #[test]
        fn records_are_objects(record in record_strategy()) {
            prop_assert!(record.is_object());
        }
    }
}
