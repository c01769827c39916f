//! Key paths: selectors that pick a key out of a record.

use crate::error::{EngineError, EngineResult};
use crate::key::Key;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A parsed key path.
///
/// A key path is either empty (the record itself is the key) or a sequence
/// of identifiers separated by dots, such as `"address.city"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPath {
    raw: String,
}

impl KeyPath {
    /// Parses and validates a key path.
    ///
    /// # Errors
    ///
    /// Returns a data error if any segment is not a valid identifier.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        if !Self::is_valid(raw) {
            return Err(EngineError::data(format!("invalid key path: {raw:?}")));
        }
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    /// Returns true if `raw` is a syntactically valid key path.
    #[must_use]
    pub fn is_valid(raw: &str) -> bool {
        raw.is_empty() || raw.split('.').all(is_identifier)
    }

    /// Returns the path as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if this is the empty path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split('.').filter(|s| !s.is_empty())
    }

    /// Resolves the path against a record, returning the selected value.
    #[must_use]
    pub fn resolve<'v>(&self, value: &'v Value) -> Option<&'v Value> {
        self.segments()
            .try_fold(value, |current, segment| current.as_object()?.get(segment))
    }

    /// Extracts a key from a record.
    #[must_use]
    pub fn extract(&self, value: &Value) -> Option<Key> {
        self.resolve(value).and_then(Key::from_value)
    }

    /// Extracts index keys from a record.
    ///
    /// With `multi_entry`, an array value contributes one key per valid
    /// element (duplicates removed). Otherwise the selected value must itself
    /// be a valid key.
    #[must_use]
    pub fn extract_index_keys(&self, value: &Value, multi_entry: bool) -> Vec<Key> {
        match self.resolve(value) {
            Some(Value::Array(items)) if multi_entry => {
                let mut keys: Vec<Key> = items.iter().filter_map(Key::from_value).collect();
                keys.sort();
                keys.dedup();
                keys
            }
            Some(selected) => Key::from_value(selected).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Writes `key` into the record at this path, creating intermediate
    /// objects as needed.
    ///
    /// # Errors
    ///
    /// Returns a data error if the path is empty or crosses a non-object
    /// value.
    pub fn inject(&self, value: &mut Value, key: &Key) -> EngineResult<()> {
        let segments: Vec<&str> = self.segments().collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(EngineError::data("cannot inject a key at the empty key path"));
        };

        let mut current = value;
        for segment in parents {
            let object = current.as_object_mut().ok_or_else(|| {
                EngineError::data(format!("key path {:?} crosses a non-object", self.raw))
            })?;
            current = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        let object = current.as_object_mut().ok_or_else(|| {
            EngineError::data(format!("key path {:?} crosses a non-object", self.raw))
        })?;
        object.insert(last.to_string(), key.to_value());
        Ok(())
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for KeyPath {
    type Error = EngineError;

    fn try_from(raw: String) -> EngineResult<Self> {
        Self::parse(&raw)
    }
}

impl From<KeyPath> for String {
    fn from(path: KeyPath) -> Self {
        path.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn validates_identifiers() {
        assert!(KeyPath::is_valid(""));
        assert!(KeyPath::is_valid("id"));
        assert!(KeyPath::is_valid("key.path"));
        assert!(KeyPath::is_valid("$meta._id2"));
        assert!(!KeyPath::is_valid("1abc"));
        assert!(!KeyPath::is_valid("a..b"));
        assert!(!KeyPath::is_valid("a.b."));
        assert!(!KeyPath::is_valid("a-b"));
        assert!(KeyPath::parse("-1").is_err());
    }

    #[test]
    fn extracts_nested_keys() {
        let path = KeyPath::parse("key.path").unwrap();
        let record = json!({"key": {"path": "abc"}});
        assert_eq!(path.extract(&record), Some(Key::from("abc")));
        assert_eq!(path.extract(&json!({"key": 1})), None);
    }

    #[test]
    fn empty_path_selects_record() {
        let path = KeyPath::parse("").unwrap();
        assert_eq!(path.extract(&json!(42)), Some(Key::Int(42)));
    }

    #[test]
    fn multi_entry_keys() {
        let path = KeyPath::parse("tags").unwrap();
        let record = json!({"tags": ["b", "a", "b", 3, null]});
        assert_eq!(
            path.extract_index_keys(&record, true),
            vec![Key::Int(3), Key::from("a"), Key::from("b")]
        );
        assert!(path.extract_index_keys(&record, false).is_empty());
    }

    #[test]
    fn inject_creates_parents() {
        let path = KeyPath::parse("meta.id").unwrap();
        let mut record = json!({"name": "x"});
        path.inject(&mut record, &Key::Int(5)).unwrap();
        assert_eq!(record, json!({"name": "x", "meta": {"id": 5}}));

        let mut scalar = json!(3);
        assert!(path.inject(&mut scalar, &Key::Int(1)).is_err());
    }

    proptest! {
        #[test]
        fn dotted_identifiers_are_valid(segments in prop::collection::vec("[a-zA-Z_][a-zA-Z0-9_]{0,8}", 1..4)) {
            let raw = segments.join(".");
            prop_assert!(KeyPath::is_valid(&raw));
        }
    }
}
