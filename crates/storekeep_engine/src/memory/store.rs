//! Store and collection state for the in-memory engine.

use crate::engine::{CollectionMeta, IndexMeta, Record};
use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyRange};
use crate::key_path::KeyPath;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

/// First key handed out by an auto-increment collection.
const FIRST_GENERATED_KEY: i64 = 1;

/// One named store.
pub(crate) struct StoreState {
    pub(crate) name: String,
    /// 0 until the first upgrade commits.
    pub(crate) version: Cell<u64>,
    pub(crate) collections: RefCell<BTreeMap<String, CollectionData>>,
    /// Number of open connections.
    pub(crate) connections: Cell<usize>,
}

impl StoreState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: Cell::new(0),
            collections: RefCell::new(BTreeMap::new()),
            connections: Cell::new(0),
        }
    }

    pub(crate) fn describe(&self, collection: &str) -> EngineResult<CollectionMeta> {
        self.collections
            .borrow()
            .get(collection)
            .map(|data| data.meta(collection))
            .ok_or_else(|| missing_collection(collection))
    }

    pub(crate) fn describe_index(&self, collection: &str, index: &str) -> EngineResult<IndexMeta> {
        let collections = self.collections.borrow();
        let data = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;
        data.index_meta(collection, index)
    }
}

pub(crate) fn missing_collection(name: &str) -> EngineError {
    EngineError::not_found(format!("no collection named {name:?}"))
}

/// Definition of one secondary index.
#[derive(Debug, Clone)]
pub(crate) struct IndexDef {
    pub(crate) key_path: KeyPath,
    pub(crate) unique: bool,
    pub(crate) multi_entry: bool,
}

impl IndexDef {
    fn keys_of(&self, record: &Record) -> Vec<Key> {
        self.key_path.extract_index_keys(record, self.multi_entry)
    }

    /// Returns true if any two records share an index key.
    pub(crate) fn has_duplicates(&self, records: &BTreeMap<Key, Record>) -> bool {
        let mut seen = BTreeSet::new();
        records
            .values()
            .flat_map(|record| self.keys_of(record))
            .any(|key| !seen.insert(key))
    }
}

/// Schema and contents of one collection.
#[derive(Debug, Clone)]
pub(crate) struct CollectionData {
    pub(crate) key_path: Option<KeyPath>,
    pub(crate) auto_increment: bool,
    pub(crate) indexes: BTreeMap<String, IndexDef>,
    pub(crate) records: BTreeMap<Key, Record>,
    pub(crate) next_key: i64,
}

impl CollectionData {
    pub(crate) fn new(key_path: Option<KeyPath>, auto_increment: bool) -> Self {
        Self {
            key_path,
            auto_increment,
            indexes: BTreeMap::new(),
            records: BTreeMap::new(),
            next_key: FIRST_GENERATED_KEY,
        }
    }

    pub(crate) fn meta(&self, name: &str) -> CollectionMeta {
        CollectionMeta {
            name: name.to_string(),
            key_path: self.key_path.as_ref().map(|p| p.as_str().to_string()),
            auto_increment: self.auto_increment,
            index_names: self.indexes.keys().cloned().collect(),
        }
    }

    pub(crate) fn index_meta(&self, collection: &str, index: &str) -> EngineResult<IndexMeta> {
        let def = self.indexes.get(index).ok_or_else(|| {
            EngineError::not_found(format!(
                "no index named {index:?} on collection {collection:?}"
            ))
        })?;
        Ok(IndexMeta {
            name: index.to_string(),
            collection: collection.to_string(),
            key_path: def.key_path.as_str().to_string(),
            unique: def.unique,
            multi_entry: def.multi_entry,
        })
    }

    /// Inserts a record, returning its key and the key generator value
    /// before the insert (for rollback).
    pub(crate) fn insert(
        &mut self,
        mut value: Record,
        explicit: Option<Key>,
    ) -> EngineResult<(Key, i64)> {
        let previous_next_key = self.next_key;

        let key = match &self.key_path {
            Some(path) => {
                if explicit.is_some() {
                    return Err(EngineError::data(
                        "a key was supplied for a collection with in-line keys",
                    ));
                }
                match path.extract(&value) {
                    Some(key) => key,
                    None if self.auto_increment => {
                        let key = Key::Int(self.next_key);
                        path.inject(&mut value, &key)?;
                        key
                    }
                    None => {
                        return Err(EngineError::data(format!(
                            "record has no valid key at key path {path}"
                        )))
                    }
                }
            }
            None => match explicit {
                Some(key) => key,
                None if self.auto_increment => Key::Int(self.next_key),
                None => return Err(EngineError::data("no key supplied for out-of-line keys")),
            },
        };

        if self.records.contains_key(&key) {
            return Err(EngineError::constraint(format!("key {key} already exists")));
        }

        for (name, def) in self.indexes.iter().filter(|(_, def)| def.unique) {
            let new_keys = def.keys_of(&value);
            let clash = self
                .records
                .values()
                .any(|existing| def.keys_of(existing).iter().any(|k| new_keys.contains(k)));
            if clash {
                return Err(EngineError::constraint(format!(
                    "unique index {name:?} already contains this value"
                )));
            }
        }

        if self.auto_increment {
            if let Key::Int(n) = key {
                if n >= self.next_key {
                    self.next_key = n.saturating_add(1);
                }
            }
        }

        self.records.insert(key.clone(), value);
        Ok((key, previous_next_key))
    }

    /// Removes every record in `range`, returning the removed entries.
    pub(crate) fn remove_range(&mut self, range: &KeyRange) -> Vec<(Key, Record)> {
        if range.is_empty() {
            return Vec::new();
        }
        let keys: Vec<Key> = self
            .records
            .range::<Key, _>(range.as_bounds())
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| self.records.remove(&k).map(|v| (k, v)))
            .collect()
    }

    /// Clones the entries in `range`, ascending.
    pub(crate) fn entries(&self, range: Option<&KeyRange>) -> Vec<(Key, Record)> {
        match range {
            Some(range) if range.is_empty() => Vec::new(),
            Some(range) => self
                .records
                .range::<Key, _>(range.as_bounds())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => self
                .records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auto_increment_generates_and_injects() {
        let mut data = CollectionData::new(Some(KeyPath::parse("id").unwrap()), true);
        let (key, _) = data.insert(json!({"a": 1}), None).unwrap();
        assert_eq!(key, Key::Int(1));
        assert_eq!(data.records[&key], json!({"a": 1, "id": 1}));

        let (key, _) = data.insert(json!({"id": 10}), None).unwrap();
        assert_eq!(key, Key::Int(10));
        let (key, _) = data.insert(json!({"b": 2}), None).unwrap();
        assert_eq!(key, Key::Int(11));
    }

    #[test]
    fn duplicate_key_is_constraint_error() {
        let mut data = CollectionData::new(None, false);
        data.insert(json!(1), Some(Key::from("k"))).unwrap();
        let err = data.insert(json!(2), Some(Key::from("k"))).unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn unique_index_rejects_clash() {
        let mut data = CollectionData::new(None, true);
        data.indexes.insert(
            "by_email".into(),
            IndexDef {
                key_path: KeyPath::parse("email").unwrap(),
                unique: true,
                multi_entry: false,
            },
        );
        data.insert(json!({"email": "a@x"}), None).unwrap();
        let err = data.insert(json!({"email": "a@x"}), None).unwrap_err();
        assert!(err.is_constraint());
        data.insert(json!({"email": "b@x"}), None).unwrap();
    }

    #[test]
    fn out_of_line_without_key_is_data_error() {
        let mut data = CollectionData::new(None, false);
        assert!(data.insert(json!({}), None).is_err());
    }
}
