//! The in-memory upgrade transaction.

use crate::engine::{CollectionMeta, CollectionParams, IndexMeta, IndexParams, SchemaTransaction};
use crate::error::{EngineError, EngineResult};
use crate::key_path::KeyPath;
use crate::memory::store::{missing_collection, CollectionData, IndexDef};
use std::collections::BTreeMap;

/// Works on a copy of the store's collections; the copy replaces the
/// original only if the upgrade finishes without failure.
pub(crate) struct UpgradeTransaction {
    collections: BTreeMap<String, CollectionData>,
    failure: Option<EngineError>,
}

impl UpgradeTransaction {
    pub(crate) fn new(collections: BTreeMap<String, CollectionData>) -> Self {
        Self {
            collections,
            failure: None,
        }
    }

    /// The error that doomed this upgrade, if any.
    pub(crate) fn failure(&self) -> Option<&EngineError> {
        self.failure.as_ref()
    }

    pub(crate) fn into_collections(self) -> BTreeMap<String, CollectionData> {
        self.collections
    }

    fn ensure_active(&self) -> EngineResult<()> {
        match &self.failure {
            Some(_) => Err(EngineError::new(
                crate::error::EngineErrorKind::TransactionInactive,
                "upgrade transaction already aborted",
            )),
            None => Ok(()),
        }
    }
}

impl SchemaTransaction for UpgradeTransaction {
    fn create_collection(
        &mut self,
        name: &str,
        params: &CollectionParams,
    ) -> EngineResult<CollectionMeta> {
        self.ensure_active()?;
        if self.collections.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "collection {name:?} already exists"
            )));
        }
        let key_path = params.key_path.as_deref().map(KeyPath::parse).transpose()?;
        if params.auto_increment && key_path.as_ref().is_some_and(KeyPath::is_empty) {
            return Err(EngineError::data(
                "auto-increment collections cannot use the empty key path",
            ));
        }
        let data = CollectionData::new(key_path, params.auto_increment);
        let meta = data.meta(name);
        self.collections.insert(name.to_string(), data);
        Ok(meta)
    }

    fn collection(&self, name: &str) -> EngineResult<CollectionMeta> {
        self.collections
            .get(name)
            .map(|data| data.meta(name))
            .ok_or_else(|| missing_collection(name))
    }

    fn create_index(
        &mut self,
        collection: &str,
        name: &str,
        key_path: &str,
        params: &IndexParams,
    ) -> EngineResult<IndexMeta> {
        self.ensure_active()?;
        let data = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        if data.indexes.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "index {name:?} already exists on collection {collection:?}"
            )));
        }
        let def = IndexDef {
            key_path: KeyPath::parse(key_path)?,
            unique: params.unique,
            multi_entry: params.multi_entry,
        };
        // Existing data that violates the new uniqueness rule dooms the
        // upgrade, but creation itself still reports success.
        let violates = def.unique && def.has_duplicates(&data.records);
        data.indexes.insert(name.to_string(), def);
        let meta = data.index_meta(collection, name)?;
        if violates {
            self.failure = Some(EngineError::constraint(format!(
                "existing records violate unique index {name:?}"
            )));
        }
        Ok(meta)
    }

    fn index(&self, collection: &str, name: &str) -> EngineResult<IndexMeta> {
        self.collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?
            .index_meta(collection, name)
    }

    fn abort(&mut self) {
        if self.failure.is_none() {
            self.failure = Some(EngineError::abort("upgrade aborted"));
        }
    }
}
