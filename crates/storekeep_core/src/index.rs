//! Index descriptors.

use crate::types::IndexOptions;
use serde::{Deserialize, Serialize};
use storekeep_engine::IndexMeta;

/// A secondary index on a collection.
///
/// Indexes are created through [`Collection::create_index`](crate::Collection::create_index),
/// which runs a version upgrade. The descriptor is read back from the
/// engine after the upgrade, so it always reflects what the store holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    name: String,
    collection: String,
    key_path: String,
    unique: bool,
    multi_entry: bool,
}

impl Index {
    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the indexed collection.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Key path evaluated against each record.
    #[must_use]
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// Whether index keys are unique.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Whether arrays contribute one key per element.
    #[must_use]
    pub fn is_multi_entry(&self) -> bool {
        self.multi_entry
    }

    /// The options this index was created with.
    #[must_use]
    pub fn options(&self) -> IndexOptions {
        IndexOptions::new()
            .unique(self.unique)
            .multi_entry(self.multi_entry)
    }
}

impl From<IndexMeta> for Index {
    fn from(meta: IndexMeta) -> Self {
        Self {
            name: meta.name,
            collection: meta.collection,
            key_path: meta.key_path,
            unique: meta.unique,
            multi_entry: meta.multi_entry,
        }
    }
}
