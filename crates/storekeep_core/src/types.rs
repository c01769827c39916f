//! Options and descriptors for collections and indexes.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storekeep_engine::{CollectionMeta, CollectionParams, IndexParams, KeyPath};

/// Options for creating a collection.
///
/// Deserializes from the JSON shape `{"keyPath": ..., "autoIncrement": ...}`;
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionOptions {
    /// Key path selecting in-line keys. `None` means keys are supplied
    /// with each record or generated.
    pub key_path: Option<String>,
    /// Whether the engine generates integer keys.
    pub auto_increment: bool,
}

impl CollectionOptions {
    /// Options for out-of-line keys without a key generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key path.
    #[must_use]
    pub fn key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Sets whether keys are generated.
    #[must_use]
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Checks the options without touching any store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an invalid key path, or for the
    /// empty key path combined with a key generator.
    pub fn validate(&self) -> StoreResult<()> {
        if let Some(key_path) = &self.key_path {
            if !KeyPath::is_valid(key_path) {
                return Err(StoreError::validation(format!(
                    "invalid key path {key_path:?}"
                )));
            }
            if key_path.is_empty() && self.auto_increment {
                return Err(StoreError::validation(
                    "auto-increment collections need a non-empty key path",
                ));
            }
        }
        Ok(())
    }
}

impl TryFrom<&Value> for CollectionOptions {
    type Error = StoreError;

    fn try_from(value: &Value) -> StoreResult<Self> {
        let options: Self = parse_options(value)?;
        options.validate()?;
        Ok(options)
    }
}

impl From<&CollectionOptions> for CollectionParams {
    fn from(options: &CollectionOptions) -> Self {
        Self {
            key_path: options.key_path.clone(),
            auto_increment: options.auto_increment,
        }
    }
}

/// Options for creating an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexOptions {
    /// Whether index keys must be unique.
    pub unique: bool,
    /// Whether array values contribute one index key per element.
    pub multi_entry: bool,
}

impl IndexOptions {
    /// Options for a non-unique, single-entry index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets uniqueness.
    #[must_use]
    pub const fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    /// Sets the multi-entry flag.
    #[must_use]
    pub const fn multi_entry(mut self, value: bool) -> Self {
        self.multi_entry = value;
        self
    }
}

impl TryFrom<&Value> for IndexOptions {
    type Error = StoreError;

    fn try_from(value: &Value) -> StoreResult<Self> {
        parse_options(value)
    }
}

impl From<IndexOptions> for IndexParams {
    fn from(options: IndexOptions) -> Self {
        Self {
            unique: options.unique,
            multi_entry: options.multi_entry,
        }
    }
}

/// `null` means all defaults; anything else must be an object of known
/// field types.
fn parse_options<T>(value: &Value) -> StoreResult<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match value {
        Value::Null => Ok(T::default()),
        Value::Object(_) => serde_json::from_value(value.clone())
            .map_err(|e| StoreError::validation(format!("invalid options: {e}"))),
        other => Err(StoreError::validation(format!(
            "options must be an object, got {other}"
        ))),
    }
}

/// Checks a collection or index name.
pub(crate) fn validate_name(kind: &str, name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::validation(format!("{kind} name must not be empty")));
    }
    Ok(())
}

/// Schema description of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Collection name.
    pub name: String,
    /// Key path, if keys are in-line.
    pub key_path: Option<String>,
    /// Whether keys are generated.
    pub auto_increment: bool,
    /// Index names, sorted.
    pub index_names: Vec<String>,
}

impl From<CollectionMeta> for CollectionInfo {
    fn from(meta: CollectionMeta) -> Self {
        Self {
            name: meta.name,
            key_path: meta.key_path,
            auto_increment: meta.auto_increment,
            index_names: meta.index_names,
        }
    }
}
