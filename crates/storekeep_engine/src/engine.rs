//! The callback contract every storage engine implements.
//!
//! The contract follows the event model of browser IndexedDB: an open
//! request may deliver an upgrade callback before its terminal event,
//! transactions report `complete`, `abort` or `error`, and every request
//! inside a transaction reports its own success or failure first.
//!
//! # Invariants
//!
//! - An open listener sees at most one [`OpenEvent::UpgradeNeeded`], always
//!   before the terminal event, and exactly one terminal event
//!   ([`OpenEvent::Success`], [`OpenEvent::Blocked`] or [`OpenEvent::Error`]).
//! - A transaction listener is called exactly once.
//! - Within a transaction every request callback fires before the
//!   transaction listener.
//! - Callbacks may fire inside the call that registered them, or later.
//!   Callers must not hold borrows that a callback needs across these calls.

use crate::error::{EngineError, EngineResult};
use crate::key::{Direction, Key, KeyRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::rc::Rc;

/// A stored record.
pub type Record = Value;

/// Parameters for creating a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionParams {
    /// Key path selecting in-line keys, if any.
    pub key_path: Option<String>,
    /// Whether the engine generates integer keys.
    pub auto_increment: bool,
}

/// Parameters for creating an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    /// Whether index keys must be unique across records.
    pub unique: bool,
    /// Whether array values contribute one index key per element.
    pub multi_entry: bool,
}

/// Schema description of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    /// Collection name.
    pub name: String,
    /// Key path, if keys are in-line.
    pub key_path: Option<String>,
    /// Whether keys are generated.
    pub auto_increment: bool,
    /// Names of the collection's indexes, sorted.
    pub index_names: Vec<String>,
}

/// Schema description of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Index name.
    pub name: String,
    /// Owning collection.
    pub collection: String,
    /// Key path evaluated against each record.
    pub key_path: String,
    /// Uniqueness constraint.
    pub unique: bool,
    /// Multi-entry flag.
    pub multi_entry: bool,
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Reads only.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// Events delivered to an open listener.
pub enum OpenEvent<'a> {
    /// The requested version is above the stored version. Schema changes
    /// may only be made through `schema`, and only while handling this event.
    UpgradeNeeded {
        /// Version before the upgrade (0 for a new store).
        old_version: u64,
        /// Version being upgraded to.
        new_version: u64,
        /// The upgrade transaction.
        schema: &'a mut dyn SchemaTransaction,
    },
    /// The store is open.
    Success(Rc<dyn DatabaseHandle>),
    /// Other open connections prevent the version change.
    Blocked {
        /// Version the store is currently at.
        current_version: u64,
    },
    /// The open failed.
    Error(EngineError),
}

/// Listener for an open request.
pub type OpenListener = Box<dyn FnMut(OpenEvent<'_>)>;

/// Terminal events of a store deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteEvent {
    /// The store was deleted (or did not exist).
    Success,
    /// Open connections prevent the deletion.
    Blocked,
    /// The deletion failed.
    Error(EngineError),
}

/// Listener for a delete request.
pub type DeleteListener = Box<dyn FnOnce(DeleteEvent)>;

/// Terminal events of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// All requests committed.
    Complete,
    /// The transaction was aborted explicitly or by the engine.
    Abort(EngineError),
    /// A failed request doomed the transaction; it was rolled back.
    Error(EngineError),
}

/// Listener for a transaction's terminal event.
pub type TransactionListener = Box<dyn FnOnce(TransactionEvent)>;

/// Callback for a single request.
pub type RequestCallback<T> = Box<dyn FnOnce(EngineResult<T>)>;

/// One entry visited by a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorEntry {
    /// Primary key.
    pub key: Key,
    /// Stored record.
    pub value: Record,
}

/// What a cursor callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    /// Advance to the next entry.
    Continue,
    /// Stop iterating.
    Stop,
}

/// Cursor callback: receives each entry, then `Ok(None)` at the end.
pub type CursorCallback = Box<dyn FnMut(EngineResult<Option<CursorEntry>>) -> CursorStep>;

/// A storage engine: the factory for store connections.
pub trait Engine {
    /// Opens `name` at `version`, or at its current version when `None`
    /// (a new store is created at version 1).
    fn open(&self, name: &str, version: Option<u64>, listener: OpenListener);

    /// Deletes the store `name`.
    fn delete_store(&self, name: &str, listener: DeleteListener);
}

/// The upgrade transaction handed out with [`OpenEvent::UpgradeNeeded`].
pub trait SchemaTransaction {
    /// Creates a collection. Fails with a constraint error if it exists.
    fn create_collection(
        &mut self,
        name: &str,
        params: &CollectionParams,
    ) -> EngineResult<CollectionMeta>;

    /// Describes an existing collection.
    fn collection(&self, name: &str) -> EngineResult<CollectionMeta>;

    /// Creates an index. Fails with a constraint error if it exists.
    fn create_index(
        &mut self,
        collection: &str,
        name: &str,
        key_path: &str,
        params: &IndexParams,
    ) -> EngineResult<IndexMeta>;

    /// Describes an existing index.
    fn index(&self, collection: &str, name: &str) -> EngineResult<IndexMeta>;

    /// Aborts the upgrade. The open then fails with an abort error.
    fn abort(&mut self);
}

/// An open connection to a store.
pub trait DatabaseHandle {
    /// Store name.
    fn name(&self) -> String;

    /// Version this connection was opened at.
    fn version(&self) -> u64;

    /// Collection names, sorted.
    fn collection_names(&self) -> Vec<String>;

    /// Describes a collection.
    fn describe(&self, collection: &str) -> EngineResult<CollectionMeta>;

    /// Describes an index.
    fn describe_index(&self, collection: &str, index: &str) -> EngineResult<IndexMeta>;

    /// Starts a transaction over `collections`.
    fn transaction(
        &self,
        collections: &[&str],
        mode: TransactionMode,
        listener: TransactionListener,
    ) -> EngineResult<Box<dyn TransactionHandle>>;

    /// Closes the connection. Idempotent.
    fn close(&self);

    /// Returns true once the connection is closed.
    fn is_closed(&self) -> bool;
}

/// A running transaction.
pub trait TransactionHandle {
    /// Request access to one collection in the transaction's scope.
    fn collection(&self, name: &str) -> EngineResult<Box<dyn CollectionRequests>>;

    /// Ends the request phase; the transaction commits once its requests
    /// are done. Dropping the handle has the same effect.
    fn commit(&self);

    /// Rolls the transaction back.
    fn abort(&self);
}

/// Requests against one collection inside a transaction.
pub trait CollectionRequests {
    /// Inserts a record. Fails with a constraint error if the key exists.
    fn add(&self, value: Record, key: Option<Key>, callback: RequestCallback<Key>);

    /// Reads one record.
    fn get(&self, key: &Key, callback: RequestCallback<Option<Record>>);

    /// Deletes every record in `range`.
    fn delete(&self, range: &KeyRange, callback: RequestCallback<()>);

    /// Deletes every record.
    fn clear(&self, callback: RequestCallback<()>);

    /// Iterates records in `range` (all records when `None`).
    fn open_cursor(&self, range: Option<&KeyRange>, direction: Direction, callback: CursorCallback);
}
