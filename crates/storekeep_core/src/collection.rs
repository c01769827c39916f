//! Collections and their record operations.
//!
//! Every record operation is one engine transaction against the owning
//! connection's live handle, and resolves when the transaction commits,
//! not when the individual request succeeds. A request that succeeds in a
//! transaction that later aborts rejects the caller's future. Committed
//! operations are published on the connection's event feed.

use crate::completion::{completion, Completion};
use crate::connection::{Connection, ConnectionInner};
use crate::error::{ErrorContext, Phase, StoreError, StoreResult};
use crate::events::{StoreEvent, StoreEventKind};
use crate::index::Index;
use crate::types::{CollectionInfo, IndexOptions};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};
use storekeep_engine::{
    CollectionMeta, CollectionRequests, CursorCallback, CursorStep, Direction, Key, KeyRange,
    Record, RequestCallback, TransactionEvent, TransactionMode,
};
use tracing::trace;

/// A named collection of keyed records.
///
/// Cloning a `Collection` yields another reference to the same collection.
/// A collection does not hold an engine handle of its own; it is usable for
/// as long as its connection is open.
#[derive(Clone)]
pub struct Collection {
    state: Rc<CollectionState>,
}

struct CollectionState {
    store: String,
    name: String,
    key_path: Option<String>,
    auto_increment: bool,
    index_names: RefCell<BTreeSet<String>>,
    connection: Weak<ConnectionInner>,
}

/// Collects the result of a single request until the transaction settles.
struct Request<T> {
    slot: Rc<RefCell<Option<T>>>,
    done: Completion<T>,
    context: ErrorContext,
}

impl<T: 'static> Request<T> {
    /// A request callback that stores the mapped value, or rejects at once
    /// on error.
    fn callback<U: 'static>(self, map: impl FnOnce(U) -> T + 'static) -> RequestCallback<U> {
        Box::new(move |result| match result {
            Ok(value) => *self.slot.borrow_mut() = Some(map(value)),
            Err(err) => self.done.reject(self.context.classify(err)),
        })
    }
}

impl Request<Vec<Record>> {
    /// A cursor callback that collects every visited record.
    fn collect(self) -> CursorCallback {
        let mut records = Vec::new();
        Box::new(move |step| match step {
            Ok(Some(entry)) => {
                records.push(entry.value);
                CursorStep::Continue
            }
            Ok(None) => {
                *self.slot.borrow_mut() = Some(std::mem::take(&mut records));
                CursorStep::Stop
            }
            Err(err) => {
                self.done.reject(self.context.classify(err));
                CursorStep::Stop
            }
        })
    }
}

impl Collection {
    pub(crate) fn new(store: &str, meta: CollectionMeta, connection: Weak<ConnectionInner>) -> Self {
        Self {
            state: Rc::new(CollectionState {
                store: store.to_string(),
                name: meta.name,
                key_path: meta.key_path,
                auto_increment: meta.auto_increment,
                index_names: RefCell::new(meta.index_names.into_iter().collect()),
                connection,
            }),
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Key path for in-line keys.
    #[must_use]
    pub fn key_path(&self) -> Option<&str> {
        self.state.key_path.as_deref()
    }

    /// Whether the engine generates keys.
    #[must_use]
    pub fn auto_increment(&self) -> bool {
        self.state.auto_increment
    }

    /// Names of the collection's indexes, sorted.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.state.index_names.borrow().iter().cloned().collect()
    }

    /// Schema description.
    #[must_use]
    pub fn info(&self) -> CollectionInfo {
        CollectionInfo {
            name: self.state.name.clone(),
            key_path: self.state.key_path.clone(),
            auto_increment: self.state.auto_increment,
            index_names: self.index_names(),
        }
    }

    /// Returns true if both values refer to the same collection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn refresh(&self, meta: &CollectionMeta) {
        *self.state.index_names.borrow_mut() = meta.index_names.iter().cloned().collect();
    }

    fn connection(&self) -> StoreResult<Rc<ConnectionInner>> {
        self.state
            .connection
            .upgrade()
            .filter(|c| !c.is_closed())
            .ok_or_else(|| StoreError::connection_closed(&self.state.store))
    }

    /// Reads an index descriptor from the live handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IndexNotFound`] if the index does not exist.
    pub async fn index(&self, name: &str) -> StoreResult<Index> {
        let handle = self.connection()?.live_handle().await?;
        handle
            .describe_index(&self.state.name, name)
            .map(Index::from)
            .map_err(|_| StoreError::IndexNotFound {
                collection: self.state.name.clone(),
                index: name.to_string(),
            })
    }

    /// Creates an index through the owning connection's upgrade protocol.
    ///
    /// # Errors
    ///
    /// See [`Connection::create_index`].
    pub async fn create_index(
        &self,
        name: &str,
        key_path: &str,
        options: IndexOptions,
    ) -> StoreResult<Index> {
        let connection = Connection::from_inner(self.connection()?);
        connection
            .create_index(&self.state.name, name, key_path, options)
            .await
    }

    /// Runs one transaction over this collection and waits for it to settle.
    /// On commit, publishes a `kind` event keyed by `key_of` the result.
    async fn execute<T: 'static>(
        &self,
        mode: TransactionMode,
        operation: &'static str,
        kind: StoreEventKind,
        key_of: impl FnOnce(&T) -> Option<Key> + 'static,
        submit: impl FnOnce(&dyn CollectionRequests, Request<T>),
    ) -> StoreResult<T> {
        let phase = match mode {
            TransactionMode::ReadOnly => Phase::RecordRead,
            TransactionMode::ReadWrite => Phase::RecordWrite,
        };
        let context = ErrorContext::new(&self.state.store, &self.state.name, phase);
        let handle = self.connection()?.live_handle().await?;

        let (done, pending) = completion::<T>(operation);
        let slot: Rc<RefCell<Option<T>>> = Rc::default();

        let listener = {
            let done = done.clone();
            let slot = Rc::clone(&slot);
            let context = context.clone();
            let connection = Weak::clone(&self.state.connection);
            let store = self.state.store.clone();
            let collection = self.state.name.clone();
            Box::new(move |event: TransactionEvent| match event {
                TransactionEvent::Complete => {
                    let value = slot.borrow_mut().take();
                    match value {
                        Some(value) => {
                            if let Some(connection) = connection.upgrade() {
                                let mut event =
                                    StoreEvent::new(kind, store).with_collection(collection);
                                if let Some(key) = key_of(&value) {
                                    event = event.with_key(key);
                                }
                                connection.record_event(event);
                            }
                            done.resolve(value);
                        }
                        None => done.reject(StoreError::interrupted(operation)),
                    }
                }
                TransactionEvent::Abort(err) | TransactionEvent::Error(err) => {
                    done.reject(context.classify(err));
                }
            })
        };

        let txn = handle
            .transaction(&[self.state.name.as_str()], mode, listener)
            .map_err(|e| context.classify(e))?;
        let requests = match txn.collection(&self.state.name) {
            Ok(requests) => requests,
            Err(err) => {
                txn.abort();
                return Err(context.classify(err));
            }
        };

        trace!(store = %self.state.store, collection = %self.state.name, operation, "submitting request");
        submit(
            &*requests,
            Request {
                slot,
                done,
                context,
            },
        );
        txn.commit();
        drop(requests);
        drop(txn);

        pending.wait().await
    }

    /// Adds a record and resolves with its key once the write commits.
    ///
    /// Pass `key` only for collections without a key path. Collections with
    /// a key path read the key from the record, or generate and inject one
    /// when they auto-increment.
    ///
    /// # Errors
    ///
    /// - [`StoreError::MissingKey`] if no key can be determined (no
    ///   transaction is opened)
    /// - [`StoreError::Validation`] if a key is passed for in-line keys
    /// - [`StoreError::Constraint`] for a duplicate key or unique index value
    /// - [`StoreError::TransactionAborted`] if the transaction aborts
    pub async fn add(&self, record: Record, key: Option<Key>) -> StoreResult<Key> {
        match (&self.state.key_path, &key) {
            (Some(key_path), Some(_)) => {
                return Err(StoreError::validation(format!(
                    "collection {} uses the key path {key_path:?}; keys cannot be supplied",
                    self.state.name
                )));
            }
            (None, None) if !self.state.auto_increment => {
                return Err(StoreError::MissingKey {
                    collection: self.state.name.clone(),
                });
            }
            _ => {}
        }

        self.execute(
            TransactionMode::ReadWrite,
            "add",
            StoreEventKind::RecordAdded,
            |key: &Key| Some(key.clone()),
            move |requests, request| {
                requests.add(record, key, request.callback(|key| key));
            },
        )
        .await
    }

    /// Reads one record; `None` if there is no record under `key`.
    pub async fn get(&self, key: impl Into<Key>) -> StoreResult<Option<Record>> {
        let key = key.into();
        let read = key.clone();
        self.execute(
            TransactionMode::ReadOnly,
            "get",
            StoreEventKind::RecordRead,
            move |_| Some(read),
            move |requests, request| {
                requests.get(&key, request.callback(|record| record));
            },
        )
        .await
    }

    /// Returns every record in ascending key order.
    pub async fn all(&self) -> StoreResult<Vec<Record>> {
        self.execute(
            TransactionMode::ReadOnly,
            "all",
            StoreEventKind::Scanned,
            |_| None,
            |requests, request| {
                requests.open_cursor(None, Direction::Next, request.collect());
            },
        )
        .await
    }

    /// Returns the records whose string keys start with `term`, in
    /// descending key order.
    pub async fn find_by_prefix(&self, term: &str) -> StoreResult<Vec<Record>> {
        self.scan(KeyRange::prefix(term), Direction::Prev).await
    }

    /// Returns the records in `range`, walking in `direction`.
    pub async fn scan(&self, range: KeyRange, direction: Direction) -> StoreResult<Vec<Record>> {
        self.execute(
            TransactionMode::ReadOnly,
            "scan",
            StoreEventKind::Scanned,
            |_| None,
            move |requests, request| {
                requests.open_cursor(Some(&range), direction, request.collect());
            },
        )
        .await
    }

    /// Deletes the record under `key`. Resolves on commit whether or not
    /// the record existed.
    pub async fn remove(&self, key: impl Into<Key>) -> StoreResult<()> {
        let key = key.into();
        let range = KeyRange::only(key.clone());
        self.execute(
            TransactionMode::ReadWrite,
            "remove",
            StoreEventKind::RecordRemoved,
            move |_| Some(key),
            move |requests, request| {
                requests.delete(&range, request.callback(|()| ()));
            },
        )
        .await
    }

    /// Deletes every record.
    pub async fn clear(&self) -> StoreResult<()> {
        self.execute(
            TransactionMode::ReadWrite,
            "clear",
            StoreEventKind::Cleared,
            |_| None,
            |requests, request| {
                requests.clear(request.callback(|()| ()));
            },
        )
        .await
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("store", &self.state.store)
            .field("name", &self.state.name)
            .field("key_path", &self.state.key_path)
            .field("auto_increment", &self.state.auto_increment)
            .field("index_names", &self.index_names())
            .finish()
    }
}
