//! In-memory transactions and requests.
//!
//! Write requests are applied to the live collections as they arrive and
//! recorded in an undo log; an abort replays the log backwards. Commit only
//! decides between keeping the changes and rolling them back.

use crate::engine::{
    CollectionRequests, CursorCallback, CursorEntry, CursorStep, Record, RequestCallback,
    TransactionEvent, TransactionHandle, TransactionListener, TransactionMode,
};
use crate::error::{EngineError, EngineErrorKind, EngineResult};
use crate::key::{Direction, Key, KeyRange};
use crate::memory::store::{missing_collection, StoreState};
use crate::memory::{EngineState, Fault};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::trace;

/// Undo log entry.
enum Undo {
    Inserted {
        collection: String,
        key: Key,
        previous_next_key: i64,
    },
    Removed {
        collection: String,
        entries: Vec<(Key, Record)>,
    },
    Cleared {
        collection: String,
        records: BTreeMap<Key, Record>,
    },
}

pub(crate) struct TransactionState {
    engine: Rc<EngineState>,
    store: Rc<StoreState>,
    scope: Vec<String>,
    mode: TransactionMode,
    committing: Cell<bool>,
    finished: Cell<bool>,
    doomed: RefCell<Option<EngineError>>,
    undo: RefCell<Vec<Undo>>,
    listener: RefCell<Option<TransactionListener>>,
}

impl TransactionState {
    fn is_active(&self) -> bool {
        !self.committing.get() && !self.finished.get()
    }

    fn inactive_error(&self) -> EngineError {
        EngineError::new(
            EngineErrorKind::TransactionInactive,
            "transaction has finished",
        )
    }

    fn doom(&self, err: &EngineError) {
        let mut doomed = self.doomed.borrow_mut();
        if doomed.is_none() {
            *doomed = Some(err.clone());
        }
    }

    fn rollback(&self) {
        let undo = std::mem::take(&mut *self.undo.borrow_mut());
        let mut collections = self.store.collections.borrow_mut();
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Inserted {
                    collection,
                    key,
                    previous_next_key,
                } => {
                    if let Some(data) = collections.get_mut(&collection) {
                        data.records.remove(&key);
                        data.next_key = previous_next_key;
                    }
                }
                Undo::Removed {
                    collection,
                    entries,
                } => {
                    if let Some(data) = collections.get_mut(&collection) {
                        data.records.extend(entries);
                    }
                }
                Undo::Cleared {
                    collection,
                    records,
                } => {
                    if let Some(data) = collections.get_mut(&collection) {
                        data.records = records;
                    }
                }
            }
        }
    }

    /// Delivers the terminal event. Runs at most once.
    pub(crate) fn finish(&self, forced: Option<EngineError>) {
        if self.finished.replace(true) {
            return;
        }

        let injected = self
            .engine
            .take_fault(|f| matches!(f, Fault::AbortNextCommit(_)))
            .and_then(|f| match f {
                Fault::AbortNextCommit(kind) => Some(kind),
                _ => None,
            });

        let doomed = self.doomed.borrow_mut().take();
        let event = if let Some(err) = forced {
            self.rollback();
            TransactionEvent::Abort(err)
        } else if let Some(err) = doomed {
            self.rollback();
            TransactionEvent::Error(err)
        } else if let Some(kind) = injected {
            self.rollback();
            TransactionEvent::Abort(EngineError::new(kind, "commit failed"))
        } else {
            self.undo.borrow_mut().clear();
            TransactionEvent::Complete
        };

        self.engine.record_finish(&event);
        trace!(store = %self.store.name, scope = ?self.scope, event = ?event, "transaction finished");

        let listener = self.listener.borrow_mut().take();
        if let Some(listener) = listener {
            listener(event);
        }
    }
}

/// A transaction handle.
pub(crate) struct MemoryTransaction {
    state: Rc<TransactionState>,
}

impl MemoryTransaction {
    pub(crate) fn new(
        engine: Rc<EngineState>,
        store: Rc<StoreState>,
        scope: Vec<String>,
        mode: TransactionMode,
        listener: TransactionListener,
    ) -> Self {
        Self {
            state: Rc::new(TransactionState {
                engine,
                store,
                scope,
                mode,
                committing: Cell::new(false),
                finished: Cell::new(false),
                doomed: RefCell::new(None),
                undo: RefCell::new(Vec::new()),
                listener: RefCell::new(Some(listener)),
            }),
        }
    }
}

impl TransactionHandle for MemoryTransaction {
    fn collection(&self, name: &str) -> EngineResult<Box<dyn CollectionRequests>> {
        if !self.state.scope.iter().any(|s| s == name) {
            return Err(EngineError::not_found(format!(
                "collection {name:?} is not in the transaction scope"
            )));
        }
        Ok(Box::new(MemoryRequests {
            state: Rc::clone(&self.state),
            collection: name.to_string(),
        }))
    }

    fn commit(&self) {
        if !self.state.is_active() {
            return;
        }
        self.state.committing.set(true);
        let state = Rc::clone(&self.state);
        self.state.engine.deliver(move || state.finish(None));
    }

    fn abort(&self) {
        if self.state.finished.get() {
            return;
        }
        self.state
            .finish(Some(EngineError::abort("transaction aborted by caller")));
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.commit();
    }
}

struct MemoryRequests {
    state: Rc<TransactionState>,
    collection: String,
}

impl MemoryRequests {
    fn check_readable(&self) -> EngineResult<()> {
        if !self.state.is_active() {
            return Err(self.state.inactive_error());
        }
        Ok(())
    }

    fn check_writable(&self) -> EngineResult<()> {
        self.check_readable()?;
        if self.state.mode == TransactionMode::ReadOnly {
            return Err(EngineError::new(
                EngineErrorKind::ReadOnly,
                "write request in a read-only transaction",
            ));
        }
        Ok(())
    }

    /// Runs a write against the collection. A failed write dooms the
    /// transaction.
    fn write<T>(
        &self,
        op: impl FnOnce(&mut crate::memory::store::CollectionData) -> EngineResult<(T, Undo)>,
    ) -> EngineResult<T> {
        self.check_writable()?;
        let result = {
            let mut collections = self.state.store.collections.borrow_mut();
            match collections.get_mut(&self.collection) {
                Some(data) => op(data),
                None => Err(missing_collection(&self.collection)),
            }
        };
        match result {
            Ok((value, undo)) => {
                self.state.undo.borrow_mut().push(undo);
                Ok(value)
            }
            Err(err) => {
                self.state.doom(&err);
                Err(err)
            }
        }
    }
}

impl CollectionRequests for MemoryRequests {
    fn add(&self, value: Record, key: Option<Key>, callback: RequestCallback<Key>) {
        let collection = self.collection.clone();
        let result = self.write(|data| {
            let (key, previous_next_key) = data.insert(value, key)?;
            let undo = Undo::Inserted {
                collection,
                key: key.clone(),
                previous_next_key,
            };
            Ok((key, undo))
        });
        callback(result);
    }

    fn get(&self, key: &Key, callback: RequestCallback<Option<Record>>) {
        let result = self.check_readable().and_then(|()| {
            let collections = self.state.store.collections.borrow();
            collections
                .get(&self.collection)
                .map(|data| data.records.get(key).cloned())
                .ok_or_else(|| missing_collection(&self.collection))
        });
        callback(result);
    }

    fn delete(&self, range: &KeyRange, callback: RequestCallback<()>) {
        let collection = self.collection.clone();
        let result = self.write(|data| {
            let entries = data.remove_range(range);
            Ok((
                (),
                Undo::Removed {
                    collection,
                    entries,
                },
            ))
        });
        callback(result);
    }

    fn clear(&self, callback: RequestCallback<()>) {
        let collection = self.collection.clone();
        let result = self.write(|data| {
            let records = std::mem::take(&mut data.records);
            Ok((
                (),
                Undo::Cleared {
                    collection,
                    records,
                },
            ))
        });
        callback(result);
    }

    fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        direction: Direction,
        mut callback: CursorCallback,
    ) {
        let snapshot = self.check_readable().and_then(|()| {
            let collections = self.state.store.collections.borrow();
            collections
                .get(&self.collection)
                .map(|data| data.entries(range))
                .ok_or_else(|| missing_collection(&self.collection))
        });

        let mut entries = match snapshot {
            Ok(entries) => entries,
            Err(err) => {
                callback(Err(err));
                return;
            }
        };
        if direction == Direction::Prev {
            entries.reverse();
        }

        for (key, value) in entries {
            if callback(Ok(Some(CursorEntry { key, value }))) == CursorStep::Stop {
                return;
            }
        }
        callback(Ok(None));
    }
}
