//! Connection handles for the in-memory engine.

use crate::engine::{
    CollectionMeta, DatabaseHandle, IndexMeta, TransactionHandle, TransactionListener,
    TransactionMode,
};
use crate::error::{EngineError, EngineResult};
use crate::memory::store::{missing_collection, StoreState};
use crate::memory::transaction::MemoryTransaction;
use crate::memory::EngineState;
use std::cell::Cell;
use std::rc::Rc;
use tracing::trace;

pub(crate) struct MemoryHandle {
    engine: Rc<EngineState>,
    store: Rc<StoreState>,
    version: u64,
    closed: Cell<bool>,
}

impl MemoryHandle {
    pub(crate) fn new(engine: Rc<EngineState>, store: Rc<StoreState>, version: u64) -> Self {
        Self {
            engine,
            store,
            version,
            closed: Cell::new(false),
        }
    }
}

impl DatabaseHandle for MemoryHandle {
    fn name(&self) -> String {
        self.store.name.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn collection_names(&self) -> Vec<String> {
        self.store.collections.borrow().keys().cloned().collect()
    }

    fn describe(&self, collection: &str) -> EngineResult<CollectionMeta> {
        self.store.describe(collection)
    }

    fn describe_index(&self, collection: &str, index: &str) -> EngineResult<IndexMeta> {
        self.store.describe_index(collection, index)
    }

    fn transaction(
        &self,
        collections: &[&str],
        mode: TransactionMode,
        listener: TransactionListener,
    ) -> EngineResult<Box<dyn TransactionHandle>> {
        if self.closed.get() {
            return Err(EngineError::invalid_state("the connection is closed"));
        }
        if collections.is_empty() {
            return Err(EngineError::invalid_state(
                "a transaction needs at least one collection",
            ));
        }
        {
            let existing = self.store.collections.borrow();
            if let Some(missing) = collections.iter().find(|c| !existing.contains_key(**c)) {
                return Err(missing_collection(missing));
            }
        }

        self.engine.record_transaction();
        let scope: Vec<String> = collections.iter().map(|c| (*c).to_string()).collect();
        trace!(store = %self.store.name, scope = ?scope, mode = ?mode, "transaction started");
        Ok(Box::new(MemoryTransaction::new(
            Rc::clone(&self.engine),
            Rc::clone(&self.store),
            scope,
            mode,
            listener,
        )))
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let open = self.store.connections.get();
        self.store.connections.set(open.saturating_sub(1));
        trace!(store = %self.store.name, version = self.version, "connection closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, OpenEvent};
    use crate::memory::MemoryEngine;
    use std::cell::RefCell;

    fn open(engine: &MemoryEngine) -> Rc<dyn DatabaseHandle> {
        let slot: Rc<RefCell<Option<Rc<dyn DatabaseHandle>>>> = Rc::default();
        let slot2 = Rc::clone(&slot);
        engine.open(
            "db",
            None,
            Box::new(move |event| {
                if let OpenEvent::Success(handle) = event {
                    *slot2.borrow_mut() = Some(handle);
                }
            }),
        );
        let handle = slot.borrow_mut().take();
        handle.unwrap()
    }

    #[test]
    fn closed_handle_refuses_transactions() {
        let engine = MemoryEngine::new();
        let handle = open(&engine);
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(engine.live_connections("db"), 0);
        assert!(handle
            .transaction(&["x"], TransactionMode::ReadOnly, Box::new(|_| {}))
            .is_err());
    }

    #[test]
    fn unknown_collection_is_not_found() {
        let engine = MemoryEngine::new();
        let handle = open(&engine);
        let err = handle
            .transaction(&["missing"], TransactionMode::ReadOnly, Box::new(|_| {}))
            .err()
            .unwrap();
        assert_eq!(err.kind, crate::error::EngineErrorKind::NotFound);
        assert_eq!(engine.stats().transactions, 0);
    }

    #[test]
    fn dropping_handle_releases_connection() {
        let engine = MemoryEngine::new();
        let handle = open(&engine);
        assert_eq!(engine.live_connections("db"), 1);
        drop(handle);
        assert_eq!(engine.live_connections("db"), 0);
    }
}
