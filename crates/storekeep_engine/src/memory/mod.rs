//! In-memory reference engine.
//!
//! `MemoryEngine` implements the full callback contract against plain
//! collections held in memory. Nothing is persisted; dropping the last clone
//! of the engine discards every store.
//!
//! Two delivery modes are available. [`MemoryEngine::new`] delivers every
//! event inside the call that triggered it. [`MemoryEngine::deferred`]
//! yields to the `tokio` `LocalSet` before finishing opens, deletes and
//! commits, so concurrent callers interleave the way they would against an
//! event loop. Deferred mode must be used from inside a `LocalSet`.
//!
//! Faults can be queued with [`MemoryEngine::inject`] to exercise failure
//! paths that a healthy engine never takes.

mod connection;
mod store;
mod transaction;
mod upgrade;

use crate::engine::{DeleteEvent, DeleteListener, Engine, OpenEvent, OpenListener, TransactionEvent};
use crate::error::{EngineError, EngineErrorKind};
use connection::MemoryHandle;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use store::StoreState;
use tracing::{debug, trace};
use upgrade::UpgradeTransaction;

/// A failure to inject into the next matching engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The next open fails with an error of this kind.
    FailNextOpen(EngineErrorKind),
    /// The next version change raises the version without running the
    /// upgrade callback.
    SkipNextUpgrade,
    /// The next transaction to commit aborts with an error of this kind.
    AbortNextCommit(EngineErrorKind),
}

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Open requests received.
    pub opens: u64,
    /// Delete requests received.
    pub deletes: u64,
    /// Transactions started.
    pub transactions: u64,
    /// Transactions that ended without committing.
    pub aborted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Immediate,
    Deferred,
}

pub(crate) struct EngineState {
    stores: RefCell<BTreeMap<String, Rc<StoreState>>>,
    delivery: Delivery,
    faults: RefCell<VecDeque<Fault>>,
    stats: Cell<EngineStats>,
}

impl EngineState {
    fn new(delivery: Delivery) -> Self {
        Self {
            stores: RefCell::new(BTreeMap::new()),
            delivery,
            faults: RefCell::new(VecDeque::new()),
            stats: Cell::new(EngineStats::default()),
        }
    }

    /// Runs `f` now or on the local task set, depending on the delivery mode.
    pub(crate) fn deliver(&self, f: impl FnOnce() + 'static) {
        match self.delivery {
            Delivery::Immediate => f(),
            Delivery::Deferred => {
                tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    f();
                });
            }
        }
    }

    /// Removes and returns the first queued fault matching `pred`.
    pub(crate) fn take_fault(&self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = self.faults.borrow_mut();
        let position = faults.iter().position(pred)?;
        faults.remove(position)
    }

    fn update_stats(&self, f: impl FnOnce(&mut EngineStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    pub(crate) fn record_transaction(&self) {
        self.update_stats(|s| s.transactions += 1);
    }

    pub(crate) fn record_finish(&self, event: &TransactionEvent) {
        if *event != TransactionEvent::Complete {
            self.update_stats(|s| s.aborted += 1);
        }
    }

    fn store(&self, name: &str) -> Option<Rc<StoreState>> {
        self.stores.borrow().get(name).cloned()
    }

    /// Returns the named store, creating it at version 0 if needed. The flag
    /// is true if the store was created.
    fn store_or_create(&self, name: &str) -> (Rc<StoreState>, bool) {
        let mut stores = self.stores.borrow_mut();
        match stores.get(name) {
            Some(store) => (Rc::clone(store), false),
            None => {
                let store = Rc::new(StoreState::new(name));
                stores.insert(name.to_string(), Rc::clone(&store));
                (store, true)
            }
        }
    }

    fn discard(&self, name: &str) {
        self.stores.borrow_mut().remove(name);
    }
}

fn process_open(
    state: &Rc<EngineState>,
    name: &str,
    version: Option<u64>,
    mut listener: OpenListener,
) {
    state.update_stats(|s| s.opens += 1);

    if let Some(Fault::FailNextOpen(kind)) =
        state.take_fault(|f| matches!(f, Fault::FailNextOpen(_)))
    {
        debug!(store = name, kind = %kind, "injected open failure");
        listener(OpenEvent::Error(EngineError::new(kind, "open failed")));
        return;
    }

    if version == Some(0) {
        listener(OpenEvent::Error(EngineError::data("version must be at least 1")));
        return;
    }

    let (store, created) = state.store_or_create(name);
    let current = store.version.get();
    let target = version.unwrap_or_else(|| current.max(1));

    if target < current {
        listener(OpenEvent::Error(EngineError::version(format!(
            "requested version {target} is less than the existing version {current}"
        ))));
        return;
    }

    if target > current {
        if store.connections.get() > 0 {
            debug!(store = name, current, target, connections = store.connections.get(), "version change blocked");
            listener(OpenEvent::Blocked {
                current_version: current,
            });
            return;
        }

        if state
            .take_fault(|f| *f == Fault::SkipNextUpgrade)
            .is_some()
        {
            debug!(store = name, current, target, "injected upgrade skip");
        } else {
            let working = store.collections.borrow().clone();
            let mut upgrade = UpgradeTransaction::new(working);
            listener(OpenEvent::UpgradeNeeded {
                old_version: current,
                new_version: target,
                schema: &mut upgrade,
            });

            if let Some(failure) = upgrade.failure() {
                let err = EngineError::abort(format!(
                    "version change transaction aborted: {failure}"
                ));
                if created {
                    state.discard(name);
                }
                debug!(store = name, error = %err, "upgrade failed");
                listener(OpenEvent::Error(err));
                return;
            }
            *store.collections.borrow_mut() = upgrade.into_collections();
        }
        store.version.set(target);
    }

    store.connections.set(store.connections.get() + 1);
    trace!(store = name, version = target, "open succeeded");
    let handle = MemoryHandle::new(Rc::clone(state), store, target);
    listener(OpenEvent::Success(Rc::new(handle)));
}

fn process_delete(state: &EngineState, name: &str, listener: DeleteListener) {
    state.update_stats(|s| s.deletes += 1);

    let Some(store) = state.store(name) else {
        listener(DeleteEvent::Success);
        return;
    };
    if store.connections.get() > 0 {
        debug!(store = name, connections = store.connections.get(), "delete blocked");
        listener(DeleteEvent::Blocked);
        return;
    }
    state.discard(name);
    listener(DeleteEvent::Success);
}

/// An engine that keeps every store in memory.
#[derive(Clone)]
pub struct MemoryEngine {
    state: Rc<EngineState>,
}

impl MemoryEngine {
    /// Creates an engine that delivers events immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(EngineState::new(Delivery::Immediate)),
        }
    }

    /// Creates an engine that delivers opens, deletes and commits on the
    /// current `LocalSet`.
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            state: Rc::new(EngineState::new(Delivery::Deferred)),
        }
    }

    /// Queues a fault.
    pub fn inject(&self, fault: Fault) {
        self.state.faults.borrow_mut().push_back(fault);
    }

    /// Returns the operation counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.state.stats.get()
    }

    /// Returns the version of a store, or `None` if it does not exist.
    #[must_use]
    pub fn version_of(&self, name: &str) -> Option<u64> {
        self.state.store(name).map(|s| s.version.get())
    }

    /// Returns the number of open connections to a store.
    #[must_use]
    pub fn live_connections(&self, name: &str) -> usize {
        self.state.store(name).map_or(0, |s| s.connections.get())
    }

    /// Returns the names of all stores, sorted.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.state.stores.borrow().keys().cloned().collect()
    }

    /// Returns the number of records in a collection.
    #[must_use]
    pub fn record_count(&self, store: &str, collection: &str) -> Option<usize> {
        let store = self.state.store(store)?;
        let collections = store.collections.borrow();
        collections.get(collection).map(|c| c.records.len())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("delivery", &self.state.delivery)
            .field("stores", &self.store_names())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Engine for MemoryEngine {
    fn open(&self, name: &str, version: Option<u64>, listener: OpenListener) {
        let state = Rc::clone(&self.state);
        let name = name.to_string();
        self.state
            .deliver(move || process_open(&state, &name, version, listener));
    }

    fn delete_store(&self, name: &str, listener: DeleteListener) {
        let state = Rc::clone(&self.state);
        let name = name.to_string();
        self.state
            .deliver(move || process_delete(&state, &name, listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        CollectionParams, CursorStep, DatabaseHandle, IndexParams, TransactionMode,
    };
    use crate::key::{Direction, Key, KeyRange};
    use serde_json::json;

    type Outcome = Rc<RefCell<Vec<String>>>;

    fn open_with(
        engine: &MemoryEngine,
        name: &str,
        version: Option<u64>,
        mut on_upgrade: impl FnMut(&mut dyn crate::engine::SchemaTransaction) + 'static,
    ) -> (Outcome, Rc<RefCell<Option<Rc<dyn DatabaseHandle>>>>) {
        let log: Outcome = Rc::default();
        let handle: Rc<RefCell<Option<Rc<dyn DatabaseHandle>>>> = Rc::default();
        let (log2, handle2) = (Rc::clone(&log), Rc::clone(&handle));
        engine.open(
            name,
            version,
            Box::new(move |event| match event {
                OpenEvent::UpgradeNeeded {
                    old_version,
                    new_version,
                    schema,
                } => {
                    log2.borrow_mut()
                        .push(format!("upgrade {old_version}->{new_version}"));
                    on_upgrade(schema);
                }
                OpenEvent::Success(h) => {
                    log2.borrow_mut().push(format!("success {}", h.version()));
                    *handle2.borrow_mut() = Some(h);
                }
                OpenEvent::Blocked { current_version } => {
                    log2.borrow_mut().push(format!("blocked {current_version}"));
                }
                OpenEvent::Error(e) => log2.borrow_mut().push(format!("error {}", e.kind)),
            }),
        );
        (log, handle)
    }

    fn create_items(schema: &mut dyn crate::engine::SchemaTransaction) {
        schema
            .create_collection(
                "items",
                &CollectionParams {
                    key_path: None,
                    auto_increment: true,
                },
            )
            .unwrap();
    }

    #[test]
    fn new_store_upgrades_then_succeeds() {
        let engine = MemoryEngine::new();
        let (log, handle) = open_with(&engine, "db", None, create_items);
        assert_eq!(*log.borrow(), vec!["upgrade 0->1", "success 1"]);
        let handle = handle.borrow().clone().unwrap();
        assert_eq!(handle.collection_names(), vec!["items".to_string()]);
        assert_eq!(engine.live_connections("db"), 1);
        handle.close();
        assert_eq!(engine.live_connections("db"), 0);
    }

    #[test]
    fn lower_version_is_version_error() {
        let engine = MemoryEngine::new();
        let (_, handle) = open_with(&engine, "db", Some(3), |_| {});
        handle.borrow().clone().unwrap().close();
        let (log, _) = open_with(&engine, "db", Some(1), |_| {});
        assert_eq!(*log.borrow(), vec!["error VersionError"]);
    }

    #[test]
    fn upgrade_with_open_connection_is_blocked() {
        let engine = MemoryEngine::new();
        let (_, _first) = open_with(&engine, "db", Some(1), |_| {});
        let (log, _) = open_with(&engine, "db", Some(2), |_| {});
        assert_eq!(*log.borrow(), vec!["blocked 1"]);
        assert_eq!(engine.version_of("db"), Some(1));
    }

    #[test]
    fn failed_upgrade_discards_new_store() {
        let engine = MemoryEngine::new();
        let (log, _) = open_with(&engine, "db", None, |schema| schema.abort());
        assert_eq!(*log.borrow(), vec!["upgrade 0->1", "error AbortError"]);
        assert_eq!(engine.version_of("db"), None);
    }

    #[test]
    fn unique_index_over_duplicates_aborts_upgrade() {
        let engine = MemoryEngine::new();
        let (_, handle) = open_with(&engine, "db", Some(1), create_items);
        let handle = handle.borrow().clone().unwrap();
        let txn = handle
            .transaction(&["items"], TransactionMode::ReadWrite, Box::new(|_| {}))
            .unwrap();
        let items = txn.collection("items").unwrap();
        items.add(json!({"e": "x"}), None, Box::new(|r| assert!(r.is_ok())));
        items.add(json!({"e": "x"}), None, Box::new(|r| assert!(r.is_ok())));
        drop(txn);
        handle.close();

        let (log, _) = open_with(&engine, "db", Some(2), |schema| {
            schema
                .create_index(
                    "items",
                    "by_e",
                    "e",
                    &IndexParams {
                        unique: true,
                        multi_entry: false,
                    },
                )
                .unwrap();
        });
        assert_eq!(*log.borrow(), vec!["upgrade 1->2", "error AbortError"]);
        assert_eq!(engine.version_of("db"), Some(1));
        assert_eq!(engine.record_count("db", "items"), Some(2));
    }

    #[test]
    fn skipped_upgrade_bumps_version_silently() {
        let engine = MemoryEngine::new();
        engine.inject(Fault::SkipNextUpgrade);
        let (log, _) = open_with(&engine, "db", Some(4), create_items);
        assert_eq!(*log.borrow(), vec!["success 4"]);
    }

    #[test]
    fn aborted_commit_rolls_back() {
        let engine = MemoryEngine::new();
        let (_, handle) = open_with(&engine, "db", None, create_items);
        let handle = handle.borrow().clone().unwrap();
        engine.inject(Fault::AbortNextCommit(EngineErrorKind::QuotaExceeded));

        let events: Outcome = Rc::default();
        let events2 = Rc::clone(&events);
        let txn = handle
            .transaction(
                &["items"],
                TransactionMode::ReadWrite,
                Box::new(move |e| events2.borrow_mut().push(format!("{e:?}"))),
            )
            .unwrap();
        let events3 = Rc::clone(&events);
        txn.collection("items").unwrap().add(
            json!({"a": 1}),
            None,
            Box::new(move |r| events3.borrow_mut().push(format!("add {}", r.unwrap()))),
        );
        txn.commit();

        let events = events.borrow();
        assert_eq!(events[0], "add 1");
        assert!(events[1].starts_with("Abort"));
        assert_eq!(engine.record_count("db", "items"), Some(0));
        assert_eq!(engine.stats().aborted, 1);
    }

    #[test]
    fn cursor_walks_backwards() {
        let engine = MemoryEngine::new();
        let (_, handle) = open_with(&engine, "db", None, |schema| {
            schema
                .create_collection("words", &CollectionParams::default())
                .unwrap();
        });
        let handle = handle.borrow().clone().unwrap();
        let txn = handle
            .transaction(&["words"], TransactionMode::ReadWrite, Box::new(|_| {}))
            .unwrap();
        let words = txn.collection("words").unwrap();
        for word in ["apple", "apricot", "banana"] {
            words.add(json!(word), Some(Key::from(word)), Box::new(|r| assert!(r.is_ok())));
        }

        let seen: Outcome = Rc::default();
        let seen2 = Rc::clone(&seen);
        words.open_cursor(
            Some(&KeyRange::prefix("ap")),
            Direction::Prev,
            Box::new(move |step| {
                if let Some(entry) = step.unwrap() {
                    seen2
                        .borrow_mut()
                        .push(entry.key.as_text().unwrap_or_default().to_string());
                }
                CursorStep::Continue
            }),
        );
        assert_eq!(*seen.borrow(), vec!["apricot", "apple"]);
    }

    #[test]
    fn delete_blocked_by_open_connection() {
        let engine = MemoryEngine::new();
        let (_, handle) = open_with(&engine, "db", None, |_| {});
        let result: Rc<RefCell<Option<DeleteEvent>>> = Rc::default();
        let result2 = Rc::clone(&result);
        engine.delete_store("db", Box::new(move |e| *result2.borrow_mut() = Some(e)));
        assert_eq!(*result.borrow(), Some(DeleteEvent::Blocked));

        handle.borrow().clone().unwrap().close();
        let result2 = Rc::clone(&result);
        engine.delete_store("db", Box::new(move |e| *result2.borrow_mut() = Some(e)));
        assert_eq!(*result.borrow(), Some(DeleteEvent::Success));
        assert!(engine.store_names().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deferred_delivery_runs_on_local_set() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = MemoryEngine::deferred();
                let (log, _) = open_with(&engine, "db", None, |_| {});
                assert!(log.borrow().is_empty());
                for _ in 0..4 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(*log.borrow(), vec!["upgrade 0->1", "success 1"]);
            })
            .await;
    }
}
