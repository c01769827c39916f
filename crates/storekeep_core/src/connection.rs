//! Connections and the schema coordinator.
//!
//! A [`Connection`] owns the engine handle for one store. Its identity is
//! stable across version upgrades: creating a collection or an index swaps
//! the handle in place, and every [`Collection`] resolves the live handle
//! through its connection on each operation.
//!
//! Schema changes on one connection are serialized by an async upgrade
//! lock. Record operations wait for a running upgrade to finish before
//! they pick up the handle.

use crate::collection::Collection;
use crate::config::Config;
use crate::error::{log_engine_error, ErrorContext, ErrorPolicy, Phase, StoreError, StoreResult};
use crate::events::{EventFeed, StoreEvent, StoreEventKind};
use crate::index::Index;
use crate::schema::{open_store, OpenOutcome, PendingUpgrade, SchemaChange, UpgradeOutcome, UpgradeState};
use crate::types::{validate_name, CollectionOptions, IndexOptions};
use futures_util::lock::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use storekeep_engine::{CollectionMeta, DatabaseHandle, Engine, KeyPath};
use tracing::{debug, info, warn};

/// An open connection to a named, versioned store.
///
/// Cloning a `Connection` yields another reference to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    name: String,
    engine: Rc<dyn Engine>,
    config: Config,
    handle: RefCell<Option<Rc<dyn DatabaseHandle>>>,
    version: Cell<u64>,
    collections: RefCell<BTreeMap<String, Collection>>,
    upgrade_lock: Mutex<()>,
    state: Rc<Cell<UpgradeState>>,
    closed: Cell<bool>,
    events: Rc<EventFeed>,
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.get() {
            return Err(StoreError::connection_closed(&self.name));
        }
        Ok(())
    }

    fn current_handle(&self) -> Option<Rc<dyn DatabaseHandle>> {
        self.handle
            .borrow()
            .as_ref()
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Returns the live handle, waiting for a running upgrade first.
    pub(crate) async fn live_handle(&self) -> StoreResult<Rc<dyn DatabaseHandle>> {
        self.ensure_open()?;
        drop(self.upgrade_lock.lock().await);
        self.ensure_open()?;
        self.current_handle()
            .ok_or_else(|| StoreError::connection_closed(&self.name))
    }

    /// Makes `handle` the live handle. A connection closed in the meantime
    /// refuses it and closes it.
    fn install(&self, handle: Rc<dyn DatabaseHandle>) -> StoreResult<Rc<dyn DatabaseHandle>> {
        if self.closed.get() {
            handle.close();
            return Err(StoreError::connection_closed(&self.name));
        }
        self.version.set(handle.version());
        if let Some(previous) = self.handle.replace(Some(Rc::clone(&handle))) {
            previous.close();
        }
        Ok(handle)
    }

    fn release_handle(&self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }

    async fn reopen_current(&self) -> StoreResult<Rc<dyn DatabaseHandle>> {
        match open_store(&*self.engine, &self.name, None, |_| {}).await? {
            OpenOutcome::Opened { handle, .. } => self.install(handle),
            OpenOutcome::Blocked { current_version } => Err(StoreError::Blocked {
                store: self.name.clone(),
                version: current_version,
            }),
            OpenOutcome::Failed(err) => Err(ErrorContext::new(&self.name, "", Phase::Open).classify(err)),
        }
    }

    /// Reopens at the current version after a blocked or failed upgrade.
    async fn restore(&self) {
        if !self.config.restore_on_failure || self.closed.get() {
            return;
        }
        match self.reopen_current().await {
            Ok(handle) => {
                info!(store = %self.name, version = handle.version(), "connection restored after failed upgrade");
            }
            Err(err) => {
                warn!(store = %self.name, error = %err, "could not restore connection; it has no live handle");
            }
        }
    }

    fn fail(&self) {
        self.state.set(UpgradeState::Failed);
    }

    /// Publishes a committed record operation at the current version.
    pub(crate) fn record_event(&self, event: StoreEvent) {
        self.events.emit(event.with_version(self.version.get()));
    }

    /// Runs the version-bump protocol for `change`. The caller holds the
    /// upgrade lock.
    async fn run_upgrade(&self, change: &SchemaChange) -> StoreResult<UpgradeOutcome> {
        let context = ErrorContext::new(&self.name, change.collection(), Phase::SchemaChange);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let pending = Rc::new(PendingUpgrade::new(
                &self.name,
                self.version.get() + 1,
                change.clone(),
            ));
            let target = pending.target_version();

            self.state.set(UpgradeState::Closing);
            self.release_handle();
            self.state.set(UpgradeState::Reopening);
            debug!(store = %self.name, version = target, change = %change, attempt = attempts, "reopening for upgrade");

            let on_upgrade = {
                let pending = Rc::clone(&pending);
                let state = Rc::clone(&self.state);
                move |schema: &mut dyn storekeep_engine::SchemaTransaction| {
                    state.set(UpgradeState::Upgrading);
                    pending.run(schema);
                }
            };
            let outcome = match open_store(&*self.engine, &self.name, Some(target), on_upgrade).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.fail();
                    return Err(err);
                }
            };

            match outcome {
                OpenOutcome::Opened { handle, .. } => {
                    let handle = self.install(handle).inspect_err(|_| self.fail())?;
                    if let Some(err) = pending.take_failure() {
                        self.fail();
                        return Err(context.classify(err));
                    }
                    return match pending.outcome() {
                        Some(outcome) => {
                            self.state.set(outcome.into());
                            info!(store = %self.name, version = handle.version(), change = %change, outcome = ?outcome, "upgrade finished");
                            Ok(outcome)
                        }
                        None => {
                            self.fail();
                            warn!(store = %self.name, requested = target, actual = handle.version(), "open succeeded without upgrade");
                            Err(StoreError::UpgradeNotTriggered {
                                store: self.name.clone(),
                                requested: target,
                                actual: handle.version(),
                            })
                        }
                    };
                }
                OpenOutcome::Blocked { current_version } => {
                    self.state.set(UpgradeState::Blocked);
                    warn!(store = %self.name, current_version, requested = target, "upgrade blocked by another connection");
                    self.restore().await;
                    return Err(StoreError::Blocked {
                        store: self.name.clone(),
                        version: target,
                    });
                }
                OpenOutcome::Failed(err) => {
                    if let Some(failure) = pending.take_failure() {
                        self.fail();
                        self.restore().await;
                        return Err(context.classify(failure));
                    }
                    if ErrorPolicy::for_engine(err.kind, Phase::SchemaChange) != ErrorPolicy::Retryable {
                        self.fail();
                        self.restore().await;
                        return Err(context.classify(err));
                    }

                    log_engine_error(&err, Phase::SchemaChange, &self.name);
                    let handle = self.reopen_current().await.inspect_err(|_| self.fail())?;
                    if change.is_applied(&*handle) {
                        self.state.set(UpgradeState::AlreadyApplied);
                        return Ok(UpgradeOutcome::AlreadyApplied);
                    }
                    if attempts >= self.config.max_upgrade_attempts {
                        self.fail();
                        return Err(StoreError::VersionConflict {
                            store: self.name.clone(),
                            requested: target,
                            message: err.message,
                        });
                    }
                    debug!(store = %self.name, version = handle.version(), "store moved past requested version; retrying");
                }
            }
        }
    }
}

impl Connection {
    /// Wraps a freshly opened handle. Collections already in the store are
    /// registered; one that cannot be described is logged and skipped.
    pub(crate) fn new(
        engine: Rc<dyn Engine>,
        config: Config,
        events: Rc<EventFeed>,
        handle: Rc<dyn DatabaseHandle>,
    ) -> Self {
        let connection = Self {
            inner: Rc::new(ConnectionInner {
                name: handle.name(),
                engine,
                config,
                handle: RefCell::new(Some(Rc::clone(&handle))),
                version: Cell::new(handle.version()),
                collections: RefCell::new(BTreeMap::new()),
                upgrade_lock: Mutex::new(()),
                state: Rc::new(Cell::new(UpgradeState::Idle)),
                closed: Cell::new(false),
                events,
            }),
        };

        for name in handle.collection_names() {
            match handle.describe(&name) {
                Ok(meta) => {
                    connection.register(meta);
                }
                Err(err) => {
                    warn!(store = %connection.inner.name, collection = %name, error = %err, "skipping collection that cannot be described");
                }
            }
        }
        connection
    }

    pub(crate) fn from_inner(inner: Rc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Version of the live handle (the last version granted by the engine).
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    /// Returns true once the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Where the connection is in the upgrade protocol.
    #[must_use]
    pub fn upgrade_state(&self) -> UpgradeState {
        self.inner.state.get()
    }

    /// Names of the registered collections, sorted.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.inner.collections.borrow().keys().cloned().collect()
    }

    /// Returns a registered collection.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<Collection> {
        self.inner.collections.borrow().get(name).cloned()
    }

    /// Returns true if both values refer to the same connection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn register(&self, meta: CollectionMeta) -> Collection {
        let mut collections = self.inner.collections.borrow_mut();
        collections
            .entry(meta.name.clone())
            .or_insert_with(|| Collection::new(&self.inner.name, meta, Rc::downgrade(&self.inner)))
            .clone()
    }

    fn emit(&self, event: StoreEvent) {
        self.inner.events.emit(event.with_version(self.version()));
    }

    /// Creates a collection, bumping the store's version.
    ///
    /// If the collection already exists the existing [`Collection`] is
    /// returned and the version is left alone.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Validation`] for bad options (nothing is touched)
    /// - [`StoreError::Blocked`] if another connection holds the store open
    /// - [`StoreError::UpgradeNotTriggered`] if the engine opened the new
    ///   version without running the upgrade
    /// - [`StoreError::VersionConflict`] if other openers kept moving the
    ///   version
    pub async fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> StoreResult<Collection> {
        validate_name("collection", name)?;
        options.validate()?;

        let inner = &self.inner;
        inner.ensure_open()?;
        let _guard = inner.upgrade_lock.lock().await;
        inner.ensure_open()?;

        if let Some(existing) = self.collection(name) {
            debug!(store = %inner.name, collection = name, "collection exists");
            return Ok(existing);
        }
        if let Some(meta) = inner.current_handle().and_then(|h| h.describe(name).ok()) {
            return Ok(self.register(meta));
        }

        inner.state.set(UpgradeState::Validating);
        let change = SchemaChange::CreateCollection {
            name: name.to_string(),
            options,
        };
        inner.run_upgrade(&change).await?;

        let handle = inner
            .current_handle()
            .ok_or_else(|| StoreError::connection_closed(&inner.name))?;
        let meta = handle
            .describe(name)
            .map_err(|e| ErrorContext::new(&inner.name, name, Phase::SchemaChange).classify(e))?;
        let collection = self.register(meta);
        self.emit(StoreEvent::new(StoreEventKind::CollectionCreated, &inner.name).with_collection(name));
        Ok(collection)
    }

    /// Creates an index on a registered collection, bumping the store's
    /// version. If the index exists its descriptor is returned.
    ///
    /// # Errors
    ///
    /// As for [`Connection::create_collection`], plus
    /// [`StoreError::CollectionNotFound`] for an unknown collection.
    pub async fn create_index(
        &self,
        collection: &str,
        name: &str,
        key_path: &str,
        options: IndexOptions,
    ) -> StoreResult<Index> {
        validate_name("index", name)?;
        if !KeyPath::is_valid(key_path) {
            return Err(StoreError::validation(format!(
                "invalid index key path {key_path:?}"
            )));
        }

        let inner = &self.inner;
        inner.ensure_open()?;
        let _guard = inner.upgrade_lock.lock().await;
        inner.ensure_open()?;

        let owner = self
            .collection(collection)
            .ok_or_else(|| StoreError::collection_not_found(&inner.name, collection))?;

        if let Some(handle) = inner.current_handle() {
            if let Ok(meta) = handle.describe_index(collection, name) {
                debug!(store = %inner.name, collection, index = name, "index exists");
                return Ok(Index::from(meta));
            }
        }

        inner.state.set(UpgradeState::Validating);
        let change = SchemaChange::CreateIndex {
            collection: collection.to_string(),
            name: name.to_string(),
            key_path: key_path.to_string(),
            options,
        };
        inner.run_upgrade(&change).await?;

        let handle = inner
            .current_handle()
            .ok_or_else(|| StoreError::connection_closed(&inner.name))?;
        let index = handle
            .describe_index(collection, name)
            .map_err(|_| StoreError::IndexNotFound {
                collection: collection.to_string(),
                index: name.to_string(),
            })?;
        match handle.describe(collection) {
            Ok(meta) => owner.refresh(&meta),
            Err(err) => warn!(store = %inner.name, collection, error = %err, "could not refresh collection"),
        }
        self.emit(
            StoreEvent::new(StoreEventKind::IndexCreated, &inner.name)
                .with_collection(collection)
                .with_index(name),
        );
        Ok(Index::from(index))
    }

    /// Releases the engine handle. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        if self.inner.closed.replace(true) {
            return false;
        }
        self.inner.release_handle();
        info!(store = %self.inner.name, version = self.version(), "connection closed");
        self.emit(StoreEvent::new(StoreEventKind::Closed, &self.inner.name));
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .field("upgrade_state", &self.upgrade_state())
            .field("collections", &self.collection_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use storekeep_engine::{Fault, MemoryEngine, OpenEvent};

    fn connect(engine: &MemoryEngine) -> Connection {
        let handle: Rc<RefCell<Option<Rc<dyn DatabaseHandle>>>> = Rc::default();
        let slot = Rc::clone(&handle);
        engine.open(
            "db",
            None,
            Box::new(move |event| {
                if let OpenEvent::Success(h) = event {
                    *slot.borrow_mut() = Some(h);
                }
            }),
        );
        let handle = handle.borrow_mut().take().unwrap();
        Connection::new(
            Rc::new(engine.clone()),
            Config::default(),
            Rc::new(EventFeed::new()),
            handle,
        )
    }

    #[test]
    fn create_collection_bumps_version_once() {
        let engine = MemoryEngine::new();
        let db = connect(&engine);
        assert_eq!(db.version(), 1);

        let notes = db
            .create_collection("notes", CollectionOptions::new().auto_increment(true))
            .now_or_never()
            .unwrap()
            .unwrap();
        assert_eq!(db.version(), 2);
        assert_eq!(db.upgrade_state(), UpgradeState::Applied);

        let again = db
            .create_collection("notes", CollectionOptions::new())
            .now_or_never()
            .unwrap()
            .unwrap();
        assert!(notes.ptr_eq(&again));
        assert_eq!(db.version(), 2);
        assert_eq!(engine.live_connections("db"), 1);
    }

    #[test]
    fn invalid_options_leave_connection_alone() {
        let engine = MemoryEngine::new();
        let db = connect(&engine);
        let err = db
            .create_collection("bad", CollectionOptions::new().key_path("a-b"))
            .now_or_never()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        assert_eq!(db.version(), 1);
        assert_eq!(db.upgrade_state(), UpgradeState::Idle);
        assert_eq!(engine.stats().opens, 1);
    }

    #[test]
    fn skipped_upgrade_is_reported_and_connection_survives() {
        let engine = MemoryEngine::new();
        let db = connect(&engine);
        engine.inject(Fault::SkipNextUpgrade);
        let err = db
            .create_collection("notes", CollectionOptions::new())
            .now_or_never()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::UpgradeNotTriggered {
                requested: 2,
                actual: 2,
                ..
            }
        ));
        assert_eq!(db.upgrade_state(), UpgradeState::Failed);
        assert_eq!(engine.live_connections("db"), 1);

        db.create_collection("notes", CollectionOptions::new())
            .now_or_never()
            .unwrap()
            .unwrap();
        assert_eq!(db.version(), 3);
    }

    #[test]
    fn index_on_unknown_collection() {
        let engine = MemoryEngine::new();
        let db = connect(&engine);
        let err = db
            .create_index("missing", "by_x", "x", IndexOptions::new())
            .now_or_never()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StoreError::CollectionNotFound { .. }));
    }

    #[test]
    fn closed_connection_refuses_changes() {
        let engine = MemoryEngine::new();
        let db = connect(&engine);
        assert!(db.close());
        assert!(!db.close());
        assert_eq!(engine.live_connections("db"), 0);
        let err = db
            .create_collection("notes", CollectionOptions::new())
            .now_or_never()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StoreError::ConnectionClosed { .. }));
    }
}
