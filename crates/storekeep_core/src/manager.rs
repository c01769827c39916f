//! The connection manager.
//!
//! A [`ConnectionManager`] keeps at most one live [`Connection`] per store
//! name. Opens and deletes of the same name are serialized by a per-name
//! async lock, so concurrent opens share a single engine open.

use crate::completion::completion;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{log_engine_error, ErrorContext, ErrorPolicy, Phase, StoreError, StoreResult};
use crate::events::{EventFeed, StoreEvent, StoreEventKind};
use crate::schema::{open_store, OpenOutcome};
use crate::types::validate_name;
use futures_util::lock::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::mpsc::Receiver;
use storekeep_engine::{DatabaseHandle, DeleteEvent, Engine, EngineError};
use tracing::{debug, info};

/// Identifies a cached connection, by store name or by reference.
#[derive(Debug, Clone, Copy)]
pub enum ConnectionRef<'a> {
    /// A store name.
    Name(&'a str),
    /// A connection handed out by the manager.
    Connection(&'a Connection),
}

impl<'a> From<&'a str> for ConnectionRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a String> for ConnectionRef<'a> {
    fn from(name: &'a String) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a Connection> for ConnectionRef<'a> {
    fn from(connection: &'a Connection) -> Self {
        Self::Connection(connection)
    }
}

/// Opens, caches, closes and deletes named stores.
///
/// Dropping the manager closes every cached connection.
pub struct ConnectionManager {
    engine: Rc<dyn Engine>,
    config: Config,
    registry: RefCell<HashMap<String, Connection>>,
    open_locks: RefCell<HashMap<String, Rc<Mutex<()>>>>,
    events: Rc<EventFeed>,
}

impl ConnectionManager {
    /// Creates a manager over `engine` with the default configuration.
    pub fn new(engine: impl Engine + 'static) -> Self {
        Self::with_config(engine, Config::default())
    }

    /// Creates a manager over `engine`.
    pub fn with_config(engine: impl Engine + 'static, config: Config) -> Self {
        Self::from_shared(Rc::new(engine), config)
    }

    /// Creates a manager over an engine shared with other owners.
    pub fn from_shared(engine: Rc<dyn Engine>, config: Config) -> Self {
        let events = Rc::new(EventFeed::with_max_history(config.event_history));
        Self {
            engine,
            config,
            registry: RefCell::new(HashMap::new()),
            open_locks: RefCell::new(HashMap::new()),
            events,
        }
    }

    /// The manager's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The lifecycle event feed.
    #[must_use]
    pub fn events(&self) -> &EventFeed {
        &self.events
    }

    /// Subscribes to lifecycle, schema and record events.
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Returns the cached connection for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Connection> {
        self.registry.borrow().get(name).cloned()
    }

    /// Names of the stores with a cached connection, sorted.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    fn open_lock(&self, name: &str) -> Rc<Mutex<()>> {
        let mut locks = self.open_locks.borrow_mut();
        Rc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Rc::new(Mutex::new(()))),
        )
    }

    /// Forgets the open lock for `name` once nothing but the map holds it.
    fn prune_open_lock(&self, name: &str) {
        let mut locks = self.open_locks.borrow_mut();
        if locks.get(name).is_some_and(|lock| Rc::strong_count(lock) == 1) {
            locks.remove(name);
        }
    }

    /// Opens `name`, or returns its cached connection.
    ///
    /// A new store is created at [`Config::initial_version`]. A store that
    /// already sits at a higher version is opened at that version when
    /// [`Config::version_fallback`] is on.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Blocked`] if the open needs an upgrade that another
    ///   connection blocks
    /// - [`StoreError::VersionConflict`] if the store is at a higher version
    ///   and fallback is off
    pub async fn open(&self, name: &str) -> StoreResult<Connection> {
        validate_name("store", name)?;
        if let Some(connection) = self.get(name) {
            return Ok(connection);
        }

        let lock = self.open_lock(name);
        let result = {
            let _guard = lock.lock().await;
            self.open_locked(name).await
        };
        drop(lock);
        self.prune_open_lock(name);
        result
    }

    /// Opens `name` while holding its open lock.
    async fn open_locked(&self, name: &str) -> StoreResult<Connection> {
        if let Some(connection) = self.get(name) {
            debug!(store = name, "open shared with a concurrent caller");
            return Ok(connection);
        }

        let requested = self.config.initial_version;
        let (handle, upgraded, negotiated) =
            match self.open_at(name, Some(requested)).await? {
                Ok((handle, upgraded)) => (handle, upgraded, false),
                Err(err) if ErrorPolicy::for_engine(err.kind, Phase::Open) == ErrorPolicy::Retryable => {
                    if !self.config.version_fallback {
                        return Err(self.version_conflict(name, requested, err));
                    }
                    log_engine_error(&err, Phase::Open, name);
                    match self.open_at(name, None).await? {
                        Ok((handle, upgraded)) => (handle, upgraded, true),
                        Err(err) => return Err(ErrorContext::new(name, "", Phase::Open).classify(err)),
                    }
                }
                Err(err) => return Err(ErrorContext::new(name, "", Phase::Open).classify(err)),
            };

        let connection = Connection::new(
            Rc::clone(&self.engine),
            self.config.clone(),
            Rc::clone(&self.events),
            handle,
        );
        self.registry
            .borrow_mut()
            .insert(name.to_string(), connection.clone());

        let kind = if negotiated {
            StoreEventKind::VersionNegotiated
        } else if upgraded {
            StoreEventKind::Upgraded
        } else {
            StoreEventKind::Opened
        };
        info!(store = name, version = connection.version(), event = ?kind, "store opened");
        self.events
            .emit(StoreEvent::new(kind, name).with_version(connection.version()));
        Ok(connection)
    }

    /// Opens without schema changes. The inner result carries engine
    /// errors so the caller can decide on a fallback.
    async fn open_at(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> StoreResult<Result<(Rc<dyn DatabaseHandle>, bool), EngineError>> {
        match open_store(&*self.engine, name, version, |_| {}).await? {
            OpenOutcome::Opened { handle, upgraded } => Ok(Ok((handle, upgraded))),
            OpenOutcome::Blocked { .. } => Err(StoreError::Blocked {
                store: name.to_string(),
                version: version.unwrap_or(self.config.initial_version),
            }),
            OpenOutcome::Failed(err) => Ok(Err(err)),
        }
    }

    fn version_conflict(&self, name: &str, requested: u64, err: EngineError) -> StoreError {
        log_engine_error(&err, Phase::Open, name);
        StoreError::VersionConflict {
            store: name.to_string(),
            requested,
            message: err.message,
        }
    }

    /// Closes a cached connection, given its store name or the connection
    /// itself. Returns false, doing nothing, for an unknown name or a
    /// connection this manager does not cache.
    pub fn close<'a>(&self, target: impl Into<ConnectionRef<'a>>) -> bool {
        let name = match target.into() {
            ConnectionRef::Name(name) => name.to_string(),
            ConnectionRef::Connection(connection) => match self.get(connection.name()) {
                Some(cached) if cached.ptr_eq(connection) => connection.name().to_string(),
                _ => return false,
            },
        };

        let removed = self.registry.borrow_mut().remove(&name);
        self.prune_open_lock(&name);
        match removed {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Closes every cached connection.
    pub fn close_all(&self) {
        let connections: Vec<Connection> = self
            .registry
            .borrow_mut()
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in connections {
            connection.close();
        }
    }

    /// Deletes a store, closing its cached connection first.
    ///
    /// Deleting a store that does not exist succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DeletionBlocked`] if a connection outside this
    /// manager keeps the store open.
    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        validate_name("store", name)?;
        let lock = self.open_lock(name);
        let result = {
            let _guard = lock.lock().await;
            self.delete_locked(name).await
        };
        drop(lock);
        self.prune_open_lock(name);
        result
    }

    async fn delete_locked(&self, name: &str) -> StoreResult<()> {
        self.close(name);

        let (done, pending) = completion::<()>("delete");
        let store = name.to_string();
        self.engine.delete_store(
            name,
            Box::new(move |event| match event {
                DeleteEvent::Success => done.resolve(()),
                DeleteEvent::Blocked => done.reject(StoreError::DeletionBlocked { store }),
                DeleteEvent::Error(err) => {
                    done.reject(ErrorContext::new(&store, "", Phase::Delete).classify(err));
                }
            }),
        );
        pending.wait().await?;

        info!(store = name, "store deleted");
        self.events.emit(StoreEvent::new(StoreEventKind::Deleted, name));
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("stores", &self.store_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use storekeep_engine::MemoryEngine;

    #[test]
    fn open_caches_connection() {
        let engine = MemoryEngine::new();
        let manager = ConnectionManager::new(engine.clone());
        let first = manager.open("db").now_or_never().unwrap().unwrap();
        let second = manager.open("db").now_or_never().unwrap().unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(engine.stats().opens, 1);
        assert_eq!(manager.store_names(), vec!["db".to_string()]);
    }

    #[test]
    fn close_by_name_or_reference() {
        let engine = MemoryEngine::new();
        let manager = ConnectionManager::new(engine.clone());
        let db = manager.open("db").now_or_never().unwrap().unwrap();

        assert!(!manager.close("other"));
        assert!(manager.close(&db));
        assert!(db.is_closed());
        assert!(!manager.close(&db));
        assert_eq!(engine.live_connections("db"), 0);

        let reopened = manager.open("db").now_or_never().unwrap().unwrap();
        assert!(!reopened.ptr_eq(&db));
        assert!(!manager.close(&db));
        assert!(manager.close(&"db".to_string()));
    }

    #[test]
    fn open_emits_lifecycle_events() {
        let engine = MemoryEngine::new();
        let manager = ConnectionManager::new(engine);
        let events = manager.subscribe();

        manager.open("db").now_or_never().unwrap().unwrap();
        manager.close("db");
        manager.open("db").now_or_never().unwrap().unwrap();

        let kinds: Vec<StoreEventKind> = events.try_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StoreEventKind::Upgraded,
                StoreEventKind::Closed,
                StoreEventKind::Opened
            ]
        );
    }

    #[test]
    fn open_locks_are_released() {
        let manager = ConnectionManager::new(MemoryEngine::new());
        for i in 0..8 {
            let name = format!("db{i}");
            manager.open(&name).now_or_never().unwrap().unwrap();
            if i % 2 == 0 {
                manager.close(name.as_str());
            } else {
                manager.delete(&name).now_or_never().unwrap().unwrap();
            }
        }
        manager.delete("never-opened").now_or_never().unwrap().unwrap();
        assert!(manager.open_locks.borrow().is_empty());
    }

    #[test]
    fn held_open_lock_survives_close() {
        let manager = ConnectionManager::new(MemoryEngine::new());
        manager.open("db").now_or_never().unwrap().unwrap();
        let lock = manager.open_lock("db");

        assert!(manager.close("db"));
        assert_eq!(manager.open_locks.borrow().len(), 1);

        drop(lock);
        manager.close("db");
        assert!(manager.open_locks.borrow().is_empty());
    }

    #[test]
    fn empty_store_name_rejected() {
        let manager = ConnectionManager::new(MemoryEngine::new());
        let err = manager.open("").now_or_never().unwrap().unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn drop_closes_everything() {
        let engine = MemoryEngine::new();
        let manager = ConnectionManager::new(engine.clone());
        manager.open("a").now_or_never().unwrap().unwrap();
        manager.open("b").now_or_never().unwrap().unwrap();
        drop(manager);
        assert_eq!(engine.live_connections("a"), 0);
        assert_eq!(engine.live_connections("b"), 0);
    }
}
