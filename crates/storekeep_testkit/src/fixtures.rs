//! Test fixtures and store helpers.
//!
//! Provides a manager wired to an inspectable [`MemoryEngine`], helpers that
//! open stores without going through the manager, and runners for the
//! single-threaded futures the core crate produces.

use futures_channel::oneshot;
use futures_util::FutureExt;
use std::future::Future;
use std::ops::Deref;
use std::rc::Rc;
use storekeep_core::{Config, ConnectionManager};
use storekeep_engine::{
    DatabaseHandle, Engine, EngineError, MemoryEngine, OpenEvent, SchemaTransaction,
};

/// A connection manager together with the engine it runs on.
pub struct TestStore {
    /// The engine, for fault injection and inspection.
    pub engine: MemoryEngine,
    /// The manager under test.
    pub manager: ConnectionManager,
}

impl TestStore {
    /// A manager over an engine that signals immediately.
    pub fn memory() -> Self {
        Self::with_engine(MemoryEngine::new(), Config::default())
    }

    /// A manager over an engine that signals on the current `LocalSet`.
    pub fn deferred() -> Self {
        Self::with_engine(MemoryEngine::deferred(), Config::default())
    }

    /// A manager with a custom configuration over an immediate engine.
    pub fn with_config(config: Config) -> Self {
        Self::with_engine(MemoryEngine::new(), config)
    }

    /// A manager over `engine`.
    pub fn with_engine(engine: MemoryEngine, config: Config) -> Self {
        let manager = ConnectionManager::with_config(engine.clone(), config);
        Self { engine, manager }
    }

    /// A second manager sharing this store's engine, standing in for
    /// another tab or process.
    pub fn sibling(&self) -> ConnectionManager {
        ConnectionManager::with_config(self.engine.clone(), self.manager.config().clone())
    }
}

impl Deref for TestStore {
    type Target = ConnectionManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

/// Resolves a future that is expected to be ready on first poll, as every
/// future over an immediate engine is.
///
/// # Panics
///
/// Panics if the future is still pending.
pub fn ready<F: Future>(future: F) -> F::Output {
    future
        .now_or_never()
        .expect("future was pending; use run_local for deferred engines")
}

/// Runs a future to completion on a current-thread runtime inside a
/// `LocalSet`, as deferred engines require.
///
/// # Panics
///
/// Panics if the runtime cannot be built.
pub fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("Failed to build runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, future)
}

/// Installs a `tracing` subscriber filtered by `RUST_LOG`. Safe to call from
/// every test; only the first call installs.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Terminal result of an open made with [`open_raw`].
pub enum RawOpen {
    /// The store is open.
    Opened(Rc<dyn DatabaseHandle>),
    /// The open was blocked at this current version.
    Blocked(u64),
    /// The open failed.
    Failed(EngineError),
}

impl RawOpen {
    /// Returns the handle.
    ///
    /// # Panics
    ///
    /// Panics if the open did not succeed.
    pub fn handle(self) -> Rc<dyn DatabaseHandle> {
        match self {
            Self::Opened(handle) => handle,
            Self::Blocked(version) => panic!("open blocked at version {version}"),
            Self::Failed(err) => panic!("open failed: {err}"),
        }
    }
}

/// Opens a store directly on the engine, bypassing any manager.
pub async fn open_raw(engine: &dyn Engine, name: &str, version: Option<u64>) -> RawOpen {
    open_raw_with(engine, name, version, |_| {}).await
}

/// Like [`open_raw`], running `upgrade` if the engine starts an upgrade.
pub async fn open_raw_with(
    engine: &dyn Engine,
    name: &str,
    version: Option<u64>,
    mut upgrade: impl FnMut(&mut dyn SchemaTransaction) + 'static,
) -> RawOpen {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    engine.open(
        name,
        version,
        Box::new(move |event| {
            let outcome = match event {
                OpenEvent::UpgradeNeeded { schema, .. } => {
                    upgrade(schema);
                    return;
                }
                OpenEvent::Success(handle) => RawOpen::Opened(handle),
                OpenEvent::Blocked { current_version } => RawOpen::Blocked(current_version),
                OpenEvent::Error(err) => RawOpen::Failed(err),
            };
            if let Some(tx) = tx.take() {
                let _ = tx.send(outcome);
            }
        }),
    );
    rx.await.expect("engine dropped the open request")
}

/// Test scenario helpers.
pub mod scenarios {
    use super::{ready, TestStore};
    use serde_json::json;
    use storekeep_core::{Collection, CollectionOptions, Key};

    /// Opens `store` and creates an auto-increment `items` collection with
    /// `count` records `{"index": i}`.
    pub fn populated_collection(store: &TestStore, count: usize) -> Collection {
        let db = ready(store.open("test")).expect("Failed to open store");
        let items = ready(db.create_collection(
            "items",
            CollectionOptions::new().auto_increment(true),
        ))
        .expect("Failed to create collection");
        for i in 0..count {
            ready(items.add(json!({ "index": i }), None)).expect("Failed to add record");
        }
        items
    }

    /// Opens `store` and creates a `words` collection keyed by the words
    /// themselves.
    pub fn word_collection(store: &TestStore, words: &[&str]) -> Collection {
        let db = ready(store.open("test")).expect("Failed to open store");
        let collection = ready(db.create_collection("words", CollectionOptions::new()))
            .expect("Failed to create collection");
        for word in words {
            ready(collection.add(json!({ "word": word }), Some(Key::from(*word))))
                .expect("Failed to add word");
        }
        collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_opens() {
        let store = TestStore::memory();
        let db = ready(store.open("test")).unwrap();
        assert_eq!(db.version(), 1);
        assert_eq!(store.engine.live_connections("test"), 1);
    }

    #[test]
    fn raw_open_sees_manager_schema() {
        let store = TestStore::memory();
        let items = scenarios::populated_collection(&store, 3);
        assert_eq!(items.name(), "items");

        store.close("test");
        let handle = ready(open_raw(&store.engine, "test", None)).handle();
        assert_eq!(handle.version(), 2);
        assert_eq!(handle.collection_names(), vec!["items".to_string()]);
        assert_eq!(store.engine.record_count("test", "items"), Some(3));
    }

    #[test]
    fn deferred_store_runs_locally() {
        let store = TestStore::deferred();
        let version = run_local(async {
            let db = store.open("test").await.unwrap();
            db.version()
        });
        assert_eq!(version, 1);
    }
}
