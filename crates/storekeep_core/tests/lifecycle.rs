//! Integration tests for opening, closing and deleting stores.

use futures_util::future::join;
use storekeep_core::{CollectionOptions, Config, StoreError, StoreEventKind};
use storekeep_engine::{EngineErrorKind, Fault};
use storekeep_testkit::{open_raw, ready, run_local, scenarios, TestStore};

#[test]
fn concurrent_opens_share_one_connection() {
    let store = TestStore::deferred();
    let (first, second) = run_local(async {
        let (a, b) = join(store.open("shared"), store.open("shared")).await;
        (a.unwrap(), b.unwrap())
    });

    assert!(first.ptr_eq(&second));
    assert_eq!(store.engine.stats().opens, 1);
    assert_eq!(store.engine.live_connections("shared"), 1);
    assert_eq!(store.store_names(), vec!["shared".to_string()]);
}

#[test]
fn opens_of_different_stores_are_independent() {
    let store = TestStore::deferred();
    run_local(async {
        let (a, b) = join(store.open("a"), store.open("b")).await;
        assert!(!a.unwrap().ptr_eq(&b.unwrap()));
    });
    assert_eq!(store.engine.stats().opens, 2);
}

#[test]
fn close_releases_the_engine_connection() {
    let store = TestStore::memory();
    let db = ready(store.open("test")).unwrap();

    assert!(store.close(&db));
    assert!(db.is_closed());
    assert!(store.get("test").is_none());
    assert_eq!(store.engine.live_connections("test"), 0);

    assert!(!store.close("test"));
    assert!(!store.close(&db));
}

#[test]
fn close_ignores_connections_from_another_manager() {
    let store = TestStore::memory();
    let other = store.sibling();
    let theirs = ready(other.open("test")).unwrap();
    let _ours = ready(store.open("test")).unwrap();

    assert!(!store.close(&theirs));
    assert!(!theirs.is_closed());
    assert_eq!(store.engine.live_connections("test"), 2);
}

#[test]
fn delete_removes_the_store() {
    let store = TestStore::memory();
    let items = scenarios::populated_collection(&store, 3);

    ready(store.delete("test")).unwrap();
    assert!(store.get("test").is_none());
    assert_eq!(store.engine.version_of("test"), None);
    assert!(matches!(
        ready(items.all()),
        Err(StoreError::ConnectionClosed { .. })
    ));

    let db = ready(store.open("test")).unwrap();
    assert_eq!(db.version(), 1);
    assert!(db.collection_names().is_empty());
}

#[test]
fn deleting_an_unknown_store_succeeds() {
    let store = TestStore::memory();
    ready(store.delete("never-opened")).unwrap();
    assert_eq!(store.engine.stats().deletes, 1);
}

#[test]
fn delete_blocked_by_a_foreign_connection() {
    let store = TestStore::memory();
    ready(store.open("test")).unwrap();
    let foreign = ready(open_raw(&store.engine, "test", None)).handle();

    let err = ready(store.delete("test")).unwrap_err();
    assert!(matches!(err, StoreError::DeletionBlocked { ref store } if store == "test"));
    // The cached connection was closed before the attempt.
    assert!(store.get("test").is_none());
    assert_eq!(store.engine.version_of("test"), Some(1));

    foreign.close();
    ready(store.delete("test")).unwrap();
}

#[test]
fn open_falls_back_to_a_higher_version() {
    let store = TestStore::memory();
    ready(open_raw(&store.engine, "legacy", Some(10))).handle().close();
    let events = store.subscribe();

    let db = ready(store.open("legacy")).unwrap();
    assert_eq!(db.version(), 10);

    let event = events.try_recv().unwrap();
    assert_eq!(event.kind, StoreEventKind::VersionNegotiated);
    assert_eq!(event.version, Some(10));

    // Schema changes continue from the negotiated version.
    ready(db.create_collection("notes", CollectionOptions::new())).unwrap();
    assert_eq!(db.version(), 11);
}

#[test]
fn open_without_fallback_is_a_version_conflict() {
    let store = TestStore::with_config(Config::new().version_fallback(false));
    ready(open_raw(&store.engine, "legacy", Some(10))).handle().close();

    let err = ready(store.open("legacy")).unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionConflict { requested: 1, .. }
    ));
    assert!(err.is_retryable());
    assert!(store.get("legacy").is_none());
}

#[test]
fn open_blocked_by_a_foreign_connection() {
    let store = TestStore::with_config(Config::new().initial_version(2));
    let foreign = ready(open_raw(&store.engine, "test", Some(1))).handle();

    let err = ready(store.open("test")).unwrap_err();
    assert!(matches!(err, StoreError::Blocked { version: 2, .. }));
    assert!(store.get("test").is_none());

    foreign.close();
    let db = ready(store.open("test")).unwrap();
    assert_eq!(db.version(), 2);
}

#[test]
fn failed_open_is_not_cached() {
    let store = TestStore::memory();
    store.engine.inject(Fault::FailNextOpen(EngineErrorKind::Unknown));

    let err = ready(store.open("test")).unwrap_err();
    assert_eq!(err.engine_kind(), Some(EngineErrorKind::Unknown));
    assert!(store.get("test").is_none());

    ready(store.open("test")).unwrap();
}

#[test]
fn drop_closes_every_connection() {
    let store = TestStore::memory();
    let engine = store.engine.clone();
    ready(store.open("a")).unwrap();
    ready(store.open("b")).unwrap();
    drop(store);

    assert_eq!(engine.live_connections("a"), 0);
    assert_eq!(engine.live_connections("b"), 0);
}

#[test]
fn lifecycle_events_keep_order() {
    let store = TestStore::memory();
    let events = store.subscribe();

    ready(store.open("test")).unwrap();
    store.close("test");
    ready(store.open("test")).unwrap();
    ready(store.delete("test")).unwrap();

    let kinds: Vec<StoreEventKind> = events.try_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StoreEventKind::Upgraded,
            StoreEventKind::Closed,
            StoreEventKind::Opened,
            StoreEventKind::Closed,
            StoreEventKind::Deleted,
        ]
    );

    let history = store.events().poll(0, 10);
    assert_eq!(history.len(), 5);
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
}
