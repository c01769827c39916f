//! Lifecycle and record notifications.
//!
//! The manager and its connections report lifecycle changes (opens, closes,
//! deletions, version changes, created collections and indexes) and
//! committed record operations to an [`EventFeed`]. Subscribers receive every event emitted after they
//! subscribe; recent history can be polled by sequence number.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(MemoryEngine::new());
//! let events = manager.subscribe();
//!
//! let db = manager.open("app").await?;
//! db.create_collection("notes", CollectionOptions::new()).await?;
//!
//! while let Ok(event) = events.try_recv() {
//!     println!("{event:?}");
//! }
//! ```

use parking_lot::RwLock;
use storekeep_engine::Key;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// Kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    /// An existing store was opened.
    Opened,
    /// Opening created the store (the upgrade callback ran).
    Upgraded,
    /// The store was opened at a version other than the one requested.
    VersionNegotiated,
    /// A connection was closed.
    Closed,
    /// A store was deleted.
    Deleted,
    /// A collection was created.
    CollectionCreated,
    /// An index was created.
    IndexCreated,
    /// A record was added and committed.
    RecordAdded,
    /// A single record was read.
    RecordRead,
    /// A key range was scanned.
    Scanned,
    /// A key was removed.
    RecordRemoved,
    /// A collection was cleared.
    Cleared,
}

/// A single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Sequence number, assigned on emit.
    pub sequence: u64,
    /// What happened.
    pub kind: StoreEventKind,
    /// Store name.
    pub store: String,
    /// Store version after the event, if known.
    pub version: Option<u64>,
    /// Collection involved, if any.
    pub collection: Option<String>,
    /// Index involved, if any.
    pub index: Option<String>,
    /// Record key involved, if any.
    pub key: Option<Key>,
}

impl StoreEvent {
    /// Creates an event about `store`.
    pub fn new(kind: StoreEventKind, store: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            kind,
            store: store.into(),
            version: None,
            collection: None,
            index: None,
            key: None,
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the collection.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Sets the index.
    #[must_use]
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Sets the record key.
    #[must_use]
    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }
}

/// Distributes events to subscribers.
///
/// Events keep emit order. Receivers that have been dropped are removed on
/// the next emit.
pub struct EventFeed {
    subscribers: RwLock<Vec<Sender<StoreEvent>>>,
    history: RwLock<VecDeque<StoreEvent>>,
    max_history: usize,
    sequence: AtomicU64,
}

impl EventFeed {
    /// Creates a feed with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(1000)
    }

    /// Creates a feed with a specific history limit.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
            sequence: AtomicU64::new(0),
        }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Assigns the next sequence number to `event` and distributes it.
    /// Returns the assigned sequence number.
    pub fn emit(&self, mut event: StoreEvent) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        event.sequence = sequence;

        {
            let mut history = self.history.write();
            history.push_back(event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        sequence
    }

    /// Returns events with a sequence number above `cursor`, up to `limit`.
    #[must_use]
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<StoreEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest sequence number emitted.
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns the number of events in history.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("latest_sequence", &self.latest_sequence())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_receive() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();

        let sequence = feed.emit(StoreEvent::new(StoreEventKind::Opened, "db").with_version(1));
        assert_eq!(sequence, 1);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, StoreEventKind::Opened);
        assert_eq!(received.version, Some(1));
        assert_eq!(received.sequence, 1);
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(StoreEvent::new(StoreEventKind::Closed, "db"));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn poll_from_cursor() {
        let feed = EventFeed::new();
        for _ in 0..5 {
            feed.emit(StoreEvent::new(StoreEventKind::CollectionCreated, "db").with_collection("c"));
        }

        let events = feed.poll(2, 10);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        assert_eq!(feed.poll(0, 2).len(), 2);
    }

    #[test]
    fn record_events_carry_the_key() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();
        feed.emit(
            StoreEvent::new(StoreEventKind::RecordRemoved, "db")
                .with_collection("notes")
                .with_key(Key::from("k1")),
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.collection.as_deref(), Some("notes"));
        assert_eq!(event.key, Some(Key::from("k1")));
    }

    #[test]
    fn history_truncation() {
        let feed = EventFeed::with_max_history(3);
        for _ in 0..10 {
            feed.emit(StoreEvent::new(StoreEventKind::Opened, "db"));
        }
        assert_eq!(feed.history_len(), 3);
        assert_eq!(feed.poll(0, 100)[0].sequence, 8);
        assert_eq!(feed.latest_sequence(), 10);
    }
}
