//! # storekeep engine
//!
//! The callback contract between storekeep and a storage engine, plus an
//! in-memory engine that implements it.
//!
//! Engines speak the event model of browser IndexedDB: opening a store at a
//! higher version runs an upgrade callback in which collections and indexes
//! may be created, and every transaction ends with exactly one of
//! `complete`, `abort` or `error`. Everything here is single-threaded;
//! handles are `Rc`-shared and callbacks are plain boxed closures.
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - For testing and ephemeral stores
//!
//! ## Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use storekeep_engine::{CollectionParams, DatabaseHandle, Engine, MemoryEngine, OpenEvent};
//!
//! let engine = MemoryEngine::new();
//! let opened = Rc::new(RefCell::new(None));
//! let slot = Rc::clone(&opened);
//! engine.open("app", Some(1), Box::new(move |event| match event {
//!     OpenEvent::UpgradeNeeded { schema, .. } => {
//!         schema.create_collection("notes", &CollectionParams::default()).unwrap();
//!     }
//!     OpenEvent::Success(handle) => *slot.borrow_mut() = Some(handle),
//!     _ => {}
//! }));
//!
//! let handle = opened.borrow_mut().take().unwrap();
//! assert_eq!(handle.version(), 1);
//! assert_eq!(handle.collection_names(), vec!["notes".to_string()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod key;
mod key_path;
mod memory;

pub use engine::{
    CollectionMeta, CollectionParams, CollectionRequests, CursorCallback, CursorEntry, CursorStep,
    DatabaseHandle, DeleteEvent, DeleteListener, Engine, IndexMeta, IndexParams, OpenEvent,
    OpenListener, Record, RequestCallback, SchemaTransaction, TransactionEvent, TransactionHandle,
    TransactionListener, TransactionMode,
};
pub use error::{EngineError, EngineErrorKind, EngineResult};
pub use key::{Direction, Key, KeyRange};
pub use key_path::KeyPath;
pub use memory::{EngineStats, Fault, MemoryEngine};
