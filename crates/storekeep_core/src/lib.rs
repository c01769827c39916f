//! # storekeep core
//!
//! Future-based access to versioned, schema-evolving key-value stores whose
//! engines speak a callback protocol (see `storekeep_engine`).
//!
//! The crate is built from three layers:
//!
//! - [`ConnectionManager`] opens, caches, closes and deletes named stores.
//! - [`Connection`] owns one store's engine handle and runs the
//!   version-upgrade protocol that creates collections and indexes.
//! - [`Collection`] performs record operations, each one engine
//!   transaction that resolves on commit.
//!
//! Everything is single-threaded: handles are `Rc`-shared and the futures
//! are `!Send`. Drive them from a current-thread runtime (inside a `tokio`
//! `LocalSet` when the engine defers its callbacks).
//!
//! ## Example
//!
//! ```rust
//! use futures_util::FutureExt;
//! use serde_json::json;
//! use storekeep_core::{CollectionOptions, ConnectionManager};
//! use storekeep_engine::MemoryEngine;
//!
//! # async fn run() -> storekeep_core::StoreResult<()> {
//! let manager = ConnectionManager::new(MemoryEngine::new());
//! let db = manager.open("app").await?;
//! let notes = db
//!     .create_collection("notes", CollectionOptions::new().auto_increment(true))
//!     .await?;
//!
//! let key = notes.add(json!({"text": "hello"}), None).await?;
//! assert_eq!(notes.get(key).await?, Some(json!({"text": "hello"})));
//! # Ok(())
//! # }
//! # run().now_or_never().unwrap().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod completion;
mod config;
mod connection;
mod error;
mod events;
mod index;
mod manager;
mod schema;
mod types;

pub use collection::Collection;
pub use config::Config;
pub use connection::Connection;
pub use error::{ErrorPolicy, Phase, StoreError, StoreResult};
pub use events::{EventFeed, StoreEvent, StoreEventKind};
pub use index::Index;
pub use manager::{ConnectionManager, ConnectionRef};
pub use schema::{SchemaChange, UpgradeOutcome, UpgradeState};
pub use types::{CollectionInfo, CollectionOptions, IndexOptions};

// Re-export the engine types callers need for records and keys.
pub use storekeep_engine::{Direction, Key, KeyRange, Record};
