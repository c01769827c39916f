//! # storekeep testkit
//!
//! Test utilities for storekeep.
//!
//! This crate provides:
//! - Fixtures pairing a [`ConnectionManager`](storekeep_core::ConnectionManager)
//!   with an inspectable in-memory engine
//! - Helpers that open stores behind the manager's back, to play the part
//!   of another tab or process
//! - Runners for futures on a current-thread runtime
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storekeep_testkit::prelude::*;
//!
//! #[test]
//! fn creates_collection() {
//!     let store = TestStore::memory();
//!     let db = ready(store.open("app")).unwrap();
//!     let notes = ready(db.create_collection("notes", CollectionOptions::new())).unwrap();
//!     assert_eq!(notes.name(), "notes");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
