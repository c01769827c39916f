//! Error types for storekeep core.
//!
//! Every engine failure passes through [`ErrorPolicy::for_engine`] before it
//! reaches a caller. The policy is the only place that decides whether an
//! engine error is surfaced, reported as retryable, or absorbed as a sign
//! that the requested schema change already happened.

use storekeep_engine::{EngineError, EngineErrorKind};
use thiserror::Error;
use tracing::{debug, warn};

/// Result type for core operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storekeep operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Options, names or key paths are malformed.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// A record write violated a key or unique index constraint.
    #[error("constraint violated in collection {collection}: {message}")]
    Constraint {
        /// The collection written to.
        collection: String,
        /// Engine detail.
        message: String,
    },

    /// The store's version moved past the version this request needed.
    #[error("version conflict on store {store} at version {requested}: {message}")]
    VersionConflict {
        /// Store name.
        store: String,
        /// Version that was requested.
        requested: u64,
        /// Engine detail.
        message: String,
    },

    /// Another open connection prevents the version change.
    #[error("upgrade of store {store} to version {version} is blocked by another connection")]
    Blocked {
        /// Store name.
        store: String,
        /// Version that was requested.
        version: u64,
    },

    /// The engine ran out of storage quota.
    #[error("quota exceeded: {message}")]
    QuotaExceeded {
        /// Engine detail.
        message: String,
    },

    /// A record was added without a usable key.
    #[error("collection {collection} has no key path or key generator and no key was supplied")]
    MissingKey {
        /// The collection written to.
        collection: String,
    },

    /// The transaction was aborted; its writes were discarded.
    #[error("transaction on collection {collection} aborted: {reason}")]
    TransactionAborted {
        /// The collection in scope.
        collection: String,
        /// Reason for the abort.
        reason: String,
    },

    /// Another open connection prevents deleting the store.
    #[error("deletion of store {store} is blocked by another connection")]
    DeletionBlocked {
        /// Store name.
        store: String,
    },

    /// The reopen succeeded but the engine never ran the upgrade callback.
    #[error("store {store} opened at version {actual} without running the upgrade to version {requested}")]
    UpgradeNotTriggered {
        /// Store name.
        store: String,
        /// Version that was requested.
        requested: u64,
        /// Version the engine granted.
        actual: u64,
    },

    /// The connection is closed or has no live engine handle.
    #[error("connection to store {store} is closed")]
    ConnectionClosed {
        /// Store name.
        store: String,
    },

    /// Collection not found.
    #[error("collection {collection} not found in store {store}")]
    CollectionNotFound {
        /// Store name.
        store: String,
        /// Collection name.
        collection: String,
    },

    /// Index not found.
    #[error("index {index} not found on collection {collection}")]
    IndexNotFound {
        /// Collection name.
        collection: String,
        /// Index name.
        index: String,
    },

    /// The engine dropped a request without ever signalling it.
    #[error("{operation} was interrupted before the engine signalled completion")]
    Interrupted {
        /// The operation that was waiting.
        operation: String,
    },

    /// Any other engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl StoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a connection closed error.
    pub fn connection_closed(store: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            store: store.into(),
        }
    }

    /// Creates a collection not found error.
    pub fn collection_not_found(store: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::CollectionNotFound {
            store: store.into(),
            collection: collection.into(),
        }
    }

    /// Creates an interrupted error.
    pub fn interrupted(operation: impl Into<String>) -> Self {
        Self::Interrupted {
            operation: operation.into(),
        }
    }

    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Blocked { .. })
    }

    /// Returns the engine error kind behind this error, if there is one.
    #[must_use]
    pub fn engine_kind(&self) -> Option<EngineErrorKind> {
        match self {
            Self::Engine(err) => Some(err.kind),
            Self::Constraint { .. } => Some(EngineErrorKind::Constraint),
            Self::QuotaExceeded { .. } => Some(EngineErrorKind::QuotaExceeded),
            Self::TransactionAborted { .. } => Some(EngineErrorKind::Abort),
            Self::VersionConflict { .. } => Some(EngineErrorKind::Version),
            _ => None,
        }
    }
}

/// The step an engine error was reported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Opening a store.
    Open,
    /// Applying a schema change inside an upgrade.
    SchemaChange,
    /// A record write.
    RecordWrite,
    /// A record read.
    RecordRead,
    /// Deleting a store.
    Delete,
}

/// How an engine error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Reject the caller's future with the error.
    Surface,
    /// Reject, marking the error as retryable.
    Retryable,
    /// Treat the error as success: the entity already exists.
    Absorb,
}

impl ErrorPolicy {
    /// Decides how to handle an engine error of `kind` raised during `phase`.
    #[must_use]
    pub const fn for_engine(kind: EngineErrorKind, phase: Phase) -> Self {
        match (kind, phase) {
            (EngineErrorKind::Constraint, Phase::SchemaChange) => Self::Absorb,
            (EngineErrorKind::Version, Phase::Open | Phase::SchemaChange) => Self::Retryable,
            _ => Self::Surface,
        }
    }
}

/// Where an engine error happened, for turning it into a [`StoreError`].
#[derive(Debug, Clone)]
pub(crate) struct ErrorContext {
    pub(crate) store: String,
    pub(crate) collection: String,
    pub(crate) phase: Phase,
}

impl ErrorContext {
    pub(crate) fn new(store: &str, collection: &str, phase: Phase) -> Self {
        Self {
            store: store.to_string(),
            collection: collection.to_string(),
            phase,
        }
    }

    /// Logs an engine error and classifies it.
    pub(crate) fn classify(&self, err: EngineError) -> StoreError {
        log_engine_error(&err, self.phase, &self.store);
        match err.kind {
            EngineErrorKind::Constraint => StoreError::Constraint {
                collection: self.collection.clone(),
                message: err.message,
            },
            EngineErrorKind::QuotaExceeded => StoreError::QuotaExceeded {
                message: err.message,
            },
            EngineErrorKind::Abort => StoreError::TransactionAborted {
                collection: self.collection.clone(),
                reason: err.message,
            },
            EngineErrorKind::NotFound if !self.collection.is_empty() => {
                StoreError::collection_not_found(&self.store, &self.collection)
            }
            EngineErrorKind::InvalidState if self.phase != Phase::Open => {
                StoreError::connection_closed(&self.store)
            }
            _ => StoreError::Engine(err),
        }
    }
}

/// Logs an engine error with its exception name.
pub(crate) fn log_engine_error(err: &EngineError, phase: Phase, store: &str) {
    match ErrorPolicy::for_engine(err.kind, phase) {
        ErrorPolicy::Absorb => {
            debug!(store, phase = ?phase, error = err.kind.name(), message = %err.message, "engine error absorbed");
        }
        ErrorPolicy::Surface | ErrorPolicy::Retryable => {
            warn!(store, phase = ?phase, error = err.kind.name(), message = %err.message, "engine error");
        }
    }
}
