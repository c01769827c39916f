//! Error types reported by storage engines.

use std::fmt;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// The kind of failure an engine reports.
///
/// Kinds mirror the exception names browsers use for IndexedDB, so an
/// engine backed by a real browser store can map its errors one to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// A uniqueness rule was violated, or the entity already exists.
    Constraint,
    /// The requested version is lower than the stored version.
    Version,
    /// The transaction was aborted.
    Abort,
    /// The engine ran out of storage quota.
    QuotaExceeded,
    /// A named collection or index does not exist.
    NotFound,
    /// The handle or request is in the wrong state (for example closed).
    InvalidState,
    /// A write was attempted in a read-only transaction.
    ReadOnly,
    /// A request was issued on a finished transaction.
    TransactionInactive,
    /// The supplied data or key is not valid.
    Data,
    /// Anything else.
    Unknown,
}

impl EngineErrorKind {
    /// Returns the exception name for this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Constraint => "ConstraintError",
            Self::Version => "VersionError",
            Self::Abort => "AbortError",
            Self::QuotaExceeded => "QuotaExceededError",
            Self::NotFound => "NotFoundError",
            Self::InvalidState => "InvalidStateError",
            Self::ReadOnly => "ReadOnlyError",
            Self::TransactionInactive => "TransactionInactiveError",
            Self::Data => "DataError",
            Self::Unknown => "UnknownError",
        }
    }

    /// Maps an exception name back to a kind.
    ///
    /// Unrecognized names map to [`EngineErrorKind::Unknown`].
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "ConstraintError" => Self::Constraint,
            "VersionError" => Self::Version,
            "AbortError" => Self::Abort,
            "QuotaExceededError" => Self::QuotaExceeded,
            "NotFoundError" => Self::NotFound,
            "InvalidStateError" => Self::InvalidState,
            "ReadOnlyError" => Self::ReadOnly,
            "TransactionInactiveError" => Self::TransactionInactive,
            "DataError" => Self::Data,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error reported by a storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    /// What went wrong.
    pub kind: EngineErrorKind,
    /// Engine supplied detail.
    pub message: String,
}

impl EngineError {
    /// Creates an error of the given kind.
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a constraint error.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Constraint, message)
    }

    /// Creates a version error.
    pub fn version(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Version, message)
    }

    /// Creates an abort error.
    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Abort, message)
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NotFound, message)
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::InvalidState, message)
    }

    /// Creates a data error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Data, message)
    }

    /// Returns true if this is a constraint error.
    #[must_use]
    pub fn is_constraint(&self) -> bool {
        self.kind == EngineErrorKind::Constraint
    }
}
