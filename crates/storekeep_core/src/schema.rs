//! The version-upgrade protocol.
//!
//! Collections and indexes can only be created inside an upgrade
//! transaction, and the engine only starts one when a store is opened at a
//! version above its current one. A schema change therefore closes the
//! connection's handle, reopens the store at `version + 1` and applies the
//! change from inside the upgrade callback.
//!
//! Two facts are tracked separately: whether the change ran (or was found
//! already applied) inside the upgrade callback, and whether the open
//! itself succeeded. An open that succeeds without the callback having run
//! is reported as [`StoreError::UpgradeNotTriggered`](crate::StoreError::UpgradeNotTriggered).

use crate::completion::completion;
use crate::error::{log_engine_error, ErrorPolicy, Phase, StoreResult};
use crate::types::{CollectionOptions, IndexOptions};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use storekeep_engine::{
    CollectionParams, DatabaseHandle, Engine, EngineError, EngineResult, OpenEvent,
    SchemaTransaction,
};
use tracing::debug;

/// A schema change that needs a version upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// Create a collection.
    CreateCollection {
        /// Collection name.
        name: String,
        /// Collection options.
        options: CollectionOptions,
    },
    /// Create an index on an existing collection.
    CreateIndex {
        /// Collection name.
        collection: String,
        /// Index name.
        name: String,
        /// Key path of the index.
        key_path: String,
        /// Index options.
        options: IndexOptions,
    },
}

impl SchemaChange {
    /// The collection this change touches.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::CreateCollection { name, .. } => name,
            Self::CreateIndex { collection, .. } => collection,
        }
    }

    /// Returns true if the store behind `handle` already has this change.
    pub(crate) fn is_applied(&self, handle: &dyn DatabaseHandle) -> bool {
        match self {
            Self::CreateCollection { name, .. } => handle.describe(name).is_ok(),
            Self::CreateIndex {
                collection, name, ..
            } => handle.describe_index(collection, name).is_ok(),
        }
    }

    fn apply(&self, schema: &mut dyn SchemaTransaction) -> EngineResult<()> {
        match self {
            Self::CreateCollection { name, options } => {
                schema.create_collection(name, &CollectionParams::from(options))?;
            }
            Self::CreateIndex {
                collection,
                name,
                key_path,
                options,
            } => {
                schema.create_index(collection, name, key_path, &(*options).into())?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateCollection { name, .. } => write!(f, "create collection {name}"),
            Self::CreateIndex {
                collection, name, ..
            } => write!(f, "create index {name} on {collection}"),
        }
    }
}

/// Where a connection is in the upgrade protocol.
///
/// The state returns to `Idle` only when a new upgrade starts; between
/// upgrades it holds the outcome of the last one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpgradeState {
    /// No upgrade has run yet.
    #[default]
    Idle,
    /// Checking the requested change.
    Validating,
    /// Closing the current handle.
    Closing,
    /// Waiting for the reopen at the new version.
    Reopening,
    /// Inside the upgrade callback.
    Upgrading,
    /// The change was applied.
    Applied,
    /// The change was already present.
    AlreadyApplied,
    /// Another connection blocked the upgrade.
    Blocked,
    /// The upgrade failed.
    Failed,
}

impl UpgradeState {
    /// Returns true for states in which an upgrade is in flight.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::Validating | Self::Closing | Self::Reopening | Self::Upgrading
        )
    }
}

/// How a successful upgrade ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The change ran inside the upgrade callback.
    Applied,
    /// The engine reported the entity as already present.
    AlreadyApplied,
}

impl From<UpgradeOutcome> for UpgradeState {
    fn from(outcome: UpgradeOutcome) -> Self {
        match outcome {
            UpgradeOutcome::Applied => Self::Applied,
            UpgradeOutcome::AlreadyApplied => Self::AlreadyApplied,
        }
    }
}

/// State of one in-flight version bump, shared with the upgrade callback.
pub(crate) struct PendingUpgrade {
    store: String,
    target_version: u64,
    change: SchemaChange,
    outcome: Cell<Option<UpgradeOutcome>>,
    failure: RefCell<Option<EngineError>>,
}

impl PendingUpgrade {
    pub(crate) fn new(store: &str, target_version: u64, change: SchemaChange) -> Self {
        Self {
            store: store.to_string(),
            target_version,
            change,
            outcome: Cell::new(None),
            failure: RefCell::new(None),
        }
    }

    pub(crate) fn target_version(&self) -> u64 {
        self.target_version
    }

    /// Runs inside the upgrade callback.
    pub(crate) fn run(&self, schema: &mut dyn SchemaTransaction) {
        match self.change.apply(schema) {
            Ok(()) => {
                debug!(store = %self.store, version = self.target_version, change = %self.change, "schema change applied");
                self.outcome.set(Some(UpgradeOutcome::Applied));
            }
            Err(err) => {
                log_engine_error(&err, Phase::SchemaChange, &self.store);
                match ErrorPolicy::for_engine(err.kind, Phase::SchemaChange) {
                    ErrorPolicy::Absorb => {
                        self.outcome.set(Some(UpgradeOutcome::AlreadyApplied));
                    }
                    ErrorPolicy::Surface | ErrorPolicy::Retryable => {
                        *self.failure.borrow_mut() = Some(err);
                        schema.abort();
                    }
                }
            }
        }
    }

    /// The outcome recorded by the upgrade callback, if it ran cleanly.
    pub(crate) fn outcome(&self) -> Option<UpgradeOutcome> {
        self.outcome.get()
    }

    /// The error raised by the change itself, if any.
    pub(crate) fn take_failure(&self) -> Option<EngineError> {
        self.failure.borrow_mut().take()
    }
}

/// Terminal result of one engine open request.
pub(crate) enum OpenOutcome {
    Opened {
        handle: Rc<dyn DatabaseHandle>,
        /// The upgrade callback ran.
        upgraded: bool,
    },
    Blocked {
        current_version: u64,
    },
    Failed(EngineError),
}

/// Opens `name` at `version` and waits for the terminal event. The upgrade
/// callback, if the engine runs one, is handed to `on_upgrade`.
///
/// A success that arrives after the request was already settled closes the
/// delivered handle.
pub(crate) async fn open_store(
    engine: &dyn Engine,
    name: &str,
    version: Option<u64>,
    mut on_upgrade: impl FnMut(&mut dyn SchemaTransaction) + 'static,
) -> StoreResult<OpenOutcome> {
    let (done, pending) = completion::<OpenOutcome>("open");
    let mut upgraded = false;
    let store = name.to_string();

    engine.open(
        name,
        version,
        Box::new(move |event| match event {
            OpenEvent::UpgradeNeeded {
                old_version,
                new_version,
                schema,
            } => {
                debug!(store = %store, old_version, new_version, "upgrade needed");
                upgraded = true;
                on_upgrade(schema);
            }
            OpenEvent::Success(handle) => {
                if let Err(Ok(OpenOutcome::Opened { handle, .. })) =
                    done.settle(Ok(OpenOutcome::Opened { handle, upgraded }))
                {
                    handle.close();
                }
            }
            OpenEvent::Blocked { current_version } => {
                done.resolve(OpenOutcome::Blocked { current_version });
            }
            OpenEvent::Error(err) => done.resolve(OpenOutcome::Failed(err)),
        }),
    );

    pending.wait().await
}
