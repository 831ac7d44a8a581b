//! Error types for the move-update engine and its store.
//!
//! Each subsystem has its own error type derived with `thiserror`, and the
//! engine-level [`WcError`] unifies them for callers of the public entry
//! points in [`crate::update_move`].

use thiserror::Error;

// ---------------------------------------------------------------------------
// Engine-level error
// ---------------------------------------------------------------------------

/// Error returned by working-copy operations.
#[derive(Debug, Error)]
pub enum WcError {
    /// The caller does not own a write lock covering the path.
    #[error("No write-lock in '{0}'")]
    NotLocked(String),

    /// A lock request overlaps a lock that is already held.
    #[error("'{0}' is already locked")]
    AlreadyLocked(String),

    /// The node has no move link recorded on its deletion layer.
    #[error("The node '{0}' has not been moved away")]
    NotMovedAway(String),

    /// The move source op root has no layer below its deletion.
    #[error("'{0}' is not deleted")]
    NotDeleted(String),

    /// Nodes below the move source are at different revisions.
    #[error(
        "Cannot apply update because move source '{0}' is a mixed-revision working copy"
    )]
    MixedRevision(String),

    /// A node below the move source points at an unexpected repository path.
    #[error("Cannot apply update because move source '{0}' is a switched subtree")]
    SwitchedSubtree(String),

    /// The victim's conflict was not raised by an update or a switch.
    #[error("Cannot auto-resolve tree-conflict on '{0}'")]
    CannotAutoResolve(String),

    /// A layer expected at a path was not there.
    #[error("The node '{0}' was not found")]
    PathNotFound(String),

    /// A node had a different kind than the edit requires.
    #[error("unexpected kind for '{path}': expected {expected}, found {found}")]
    UnexpectedKind {
        path: String,
        expected: String,
        found: String,
    },

    /// The cancellation check asked the walk to stop.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Pristine(#[from] PristineError),

    #[error(transparent)]
    WorkQueue(#[from] WorkQueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O wrapper.
    #[error("working copy I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from reading, writing or raising conflict descriptors.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// No conflict descriptor is recorded on the node.
    #[error("'{0}' is not in conflict")]
    NotInConflict(String),

    /// The descriptor exists but is not an update/switch tree conflict.
    #[error("'{0}' is not a tree-conflict victim")]
    NotTreeConflictVictim(String),

    /// The node carries a conflict from an operation other than update/switch.
    #[error("'{0}' already in conflict from a different operation")]
    ResolverFailure(String),

    /// The node already has a tree conflict that disagrees with the new one.
    #[error("'{0}' already in conflict")]
    Obstructed(String),

    /// The descriptor lacks the old/new repository locations.
    #[error("conflict on '{0}' has no location information")]
    MissingLocations(String),

    /// The stored descriptor could not be decoded.
    #[error("invalid conflict descriptor on '{path}': {detail}")]
    InvalidDescriptor { path: String, detail: String },

    /// Three-way merge failed.
    #[error("three-way merge failed: {0}")]
    MergeFailed(String),

    /// Database error when persisting conflict data.
    #[error("conflict database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// The on-disk format is newer than this library understands.
    #[error("unsupported working copy format {found} (expected at most {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    /// Creating the schema failed.
    #[error("schema creation failed (format {version}): {detail}")]
    SchemaFailed { version: u32, detail: String },

    /// A requested row was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// JSON encoding or decoding of a stored column failed.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (e.g. creating the database file's directory).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Pristine store errors
// ---------------------------------------------------------------------------

/// Errors from the checksum-addressed pristine store.
#[derive(Debug, Error)]
pub enum PristineError {
    /// No pristine text is stored for the checksum.
    #[error("pristine text with checksum '{0}' not found")]
    NotFound(String),

    /// Database error when touching the pristine index.
    #[error("pristine database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    /// Generic I/O wrapper.
    #[error("pristine I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Work queue errors
// ---------------------------------------------------------------------------

/// Errors from enqueueing or running deferred filesystem work.
#[derive(Debug, Error)]
pub enum WorkQueueError {
    /// A stored work item could not be decoded.
    #[error("invalid work item {id}: {detail}")]
    InvalidItem { id: i64, detail: String },

    /// Filesystem error while applying an item.
    #[error("work item on '{path}' failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pristine(#[from] PristineError),

    /// Database error when reading or removing items.
    #[error("work queue database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl From<rusqlite::Error> for WcError {
    fn from(e: rusqlite::Error) -> Self {
        WcError::Database(DatabaseError::SqliteError(e))
    }
}
