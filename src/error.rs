//! Error types for swarmsync
//!
//! This module provides error handling for the engine:
//! - Domain-specific error types (Database, Event, Apply, Download, Protocol)
//! - A top-level [`Error`] aggregating them for crate-boundary results
//!
//! Components recover locally where possible (retry, requeue); cross-component
//! failures surface as typed variants that the orchestrator consumes.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for swarmsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for swarmsync
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "root")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Event chain error
    #[error("event error: {0}")]
    Event(#[from] EventError),

    /// Error applying a remote mutation to the filesystem
    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Peer protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem watching error
    #[error("monitor error: {0}")]
    Monitor(String),

    /// Insufficient disk space
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// The sync root directory is gone; all subsystems must stop
    #[error("sync folder is missing")]
    SyncFolderRemoved,

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to create schema
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// A soft-lock acquisition timed out; the caller must reschedule itself
    #[error("database busy")]
    Busy,
}

/// Event chain errors
#[derive(Debug, Error)]
pub enum EventError {
    /// The proposed event diverges from the registered chain
    #[error("event {uuid} conflicts with the registered chain")]
    Conflicted {
        /// Client uuid of the conflicting event
        uuid: String,
    },

    /// The event uuid is already present in the chain
    #[error("event {uuid} already added")]
    AlreadyAdded {
        /// Client uuid of the duplicate event
        uuid: String,
    },

    /// The server rejected the proposed predecessor
    #[error("event {uuid} proposed stale predecessor {proposed_last_event_id:?}")]
    StalePredecessor {
        /// Client uuid of the rejected event
        uuid: String,
        /// The predecessor id the proposal carried
        proposed_last_event_id: Option<i64>,
    },

    /// A remote event references a file identity we do not know
    #[error("unknown file identity {events_file_id}")]
    UnknownFile {
        /// Server-assigned file identity
        events_file_id: i64,
    },

    /// A predecessor of a remote event has not been applied yet
    #[error("event {uuid} is missing predecessor {last_event_id}")]
    MissingPredecessor {
        /// Client uuid of the out-of-order event
        uuid: String,
        /// The predecessor server event id that is not applied yet
        last_event_id: i64,
    },
}

/// Errors raised while applying remote decisions to the filesystem
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The patch target already carries the patch result
    #[error("file already patched")]
    AlreadyPatched,

    /// The target file does not exist
    #[error("file not found: {path}")]
    FileNotFound {
        /// The missing path
        path: PathBuf,
    },

    /// The OS denied the operation
    #[error("access denied: {path}")]
    AccessDenied {
        /// The path the OS refused to touch
        path: PathBuf,
    },

    /// The local record carries a different authoritative file identity
    #[error("wrong file id: expected {expected:?}, found {actual:?}")]
    WrongFileId {
        /// Identity the operation expected
        expected: Option<i64>,
        /// Identity the local record carries
        actual: Option<i64>,
    },

    /// No copy blob exists for the requested hash
    #[error("copy does not exist for hash {hash}")]
    CopyDoesNotExist {
        /// Content hash with no materialized blob
        hash: String,
    },

    /// The on-disk file's hash does not match the patch's expected source
    #[error("patch source mismatch: expected {expected:?}, found {actual:?}")]
    PatchSourceMismatch {
        /// Hash the patch expects the file to have
        expected: Option<String>,
        /// Hash the file actually has
        actual: Option<String>,
    },
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The reconstructed object's hash did not match after all retries
    #[error("download {obj_id} failed hash verification")]
    WrongHash {
        /// Object id of the failing task
        obj_id: String,
    },

    /// No peer currently offers any wanted range
    #[error("download {obj_id} has no available peers")]
    PeersUnavailable {
        /// Object id of the stalled task
        obj_id: String,
    },

    /// Insufficient disk space to stage the download
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the download
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// The task was cancelled
    #[error("download {obj_id} cancelled")]
    Cancelled {
        /// Object id of the cancelled task
        obj_id: String,
    },

    /// Task not found in the scheduler
    #[error("download {obj_id} not found")]
    NotFound {
        /// Object id that was not found
        obj_id: String,
    },
}

/// Peer protocol failure codes carried by availability/data failure messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolError {
    /// The supplier's object changed identity under the subscription
    #[error("FILE_CHANGED")]
    FileChanged,

    /// The supplier does not know the requested event uuid
    #[error("UNKNOWN_EVENT_UUID")]
    UnknownEventUuid,

    /// The file exists but has not been registered with the server yet
    #[error("FILE_NOT_REGISTERED")]
    FileNotRegistered,

    /// The supplier cannot serve the requested range
    #[error("RANGE_UNAVAILABLE")]
    RangeUnavailable,

    /// The supplier is at its concurrent request limit
    #[error("BUSY")]
    Busy,
}

impl Error {
    /// True when the error is transient and the operation may be retried in place
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Database(DatabaseError::Busy) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            Error::Download(DownloadError::PeersUnavailable { .. }) => true,
            _ => false,
        }
    }
}
