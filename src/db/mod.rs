//! Database layer for swarmsync
//!
//! Handles SQLite persistence for the tracked file set and the per-file event
//! chains.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema bootstrap
//! - [`files`] — Tracked path CRUD, subtree moves, exclusion flags
//! - [`events`] — Event chain CRUD, head queries, replay, reaper queries

use sqlx::{FromRow, sqlite::SqlitePool};

use crate::error::{DatabaseError, Error};
use crate::types::{EventState, EventType, FileId};

mod events;
mod files;
mod migrations;

/// New tracked path to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewFile {
    /// Path relative to the sync root
    pub relative_path: String,
    /// True for directories
    pub is_folder: bool,
    /// Content hash of the current materialized content (None for folders)
    pub file_hash: Option<String>,
    /// Modification time, unix seconds
    pub mtime: i64,
    /// Size in bytes
    pub size: i64,
    /// Server-assigned file identity, when already known
    pub events_file_id: Option<i64>,
}

/// Tracked path record from the database
#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    /// Unique database ID
    pub id: FileId,
    /// Path relative to the sync root
    pub relative_path: String,
    /// True for directories
    pub is_folder: bool,
    /// Content hash of the current materialized content (None for folders)
    pub file_hash: Option<String>,
    /// Modification time, unix seconds
    pub mtime: i64,
    /// Size in bytes
    pub size: i64,
    /// Server-assigned file identity, nullable until first registration
    pub events_file_id: Option<i64>,
    /// True when the path lies inside an excluded directory
    pub excluded: bool,
    /// Set on modify, cleared on create
    pub was_updated: bool,
    /// Soft-delete marker; the chain survives until the reaper collects it
    pub deleted: bool,
}

/// New event to be appended to a file's chain
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Client-assigned uuid
    pub uuid: String,
    /// Server event id, when the event arrived from the remote log
    pub server_event_id: Option<i64>,
    /// The file this event belongs to
    pub file_id: FileId,
    /// Event type code (see [`EventType`])
    pub event_type: i32,
    /// File name after the event
    pub file_name: String,
    /// uuid of the containing folder's registration, when known
    pub folder_uuid: Option<String>,
    /// Content hash after the event
    pub file_hash: Option<String>,
    /// Content hash before the event
    pub file_hash_before_event: Option<String>,
    /// Size after the event
    pub file_size: i64,
    /// Size before the event
    pub file_size_before_event: i64,
    /// uuid of the direct patch producing this event's content
    pub diff_file_uuid: Option<String>,
    /// uuid of the reverse patch restoring the previous content
    pub rev_diff_file_uuid: Option<String>,
    /// Event state code (see [`EventState`])
    pub state: i32,
    /// Causal predecessor's server event id on the same file
    pub last_event_id: Option<i64>,
    /// Unix timestamp carried by the event
    pub timestamp: i64,
}

/// Event record from the database
#[derive(Debug, Clone, FromRow)]
pub struct EventRecord {
    /// Unique database ID
    pub id: i64,
    /// Client-assigned uuid
    pub uuid: String,
    /// Server event id; monotonic per file once assigned
    pub server_event_id: Option<i64>,
    /// The file this event belongs to
    pub file_id: FileId,
    /// Event type code (see [`EventType`])
    pub event_type: i32,
    /// File name after the event
    pub file_name: String,
    /// uuid of the containing folder's registration, when known
    pub folder_uuid: Option<String>,
    /// Content hash after the event
    pub file_hash: Option<String>,
    /// Content hash before the event
    pub file_hash_before_event: Option<String>,
    /// Size after the event
    pub file_size: i64,
    /// Size before the event
    pub file_size_before_event: i64,
    /// uuid of the direct patch producing this event's content
    pub diff_file_uuid: Option<String>,
    /// uuid of the reverse patch restoring the previous content
    pub rev_diff_file_uuid: Option<String>,
    /// Event state code (see [`EventState`])
    pub state: i32,
    /// Causal predecessor's server event id on the same file
    pub last_event_id: Option<i64>,
    /// Unix timestamp carried by the event
    pub timestamp: i64,
}

impl EventRecord {
    /// Typed event type
    pub fn event_type(&self) -> EventType {
        EventType::from_i32(self.event_type)
    }

    /// Typed event state
    pub fn state(&self) -> EventState {
        EventState::from_i32(self.state)
    }
}

/// Database handle for swarmsync
pub struct Database {
    pool: SqlitePool,
}

/// Map an sqlx error to the crate error, recognizing lock contention
///
/// Callers holding a soft lock receive [`DatabaseError::Busy`] and reschedule
/// themselves instead of blocking across subsystems.
pub(crate) fn map_db_err(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        let msg = db.message();
        if msg.contains("database is locked") || msg.contains("database table is locked") {
            return Error::Database(DatabaseError::Busy);
        }
    }
    Error::Sqlx(e)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
