//! Core types for swarmsync

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Block size used for file signatures and patch blocks (1 MiB)
pub const SIGNATURE_BLOCK_SIZE: u64 = 1024 * 1024;

/// Size of one data request issued to a peer (1 MiB)
pub const DOWNLOAD_PART_SIZE: u64 = 1024 * 1024;

/// Granularity of chunk accounting within a part (64 KiB)
pub const DOWNLOAD_CHUNK_SIZE: u64 = 64 * 1024;

/// md5 hex digest of the empty byte string; the canonical hash of an empty file
pub const EMPTY_FILE_HASH: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// Files below this size never get patches; a full copy is always transferred
pub const MIN_DIFF_SIZE: u64 = 11 * 1024;

/// Maximum length of a single file name component
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Suffix of a path-companion stub file carrying a remote file identity
pub const FILE_LINK_SUFFIX: &str = ".pvtbox";

/// Name of the hidden state directory under the sync root
pub const STATE_DIR_NAME: &str = ".pvtbox";

/// Download priority constants; higher values win
pub mod download_priority {
    /// A full-file copy needed to materialize a remote event
    pub const FILE: u32 = 10_000;
    /// Threshold above which tasks drive user-visible progress
    pub const IMPORTANT: u32 = 9_500;
    /// A direct patch wanted to advance the current head
    pub const WANTED_DIRECT_PATCH: u32 = 1_000;
    /// A reverse patch kept for backup mode
    pub const REVERSED_PATCH: u32 = 100;
    /// A direct patch with no immediate consumer
    pub const DIRECT_PATCH: u32 = 10;
}

/// Unique identifier of a tracked path in the local storage
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl FileId {
    /// Create a new FileId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for FileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<FileId> for i64 {
    fn from(id: FileId) -> Self {
        id.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for FileId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for FileId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for FileId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Type of a registered file event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A new file or folder appeared
    Create,
    /// File content changed
    Update,
    /// File or folder was renamed or relocated
    Move,
    /// File or folder was removed
    Delete,
}

impl EventType {
    /// Convert integer code to EventType
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => EventType::Create,
            1 => EventType::Update,
            2 => EventType::Move,
            _ => EventType::Delete,
        }
    }

    /// Convert EventType to integer code
    pub fn to_i32(&self) -> i32 {
        match self {
            EventType::Create => 0,
            EventType::Update => 1,
            EventType::Move => 2,
            EventType::Delete => 3,
        }
    }
}

/// State of an event within the per-file chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    /// Local event proposed to the server, awaiting a server event id
    Sent,
    /// Remote event ingested but its content is not yet present locally
    Received,
    /// Content (copy or patch chain) is present locally
    Downloaded,
    /// Materialized on disk; the chain head
    Applied,
    /// Lost a concurrent-edit race; superseded by a remote event
    Conflicted,
    /// A discarded local chain entry kept for bookkeeping
    Occupied,
}

impl EventState {
    /// Convert integer code to EventState
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => EventState::Sent,
            1 => EventState::Received,
            2 => EventState::Downloaded,
            3 => EventState::Applied,
            4 => EventState::Conflicted,
            _ => EventState::Occupied,
        }
    }

    /// Convert EventState to integer code
    pub fn to_i32(&self) -> i32 {
        match self {
            EventState::Sent => 0,
            EventState::Received => 1,
            EventState::Downloaded => 2,
            EventState::Applied => 3,
            EventState::Conflicted => 4,
            EventState::Occupied => 5,
        }
    }
}

/// Class of an object transferred between peers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// A full-file copy, addressed by event uuid
    File,
    /// A binary patch, addressed by patch uuid
    Patch,
}

impl ObjectType {
    /// Convert wire code to ObjectType
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(ObjectType::File),
            2 => Some(ObjectType::Patch),
            _ => None,
        }
    }

    /// Convert ObjectType to wire code
    pub fn to_i32(&self) -> i32 {
        match self {
            ObjectType::File => 1,
            ObjectType::Patch => 2,
        }
    }
}

/// Top-level synchronization status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Engine constructed but not started
    Init,
    /// No signalling connection
    Disconnected,
    /// Local pipeline or event queue busy, transfers idle
    Indexing,
    /// Transfers in flight
    InWork,
    /// Fully caught up
    Wait,
    /// User-requested pause; sticky until resumed
    Pause,
}

/// Substatus qualifying what kind of work is in flight
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSubstatus {
    /// Regular synchronization traffic
    Sync,
    /// Share download in progress
    Share,
    /// Applying remote mutations to disk
    Apply,
}

/// Aggregated work counters published with each status update
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    /// Local events awaiting registration
    pub local_events: usize,
    /// Remote events awaiting application
    pub remote_events: usize,
    /// Raw filesystem events in the pipeline
    pub fs_events: usize,
    /// Events removed by the old-event reaper since start
    pub events_erased: usize,
}

/// Entry of the most-recently-changed file list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListEntry {
    /// Path relative to the sync root
    pub path: PathBuf,
    /// Unix timestamp of the change
    pub timestamp: i64,
    /// True when the entry was produced by a delete
    pub deleted: bool,
}

/// Event emitted through the engine's broadcast channel
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A file appeared in the tree
    FileAdded {
        /// Path relative to the sync root
        path: PathBuf,
    },

    /// A file's content changed
    FileModified {
        /// Path relative to the sync root
        path: PathBuf,
    },

    /// A file or folder moved
    FileMoved {
        /// Previous path relative to the sync root
        src: PathBuf,
        /// New path relative to the sync root
        dst: PathBuf,
    },

    /// A file or folder was removed
    FileDeleted {
        /// Path relative to the sync root
        path: PathBuf,
    },

    /// Status machine transition
    StatusChanged {
        /// New top-level status
        status: SyncStatus,
        /// Substatus qualifier
        substatus: SyncSubstatus,
        /// Work counters at the time of the transition
        counters: SyncCounters,
    },

    /// Download progress for user-visible transfers
    DownloadProgress {
        /// Display name of the object being transferred
        name: String,
        /// Bytes received so far
        received: u64,
        /// Total object size
        size: u64,
    },

    /// Disk is too full to stage new content
    NoDiskSpace {
        /// Display name of the operation that hit the condition
        name: String,
        /// True when an in-flight transfer was aborted (not just deferred)
        is_error: bool,
    },

    /// An operation was denied by the OS
    AccessDenied {
        /// Path relative to the sync root
        path: PathBuf,
    },

    /// The sync root itself appears to have been removed
    SyncFolderRemoved,

    /// Request issuance is parked on the rate limiter
    NetworkLimited,

    /// The rate-limiter condition cleared
    NetworkOk,

    /// A path exceeded the configured length limit and was quarantined
    LongPathIgnored {
        /// Offending path relative to the sync root
        path: PathBuf,
    },

    /// A concurrent-edit conflict produced a renamed local copy
    ConflictCreated {
        /// Path of the conflict copy relative to the sync root
        path: PathBuf,
    },

    /// An attempted move of a collaboration folder was reverted
    CollaborationMoveReverted {
        /// Original path of the collaboration folder
        path: PathBuf,
    },

    /// The recently-changed file list was updated
    FileListChanged {
        /// The current list, most recent first
        entries: Vec<FileListEntry>,
    },

    /// The account license was downgraded; registration of new local events pauses
    LicenseDowngraded,
}
