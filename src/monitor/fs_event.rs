//! Transient pipeline record for one filesystem change.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::db::FileRecord;
use crate::rsync::Signature;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Raw filesystem event type as seen by the watcher
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FsEventType {
    /// A path appeared
    Create,
    /// A path's content or metadata changed
    Modify,
    /// A path was renamed (src and dst known)
    Move,
    /// A path disappeared
    Delete,
}

/// One filesystem change moving through the action pipeline
///
/// Pipeline stages progressively attach context (storage record, hashes,
/// signatures, a staged recent copy) so downstream components can classify
/// and register the event without further disk access.
#[derive(Debug, Clone)]
pub struct FsEvent {
    /// Monotonic local id; also names the recent-copy staging file
    pub id: u64,
    /// Event type; stages may rewrite it during classification
    pub event_type: FsEventType,
    /// Affected path relative to the sync root
    pub src: PathBuf,
    /// Destination path for moves, relative to the sync root
    pub dst: Option<PathBuf>,
    /// True for directories
    pub is_dir: bool,
    /// Unix timestamp the event entered the pipeline
    pub time: i64,
    /// Derived from the startup disk scan rather than the live watcher
    pub is_offline: bool,
    /// Originated from applying a remote decision; never re-registered
    pub quiet: bool,
    /// Matching storage record, attached by the load-info stage
    pub file: Option<FileRecord>,
    /// Content hash before the event
    pub old_hash: Option<String>,
    /// Signature before the event
    pub old_signature: Option<Signature>,
    /// Content hash after the event
    pub new_hash: Option<String>,
    /// Signature after the event
    pub new_signature: Option<Signature>,
    /// Staged full-file copy awaiting promotion to a content-addressed blob
    pub recent_copy: Option<PathBuf>,
    /// Size after the event
    pub file_size: u64,
    /// Modification time after the event, unix seconds
    pub mtime: i64,
    /// Modification time recorded in storage before the event
    pub old_mtime: i64,
    /// Size recorded in storage before the event
    pub old_size: u64,
    /// True when the path matched a storage record
    pub in_storage: bool,
    /// True when the event came in through a path-companion stub file
    pub is_link: bool,
    /// Remote file identity carried by the stub file
    pub link_events_file_id: Option<i64>,
    /// Times the event was returned for retry
    pub attempts: u32,
}

impl FsEvent {
    /// Create a new pipeline event with a fresh id
    pub fn new(event_type: FsEventType, src: PathBuf, is_dir: bool) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            event_type,
            src,
            dst: None,
            is_dir,
            time: chrono::Utc::now().timestamp(),
            is_offline: false,
            quiet: false,
            file: None,
            old_hash: None,
            old_signature: None,
            new_hash: None,
            new_signature: None,
            recent_copy: None,
            file_size: 0,
            mtime: 0,
            old_mtime: 0,
            old_size: 0,
            in_storage: false,
            is_link: false,
            link_events_file_id: None,
            attempts: 0,
        }
    }

    /// Create a move event
    pub fn new_move(src: PathBuf, dst: PathBuf, is_dir: bool) -> Self {
        let mut event = Self::new(FsEventType::Move, src, is_dir);
        event.dst = Some(dst);
        event
    }

    /// Create an offline-scan event
    pub fn new_offline(event_type: FsEventType, src: PathBuf, is_dir: bool) -> Self {
        let mut event = Self::new(event_type, src, is_dir);
        event.is_offline = true;
        event
    }

    /// The path the event's result lives at (dst for moves, src otherwise)
    pub fn current_path(&self) -> &PathBuf {
        self.dst.as_ref().unwrap_or(&self.src)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = FsEvent::new(FsEventType::Create, PathBuf::from("a"), false);
        let b = FsEvent::new(FsEventType::Create, PathBuf::from("b"), false);
        assert!(b.id > a.id);
    }

    #[test]
    fn move_event_carries_both_paths() {
        let ev = FsEvent::new_move(PathBuf::from("a"), PathBuf::from("b"), false);
        assert_eq!(ev.event_type, FsEventType::Move);
        assert_eq!(ev.src, PathBuf::from("a"));
        assert_eq!(ev.current_path(), &PathBuf::from("b"));
    }

    #[test]
    fn offline_events_are_flagged() {
        let ev = FsEvent::new_offline(FsEventType::Delete, PathBuf::from("x"), false);
        assert!(ev.is_offline);
        assert!(!ev.quiet);
    }
}
