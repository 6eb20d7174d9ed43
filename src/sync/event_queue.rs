//! The event queue processor: merge point of the local pipeline and the
//! remote event log
//!
//! Local events register with the server one at a time per file, proposing
//! their predecessor; a stale proposal means the chain moved on and the
//! local edit loses (its content survives as a conflict copy). Remote events
//! ingest into the per-file chain in server order and apply through the
//! quiet processor once their predecessors are applied and their content is
//! present — materialized from a local copy, deduplicated from an identical
//! tracked file, patched from the previous version, or downloaded from the
//! swarm at a priority derived from what the chain needs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::copies::CopiesStore;
use crate::db::{Database, EventRecord, FileRecord, NewEvent, NewFile};
use crate::downloader::DownloadManager;
use crate::error::{ApplyError, Error, Result};
use crate::monitor::{FsEventType, LocalEvent};
use crate::patches::PatchesStore;
use crate::quiet::QuietProcessor;
use crate::signalling::{EventProposal, EventServer, RegisterOutcome, RemoteFileEvent};
use crate::types::{
    EMPTY_FILE_HASH, Event, EventState, EventType, FileId, MIN_DIFF_SIZE, download_priority,
};

use super::conflict;

/// Merges local and remote event streams and maintains the per-file chains
pub struct EventQueueProcessor {
    root: PathBuf,
    db: Arc<Database>,
    copies: Arc<CopiesStore>,
    patches: Arc<PatchesStore>,
    quiet: Arc<QuietProcessor>,
    downloads: DownloadManager,
    server: Arc<dyn EventServer>,
    events_tx: broadcast::Sender<Event>,
    download_backups: bool,

    collaborated_folders: Mutex<HashSet<String>>,
    excluded_dirs: Mutex<Vec<PathBuf>>,
    registration_paused: AtomicBool,

    local_pending: AtomicUsize,
    remote_pending: AtomicUsize,
}

impl EventQueueProcessor {
    /// Create the processor over the shared subsystems
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        db: Arc<Database>,
        copies: Arc<CopiesStore>,
        patches: Arc<PatchesStore>,
        quiet: Arc<QuietProcessor>,
        downloads: DownloadManager,
        server: Arc<dyn EventServer>,
        events_tx: broadcast::Sender<Event>,
        download_backups: bool,
        excluded_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            root,
            db,
            copies,
            patches,
            quiet,
            downloads,
            server,
            events_tx,
            download_backups,
            collaborated_folders: Mutex::new(HashSet::new()),
            excluded_dirs: Mutex::new(excluded_dirs),
            registration_paused: AtomicBool::new(false),
            local_pending: AtomicUsize::new(0),
            remote_pending: AtomicUsize::new(0),
        }
    }

    /// Local events awaiting registration
    pub fn local_events_count(&self) -> usize {
        self.local_pending.load(Ordering::Relaxed)
    }

    /// Remote events ingested but not yet applied
    pub fn remote_events_count(&self) -> usize {
        self.remote_pending.load(Ordering::Relaxed)
    }

    /// The authoritative event log API
    pub fn server(&self) -> &Arc<dyn EventServer> {
        &self.server
    }

    /// Stop registering new local events (license downgrade hook)
    pub fn pause_registration(&self) {
        self.registration_paused.store(true, Ordering::Relaxed);
        self.events_tx.send(Event::LicenseDowngraded).ok();
    }

    /// Resume registering local events
    pub fn resume_registration(&self) {
        self.registration_paused.store(false, Ordering::Relaxed);
    }

    /// Replace the collaboration folder set
    pub fn set_collaborated_folders(&self, folders: Vec<String>) {
        *self
            .collaborated_folders
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = folders.into_iter().collect();
    }

    // ------------------------------------------------------------------
    // Local events
    // ------------------------------------------------------------------

    /// Process one event from the filesystem pipeline
    pub async fn process_local(&self, local: LocalEvent) -> Result<()> {
        if local.quiet {
            // a remote apply echoing back; state is already reconciled
            return Ok(());
        }
        if self.is_excluded(&local.path) {
            debug!(path = %local.path.display(), "local event in excluded dir ignored");
            return Ok(());
        }
        if local.event_type == FsEventType::Move && self.revert_collaboration_move(&local).await? {
            return Ok(());
        }
        if self.registration_paused.load(Ordering::Relaxed) {
            debug!(path = %local.path.display(), "registration paused, local event dropped");
            return Ok(());
        }

        self.local_pending.fetch_add(1, Ordering::Relaxed);
        let result = self.register_local(local).await;
        self.local_pending.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn register_local(&self, local: LocalEvent) -> Result<()> {
        let Some(file) = self.db.get_file(local.file_id).await? else {
            // deleted by the time we got here; the delete event follows
            if local.event_type != FsEventType::Delete {
                return Ok(());
            }
            return self.register_local_delete_without_record(&local).await;
        };

        let head = self.db.head_event(local.file_id).await?;
        let last_event_id = head.as_ref().and_then(|h| h.server_event_id);

        let event_type = match local.event_type {
            FsEventType::Create => EventType::Create,
            FsEventType::Modify => EventType::Update,
            FsEventType::Move => EventType::Move,
            FsEventType::Delete => EventType::Delete,
        };

        // updates of nontrivial files carry patches both ways
        let (diff_uuid, rev_uuid) = if event_type == EventType::Update
            && local.old_hash.is_some()
            && local.old_hash.as_deref() != Some(EMPTY_FILE_HASH)
            && local.file_size >= MIN_DIFF_SIZE
        {
            (
                Some(uuid::Uuid::new_v4().to_string()),
                Some(uuid::Uuid::new_v4().to_string()),
            )
        } else {
            (None, None)
        };

        let uuid = uuid::Uuid::new_v4().to_string();
        let file_name = local
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| local.path.to_string_lossy().into_owned());
        let folder_uuid = self.folder_uuid_for(&local.path).await?;

        self.db
            .insert_event(&NewEvent {
                uuid: uuid.clone(),
                server_event_id: None,
                file_id: local.file_id,
                event_type: event_type.to_i32(),
                file_name: file_name.clone(),
                folder_uuid: folder_uuid.clone(),
                file_hash: local.new_hash.clone(),
                file_hash_before_event: local.old_hash.clone(),
                file_size: local.file_size as i64,
                file_size_before_event: 0,
                diff_file_uuid: diff_uuid.clone(),
                rev_diff_file_uuid: rev_uuid.clone(),
                state: EventState::Sent.to_i32(),
                last_event_id,
                timestamp: local.mtime,
            })
            .await?;
        self.hold_event_endpoints(&uuid, local.new_hash.as_deref(), local.old_hash.as_deref())
            .await?;

        // the patch store synthesizes from local copies and registers
        if let (Some(diff), Some(new_hash), Some(old_hash)) =
            (&diff_uuid, &local.new_hash, &local.old_hash)
        {
            self.patches
                .add_direct_patch(diff, new_hash, Some(old_hash), 0, true, false)
                .await?;
            if let Some(rev) = &rev_uuid {
                self.patches
                    .add_reverse_patch(rev, old_hash, Some(new_hash), 0, self.download_backups, false)
                    .await?;
            }
        }

        let proposal = EventProposal {
            uuid: uuid.clone(),
            event_type,
            file_name,
            folder_uuid,
            events_file_id: file.events_file_id.or(local.events_file_id),
            file_hash: local.new_hash.clone(),
            file_size: local.file_size,
            last_event_id,
            diff_file_uuid: diff_uuid,
            rev_diff_file_uuid: rev_uuid,
        };

        match self.server.register_event(proposal).await? {
            RegisterOutcome::Registered {
                server_event_id,
                events_file_id,
                timestamp: _,
            } => {
                self.db.demote_applied(local.file_id).await?;
                self.db
                    .set_server_event_id(&uuid, server_event_id, EventState::Applied)
                    .await?;
                if file.events_file_id.is_none() {
                    self.db
                        .set_events_file_id(local.file_id, events_file_id)
                        .await?;
                }
                debug!(uuid, server_event_id, "local event registered");
            }
            RegisterOutcome::NodeMismatch => {
                // the chain moved on; the remote winner will arrive and turn
                // this into a conflict copy
                warn!(uuid, "registration rejected: stale predecessor");
                self.db
                    .update_event_state(&uuid, EventState::Conflicted)
                    .await?;
            }
            RegisterOutcome::AlreadyExists => {
                debug!(uuid, "event already registered");
            }
        }
        Ok(())
    }

    async fn register_local_delete_without_record(&self, local: &LocalEvent) -> Result<()> {
        // the record is gone (folder cascade); register the delete if the
        // chain exists
        let Some(head) = self.db.head_event(local.file_id).await? else {
            return Ok(());
        };
        let uuid = uuid::Uuid::new_v4().to_string();
        self.db
            .insert_event(&NewEvent {
                uuid: uuid.clone(),
                server_event_id: None,
                file_id: local.file_id,
                event_type: EventType::Delete.to_i32(),
                file_name: head.file_name.clone(),
                folder_uuid: head.folder_uuid.clone(),
                file_hash: None,
                file_hash_before_event: head.file_hash.clone(),
                file_size: 0,
                file_size_before_event: head.file_size,
                diff_file_uuid: None,
                rev_diff_file_uuid: None,
                state: EventState::Sent.to_i32(),
                last_event_id: head.server_event_id,
                timestamp: local.mtime,
            })
            .await?;

        let proposal = EventProposal {
            uuid: uuid.clone(),
            event_type: EventType::Delete,
            file_name: head.file_name.clone(),
            folder_uuid: None,
            events_file_id: None,
            file_hash: None,
            file_size: 0,
            last_event_id: head.server_event_id,
            diff_file_uuid: None,
            rev_diff_file_uuid: None,
        };
        if let RegisterOutcome::Registered {
            server_event_id, ..
        } = self.server.register_event(proposal).await?
        {
            self.db
                .set_server_event_id(&uuid, server_event_id, EventState::Applied)
                .await?;
        }
        Ok(())
    }

    // A local attempt to move or rename a collaboration folder is reverted.
    async fn revert_collaboration_move(&self, local: &LocalEvent) -> Result<bool> {
        let Some(old_path) = &local.old_path else {
            return Ok(false);
        };
        let is_collaboration = {
            let folders = self
                .collaborated_folders
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            old_path
                .components()
                .next()
                .and_then(|c| c.as_os_str().to_str())
                .is_some_and(|first| folders.contains(first))
        };
        if !is_collaboration {
            return Ok(false);
        }

        warn!(src = %old_path.display(), dst = %local.path.display(),
              "reverting move of collaboration folder");
        if local.is_folder {
            self.quiet.move_directory(&local.path, old_path).await?;
        } else {
            self.quiet.move_file(&local.path, old_path, None).await?;
        }
        self.events_tx
            .send(Event::CollaborationMoveReverted {
                path: old_path.clone(),
            })
            .ok();
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Remote events
    // ------------------------------------------------------------------

    /// Ingest a batch of remote events (chronologically ordered per file)
    ///
    /// Returns the number of newly ingested events.
    pub async fn process_remote_batch(&self, mut events: Vec<RemoteFileEvent>) -> Result<usize> {
        events.sort_by_key(|e| e.server_event_id);
        let mut ingested = 0;
        let mut touched_files: Vec<FileId> = Vec::new();

        for remote in events {
            match self.ingest_remote(&remote).await {
                Ok(Some(file_id)) => {
                    ingested += 1;
                    if !touched_files.contains(&file_id) {
                        touched_files.push(file_id);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(uuid = %remote.uuid, error = %e, "remote event ingest failed"),
            }
        }

        // postponed reference deltas collapse per batch
        self.copies.commit_last_changes().await?;
        self.patches.commit_last_changes().await?;

        for file_id in touched_files {
            if let Err(e) = self.drive_file(file_id).await {
                warn!(file_id = %file_id, error = %e, "drive after batch failed");
            }
        }
        Ok(ingested)
    }

    // Ingest one remote event into the chain; returns the file it extends.
    async fn ingest_remote(&self, remote: &RemoteFileEvent) -> Result<Option<FileId>> {
        if let Some(existing) = self.db.get_event_by_uuid(&remote.uuid).await? {
            // our own registered event coming back, or a replay
            if existing.server_event_id.is_none() {
                self.db
                    .set_server_event_id(&remote.uuid, remote.server_event_id, existing.state())
                    .await?;
            }
            return Ok(None);
        }

        let file = self.resolve_remote_file(remote).await?;

        // a concurrent unregistered local edit loses against the remote chain
        self.occupy_conflicting_local_events(&file, remote).await?;

        self.db
            .insert_event(&NewEvent {
                uuid: remote.uuid.clone(),
                server_event_id: Some(remote.server_event_id),
                file_id: file.id,
                event_type: remote.event_type.to_i32(),
                file_name: remote.file_name.clone(),
                folder_uuid: remote.folder_uuid.clone(),
                file_hash: remote.file_hash.clone(),
                file_hash_before_event: remote.file_hash_before_event.clone(),
                file_size: remote.file_size as i64,
                file_size_before_event: 0,
                diff_file_uuid: remote.diff_file_uuid.clone(),
                rev_diff_file_uuid: remote.rev_diff_file_uuid.clone(),
                state: EventState::Received.to_i32(),
                last_event_id: remote.last_event_id,
                timestamp: remote.timestamp,
            })
            .await?;
        self.remote_pending.fetch_add(1, Ordering::Relaxed);

        self.hold_event_endpoints_postponed(
            &remote.uuid,
            remote.file_hash.as_deref(),
            remote.file_hash_before_event.as_deref(),
        )
        .await?;

        if let (Some(diff), Some(new_hash)) = (&remote.diff_file_uuid, &remote.file_hash) {
            self.patches
                .add_direct_patch(
                    diff,
                    new_hash,
                    remote.file_hash_before_event.as_deref(),
                    0,
                    true,
                    true,
                )
                .await?;
        }
        if self.download_backups
            && let (Some(rev), Some(new_hash)) = (&remote.rev_diff_file_uuid, &remote.file_hash)
        {
            self.patches
                .add_reverse_patch(
                    rev,
                    remote.file_hash_before_event.as_deref().unwrap_or(EMPTY_FILE_HASH),
                    Some(new_hash),
                    0,
                    false,
                    true,
                )
                .await?;
        }

        debug!(uuid = %remote.uuid, server_event_id = remote.server_event_id,
               file_id = %file.id, "remote event ingested");
        Ok(Some(file.id))
    }

    // Locate (or create) the record a remote event belongs to.
    async fn resolve_remote_file(&self, remote: &RemoteFileEvent) -> Result<FileRecord> {
        if let Some(file) = self
            .db
            .get_file_by_events_file_id(remote.events_file_id)
            .await?
        {
            return Ok(file);
        }

        let path = self.resolve_remote_path(remote).await?;
        if let Some(file) = self.db.get_file_by_path(&path.to_string_lossy()).await? {
            // only a remote CREATE may hand its identity to a local record
            // that has not registered yet; anything else is a mismatch
            match file.events_file_id {
                None if remote.event_type == EventType::Create => {
                    self.db
                        .set_events_file_id(file.id, remote.events_file_id)
                        .await?;
                    return self.db.require_file(file.id).await;
                }
                None => {
                    return Err(Error::Apply(ApplyError::WrongFileId {
                        expected: Some(remote.events_file_id),
                        actual: None,
                    }));
                }
                Some(actual) => {
                    return Err(Error::Apply(ApplyError::WrongFileId {
                        expected: Some(remote.events_file_id),
                        actual: Some(actual),
                    }));
                }
            }
        }

        // first sighting: record it, excluded subtrees stay unmaterialized
        let excluded = self.is_excluded(&path);
        let is_folder = remote.event_type == EventType::Create && remote.file_hash.is_none();
        let id = self
            .db
            .insert_file(&NewFile {
                relative_path: path.to_string_lossy().into_owned(),
                is_folder,
                file_hash: None,
                mtime: 0,
                size: 0,
                events_file_id: Some(remote.events_file_id),
            })
            .await?;
        if excluded {
            self.db
                .set_subtree_excluded(&path.to_string_lossy(), true)
                .await?;
        }
        self.db.require_file(id).await
    }

    // Folder-uuid plus file name give the event's path.
    async fn resolve_remote_path(&self, remote: &RemoteFileEvent) -> Result<PathBuf> {
        match &remote.folder_uuid {
            None => Ok(PathBuf::from(&remote.file_name)),
            Some(folder_uuid) => {
                let folder_event = self
                    .db
                    .get_event_by_uuid(folder_uuid)
                    .await?
                    .ok_or_else(|| {
                        Error::Event(crate::error::EventError::UnknownFile {
                            events_file_id: remote.events_file_id,
                        })
                    })?;
                let folder = self.db.require_file(folder_event.file_id).await?;
                Ok(Path::new(&folder.relative_path).join(&remote.file_name))
            }
        }
    }

    async fn occupy_conflicting_local_events(
        &self,
        file: &FileRecord,
        remote: &RemoteFileEvent,
    ) -> Result<()> {
        let chain = self.db.events_for_file(file.id).await?;
        let losers: Vec<&EventRecord> = chain
            .iter()
            .filter(|e| {
                e.server_event_id.is_none()
                    && matches!(e.state(), EventState::Sent | EventState::Conflicted)
            })
            .collect();
        if losers.is_empty() {
            return Ok(());
        }

        // the local content differs from what the remote chain will put here
        let local_hash = file.file_hash.as_deref();
        let needs_copy = !file.is_folder
            && local_hash.is_some()
            && local_hash != remote.file_hash.as_deref();
        if needs_copy {
            let original = self.root.join(&file.relative_path);
            if original.exists() {
                let conflict = conflict::conflict_path(
                    &original,
                    conflict::CONFLICT_SUFFIX,
                    chrono::Utc::now().date_naive(),
                );
                std::fs::copy(&original, &conflict)?;
                let rel = conflict
                    .strip_prefix(&self.root)
                    .unwrap_or(&conflict)
                    .to_path_buf();
                info!(path = %rel.display(), "conflict copy created");
                // deliberately loud: the monitor will pick the copy up and
                // register it as a new file
                self.events_tx.send(Event::ConflictCreated { path: rel }).ok();
            }
        }

        for loser in losers {
            debug!(uuid = %loser.uuid, "local event occupied by remote chain");
            self.db
                .update_event_state(&loser.uuid, EventState::Occupied)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Applying the chain
    // ------------------------------------------------------------------

    /// Apply every applicable received event of a file, in chain order
    pub async fn drive_file(&self, file_id: FileId) -> Result<()> {
        loop {
            let Some(file) = self.db.get_file(file_id).await? else {
                return Ok(());
            };
            let applied = self.db.applied_event(file_id).await?;
            let applied_id = applied.as_ref().and_then(|e| e.server_event_id);

            let chain = self.db.events_for_file(file_id).await?;
            let next = chain.into_iter().find(|e| {
                matches!(e.state(), EventState::Received | EventState::Downloaded)
                    && e.server_event_id > applied_id
            });
            let Some(next) = next else {
                return Ok(());
            };

            // predecessors first: the next event must link to the applied head
            if next.last_event_id.is_some() && next.last_event_id != applied_id {
                debug!(uuid = %next.uuid, "waiting for predecessor");
                return Ok(());
            }

            if !self.apply_remote_event(&file, &next).await? {
                return Ok(());
            }
        }
    }

    /// Re-drive every file with pending remote events (startup, new content)
    pub async fn drive_pending(&self) -> Result<()> {
        let pending = self.db.pending_remote_events().await?;
        let mut seen = HashSet::new();
        for event in pending {
            if seen.insert(event.file_id) {
                self.drive_file(event.file_id).await?;
            }
        }
        Ok(())
    }

    // Returns true when the event was applied and the chain may advance.
    async fn apply_remote_event(&self, file: &FileRecord, event: &EventRecord) -> Result<bool> {
        let rel_path = PathBuf::from(&file.relative_path);

        if file.excluded {
            // history advances, disk does not
            self.mark_applied(file.id, &event.uuid).await?;
            return Ok(true);
        }

        let applied = match event.event_type() {
            EventType::Create => {
                if file.is_folder {
                    self.quiet
                        .create_directory(&rel_path, file.events_file_id.unwrap_or_default())
                        .await?;
                    true
                } else {
                    self.materialize_content(file, event, &rel_path).await?
                }
            }
            EventType::Update => self.materialize_content(file, event, &rel_path).await?,
            EventType::Move => {
                let dst = self.resolve_event_path(event).await?;
                if dst != rel_path {
                    if file.is_folder {
                        self.quiet.move_directory(&rel_path, &dst).await?;
                    } else {
                        self.quiet
                            .move_file(&rel_path, &dst, file.events_file_id)
                            .await?;
                    }
                }
                true
            }
            EventType::Delete => {
                if file.is_folder {
                    self.quiet.delete_directory(&rel_path).await?;
                } else {
                    self.quiet.delete_file(&rel_path).await?;
                }
                true
            }
        };

        if applied {
            self.mark_applied(file.id, &event.uuid).await?;
        }
        Ok(applied)
    }

    // Bring the event's content onto disk: patch, local copy, dedup, or
    // download, in that order of preference.
    async fn materialize_content(
        &self,
        file: &FileRecord,
        event: &EventRecord,
        rel_path: &Path,
    ) -> Result<bool> {
        let Some(target_hash) = event.file_hash.clone() else {
            // content-less create: an empty file
            self.quiet
                .create_empty_file(rel_path, file.events_file_id)
                .await?;
            return Ok(true);
        };

        if target_hash == EMPTY_FILE_HASH {
            self.quiet
                .create_empty_file(rel_path, file.events_file_id)
                .await?;
            return Ok(true);
        }

        // the on-disk file may already carry the old content for a patch
        if let Some(diff_uuid) = &event.diff_file_uuid
            && self.patches.patch_exists(diff_uuid)
            && file.file_hash.as_deref() == event.file_hash_before_event.as_deref()
            && file.file_hash.is_some()
        {
            match self.quiet.patch_file(rel_path, diff_uuid).await {
                Ok(_) => return Ok(true),
                Err(Error::Apply(ApplyError::AlreadyPatched)) => return Ok(true),
                Err(e) => {
                    warn!(uuid = %event.uuid, error = %e, "patch apply failed, falling back to copy");
                }
            }
        }

        // full copy, with local dedup behind it
        match self
            .quiet
            .create_file_from_copy(rel_path, &target_hash, file.events_file_id)
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::Apply(ApplyError::CopyDoesNotExist { .. })) => {
                self.schedule_content_download(event, &target_hash).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn schedule_content_download(&self, event: &EventRecord, hash: &str) -> Result<()> {
        debug!(uuid = %event.uuid, hash, "scheduling content download");
        // patches route through the patch store at their derived priority;
        // the full copy is the direct path to the head
        self.downloads.add_file_download(
            &event.uuid,
            download_priority::FILE,
            event.file_size.max(0) as u64,
            self.copies.copy_path(hash),
            &event.file_name,
            Some(hash.to_string()),
        );
        Ok(())
    }

    async fn mark_applied(&self, file_id: FileId, uuid: &str) -> Result<()> {
        self.db.demote_applied(file_id).await?;
        self.db.update_event_state(uuid, EventState::Applied).await?;
        self.remote_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();
        Ok(())
    }

    async fn resolve_event_path(&self, event: &EventRecord) -> Result<PathBuf> {
        match &event.folder_uuid {
            None => Ok(PathBuf::from(&event.file_name)),
            Some(folder_uuid) => {
                let folder_event = self
                    .db
                    .get_event_by_uuid(folder_uuid)
                    .await?
                    .ok_or_else(|| {
                        Error::Event(crate::error::EventError::MissingPredecessor {
                            uuid: event.uuid.clone(),
                            last_event_id: event.last_event_id.unwrap_or_default(),
                        })
                    })?;
                let folder = self.db.require_file(folder_event.file_id).await?;
                Ok(Path::new(&folder.relative_path).join(&event.file_name))
            }
        }
    }

    // ------------------------------------------------------------------
    // Download outcomes
    // ------------------------------------------------------------------

    /// A full-file download finished; the owning event advances
    pub async fn on_file_downloaded(&self, obj_id: &str) -> Result<()> {
        let Some(event) = self.db.get_event_by_uuid(obj_id).await? else {
            return Ok(());
        };
        self.db
            .update_event_state(obj_id, EventState::Downloaded)
            .await?;
        self.drive_file(event.file_id).await
    }

    /// A download failed hash verification beyond its retries; restart it
    pub async fn on_wrong_hash(&self, obj_id: &str) -> Result<()> {
        let Some(event) = self.db.get_event_by_uuid(obj_id).await? else {
            return Ok(());
        };
        warn!(uuid = %obj_id, "re-enqueueing download after hash failure");
        if let Some(hash) = event.file_hash.clone() {
            self.schedule_content_download(&event, &hash).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Exclusion
    // ------------------------------------------------------------------

    /// Exclude a directory: keep the records, drop the materialized content
    pub async fn exclude_dir(&self, dir: &Path) -> Result<()> {
        {
            let mut excluded = self.excluded_dirs.lock().unwrap_or_else(|e| e.into_inner());
            if !excluded.iter().any(|d| d == dir) {
                excluded.push(dir.to_path_buf());
            }
        }
        self.db
            .set_subtree_excluded(&dir.to_string_lossy(), true)
            .await?;
        self.quiet.delete_directory_files_only(dir).await?;
        info!(dir = %dir.display(), "directory excluded");
        Ok(())
    }

    /// Re-include a directory: replay the chains to restore content
    pub async fn include_dir(&self, dir: &Path) -> Result<()> {
        {
            let mut excluded = self.excluded_dirs.lock().unwrap_or_else(|e| e.into_inner());
            excluded.retain(|d| d != dir);
        }
        self.db
            .set_subtree_excluded(&dir.to_string_lossy(), false)
            .await?;

        let records = self.db.list_subtree(&dir.to_string_lossy()).await?;
        for record in records {
            // folders first by path order; files re-materialize from their
            // chain heads
            if record.is_folder {
                self.quiet
                    .create_directory(
                        Path::new(&record.relative_path),
                        record.events_file_id.unwrap_or_default(),
                    )
                    .await?;
            } else {
                self.drive_restore(record).await?;
            }
        }
        info!(dir = %dir.display(), "directory re-included");
        Ok(())
    }

    async fn drive_restore(&self, file: FileRecord) -> Result<()> {
        let Some(head) = self.db.head_event(file.id).await? else {
            return Ok(());
        };
        if head.event_type() == EventType::Delete {
            return Ok(());
        }
        // demote the head so the apply loop re-materializes it
        self.db
            .update_event_state(&head.uuid, EventState::Received)
            .await?;
        self.remote_pending.fetch_add(1, Ordering::Relaxed);
        self.drive_file(file.id).await
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let excluded = self.excluded_dirs.lock().unwrap_or_else(|e| e.into_inner());
        crate::utils::is_in_dirs(path, &excluded)
    }

    async fn folder_uuid_for(&self, path: &Path) -> Result<Option<String>> {
        let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(None);
        };
        let Some(folder) = self
            .db
            .get_file_by_path(&parent.to_string_lossy())
            .await?
        else {
            return Ok(None);
        };
        let head = self.db.head_event(folder.id).await?;
        Ok(head.map(|e| e.uuid))
    }

    async fn hold_event_endpoints(
        &self,
        uuid: &str,
        new_hash: Option<&str>,
        old_hash: Option<&str>,
    ) -> Result<()> {
        if let Some(hash) = new_hash {
            self.copies
                .add_copy_reference(hash, &format!("event {uuid} new"), false)
                .await?;
        }
        if let Some(hash) = old_hash {
            self.copies
                .add_copy_reference(hash, &format!("event {uuid} old"), false)
                .await?;
        }
        Ok(())
    }

    async fn hold_event_endpoints_postponed(
        &self,
        uuid: &str,
        new_hash: Option<&str>,
        old_hash: Option<&str>,
    ) -> Result<()> {
        if let Some(hash) = new_hash {
            self.copies
                .add_copy_reference(hash, &format!("event {uuid} new"), true)
                .await?;
        }
        if let Some(hash) = old_hash {
            self.copies
                .add_copy_reference(hash, &format!("event {uuid} old"), true)
                .await?;
        }
        Ok(())
    }
}
