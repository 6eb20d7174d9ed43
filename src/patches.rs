//! Reference-counted store of binary patches
//!
//! Patch archives live at `<patches_dir>/<uuid>`; metadata and the
//! direct/reverse refcounts live in `patches.db` next to them. Each endpoint
//! hash of a not-yet-materialized patch holds one copy reference so local
//! synthesis stays possible; the references are released exactly once when
//! the patch is registered.
//!
//! A single worker serializes patch (re)checks: for each active patch whose
//! file is absent it attempts local synthesis from the endpoint copies, and
//! otherwise requests a download at a priority derived from the reference
//! counts. Failed downloads retry after a timeout and when the peer set
//! changes.

use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::copies::CopiesStore;
use crate::db::Database;
use crate::error::{DatabaseError, Error, Result};
use crate::rsync;
use crate::types::{EMPTY_FILE_HASH, download_priority};

/// Name of the refcount database inside the patches directory
const PATCHES_DB_NAME: &str = "patches.db";

/// A patch metadata row
#[derive(Debug, Clone, FromRow)]
pub struct PatchEntry {
    /// Patch uuid; also the archive file name
    pub uuid: String,
    /// Content hash the patch applies to (None for create patches)
    pub old_hash: Option<String>,
    /// Content hash the patch produces
    pub new_hash: String,
    /// Archive size in bytes, zero until known
    pub size: i64,
    /// References from events wanting the direct direction
    pub direct_count: i64,
    /// References from events wanting the reverse direction
    pub reverse_count: i64,
    /// Whether the patch is currently wanted at all
    pub active: bool,
    /// Whether the archive is materialized and registered
    pub exist: bool,
}

/// Notification published by the store
#[derive(Debug, Clone)]
pub enum PatchNotification {
    /// A patch archive became available locally and awaits registration
    Created {
        /// Patch uuid
        uuid: String,
        /// Archive size in bytes
        size: u64,
    },
    /// A patch archive was deleted
    Deleted {
        /// Patch uuid
        uuid: String,
    },
}

/// Transfer request emitted toward the download manager
#[derive(Debug, Clone)]
pub enum PatchTransfer {
    /// Download the patch archive from peers
    Download {
        /// Patch uuid
        uuid: String,
        /// Expected archive size
        size: u64,
        /// Scheduling priority
        priority: u32,
        /// Target paths referencing this patch, with event timestamps
        files: Vec<(String, i64)>,
    },
    /// Cancel an in-flight download (the patch was synthesized locally)
    Cancel {
        /// Patch uuid
        uuid: String,
    },
}

enum WorkerMessage {
    Check(String),
    Redownload,
    Stop,
}

/// Reference-counted patches store
pub struct PatchesStore {
    pool: SqlitePool,
    patches_dir: PathBuf,
    signatures_dir: PathBuf,
    copies: Arc<CopiesStore>,
    db: Arc<Database>,
    retry_download_timeout: Duration,

    pending: Mutex<HashMap<String, (i64, i64)>>,
    on_registration: Mutex<HashSet<String>>,
    failed_downloads: Mutex<HashSet<String>>,
    retry_armed: AtomicBool,

    queue_tx: mpsc::UnboundedSender<WorkerMessage>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerMessage>>>,
    notifications_tx: broadcast::Sender<PatchNotification>,
    transfers_tx: mpsc::UnboundedSender<PatchTransfer>,
}

impl PatchesStore {
    /// Open the store, creating the directory and metadata table as needed
    ///
    /// Returns the store and the receiver of its transfer requests.
    pub async fn open(
        patches_dir: &Path,
        signatures_dir: &Path,
        copies: Arc<CopiesStore>,
        db: Arc<Database>,
        retry_download_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PatchTransfer>)> {
        std::fs::create_dir_all(patches_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(patches_dir.join(PATCHES_DB_NAME))
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(DatabaseError::ConnectionFailed(e.to_string())))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS patches (
                uuid TEXT PRIMARY KEY,
                old_hash TEXT,
                new_hash TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                direct_count INTEGER NOT NULL DEFAULT 0,
                reverse_count INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                exist INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| Error::Database(DatabaseError::MigrationFailed(e.to_string())))?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (notifications_tx, _) = broadcast::channel(256);
        let (transfers_tx, transfers_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                pool,
                patches_dir: patches_dir.to_path_buf(),
                signatures_dir: signatures_dir.to_path_buf(),
                copies,
                db,
                retry_download_timeout,
                pending: Mutex::new(HashMap::new()),
                on_registration: Mutex::new(HashSet::new()),
                failed_downloads: Mutex::new(HashSet::new()),
                retry_armed: AtomicBool::new(false),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                notifications_tx,
                transfers_tx,
            },
            transfers_rx,
        ))
    }

    /// Subscribe to store notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PatchNotification> {
        self.notifications_tx.subscribe()
    }

    /// Path of the archive for a patch uuid
    pub fn patch_path(&self, uuid: &str) -> PathBuf {
        self.patches_dir.join(uuid)
    }

    /// Whether a non-empty archive is materialized for the uuid
    pub fn patch_exists(&self, uuid: &str) -> bool {
        std::fs::metadata(self.patch_path(uuid))
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    /// Size of the archive for the uuid, zero when absent
    pub fn get_patch_size(&self, uuid: &str) -> u64 {
        std::fs::metadata(self.patch_path(uuid))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Fetch a patch entry
    pub async fn get_patch(&self, uuid: &str) -> Result<Option<PatchEntry>> {
        let row = sqlx::query_as::<_, PatchEntry>(
            "SELECT uuid, old_hash, new_hash, size, direct_count, reverse_count,
                    active, exist
             FROM patches WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::db::map_db_err)?;

        Ok(row)
    }

    /// Look up a patch by its endpoint hashes
    pub async fn get_patch_uuid_and_size(
        &self,
        new_hash: &str,
        old_hash: Option<&str>,
    ) -> Result<Option<(String, u64)>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT uuid, size FROM patches WHERE new_hash = ? AND old_hash IS ?",
        )
        .bind(new_hash)
        .bind(old_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::db::map_db_err)?;

        Ok(row.map(|(uuid, size)| (uuid, size.max(0) as u64)))
    }

    /// Add a direct-direction reference, lazily creating the entry
    ///
    /// Entry creation bumps copy references for both endpoint hashes so local
    /// synthesis remains possible until the patch is registered.
    pub async fn add_direct_patch(
        &self,
        uuid: &str,
        new_hash: &str,
        old_hash: Option<&str>,
        size: u64,
        active: bool,
        postponed: bool,
    ) -> Result<()> {
        self.add_patch_reference(uuid, new_hash, old_hash, size, active, postponed, true)
            .await
    }

    /// Add a reverse-direction reference, lazily creating the entry
    pub async fn add_reverse_patch(
        &self,
        uuid: &str,
        new_hash: &str,
        old_hash: Option<&str>,
        size: u64,
        active: bool,
        postponed: bool,
    ) -> Result<()> {
        self.add_patch_reference(uuid, new_hash, old_hash, size, active, postponed, false)
            .await
    }

    /// Remove a direct-direction reference
    pub async fn remove_direct_patch(&self, uuid: &str, postponed: bool) -> Result<()> {
        self.remove_patch_reference(uuid, postponed, true).await
    }

    /// Remove a reverse-direction reference
    pub async fn remove_reverse_patch(&self, uuid: &str, postponed: bool) -> Result<()> {
        self.remove_patch_reference(uuid, postponed, false).await
    }

    /// Apply all postponed deltas, then delete entries left with no references
    pub async fn commit_last_changes(&self) -> Result<()> {
        let pending = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };

        for (uuid, (direct, reverse)) in &pending {
            sqlx::query(
                "UPDATE patches SET direct_count = direct_count + ?,
                                    reverse_count = reverse_count + ?
                 WHERE uuid = ?",
            )
            .bind(direct)
            .bind(reverse)
            .bind(uuid)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;
        }

        self.delete_patches_not_used().await?;

        if !pending.is_empty() {
            debug!(uuids = pending.len(), "committed postponed patch reference changes");
        }
        Ok(())
    }

    /// Discard postponed deltas without applying them
    pub fn clear_last_changes(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Record the archive size once known
    pub async fn update_patch(&self, uuid: &str, size: u64) -> Result<()> {
        sqlx::query("UPDATE patches SET size = ? WHERE uuid = ? AND size = 0")
            .bind(size as i64)
            .bind(uuid)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;
        self.queue_check(uuid);
        Ok(())
    }

    /// Mark a patch as wanted again
    pub async fn activate_patch(&self, uuid: &str) -> Result<()> {
        sqlx::query("UPDATE patches SET active = 1 WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;
        self.queue_check(uuid);
        Ok(())
    }

    /// The registration of a locally-created patch completed
    ///
    /// Flips `exist` and releases the endpoint copy references exactly once.
    pub async fn on_patch_registered(&self, uuid: &str) -> Result<()> {
        self.on_registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uuid);

        let Some(patch) = self.get_patch(uuid).await? else {
            warn!(uuid, "registered patch has no metadata row");
            return Ok(());
        };

        if self.patch_exists(uuid) && !patch.exist {
            sqlx::query("UPDATE patches SET exist = 1 WHERE uuid = ?")
                .bind(uuid)
                .execute(&self.pool)
                .await
                .map_err(crate::db::map_db_err)?;
            self.release_endpoint_references(&patch, false).await?;
        } else if !self.patch_exists(uuid) {
            warn!(uuid, "registered patch not found on disk");
        }
        Ok(())
    }

    /// A requested patch download finished; re-check the entry
    pub fn on_patch_downloaded(&self, uuid: &str) {
        self.queue_check(uuid);
    }

    /// A requested patch download failed; retry after the backoff
    pub fn on_patch_download_failed(self: &Arc<Self>, uuid: &str) {
        self.failed_downloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uuid.to_string());

        if !self.retry_armed.swap(true, Ordering::SeqCst) {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(store.retry_download_timeout).await;
                store.retry_armed.store(false, Ordering::SeqCst);
                store.queue_tx.send(WorkerMessage::Redownload).ok();
            });
        }
    }

    /// The connected peer set changed; failed downloads become worth retrying
    pub fn on_nodes_changed(&self) {
        self.queue_tx.send(WorkerMessage::Redownload).ok();
    }

    /// Queue every patch for a recheck; with `only_not_exist`, only the
    /// not-yet-materialized ones
    pub async fn check_patches(&self, only_not_exist: bool) -> Result<()> {
        let sql = if only_not_exist {
            "SELECT uuid FROM patches WHERE exist = 0"
        } else {
            "SELECT uuid FROM patches"
        };
        let rows: Vec<(String,)> = sqlx::query_as(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;

        for (uuid,) in rows {
            self.queue_check(&uuid);
        }
        Ok(())
    }

    /// Spawn the serialized check worker
    ///
    /// Subsequent calls return a finished no-op handle.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let Some(mut rx) = store
            .queue_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("patches worker already spawned");
            return tokio::spawn(async {});
        };

        tokio::spawn(async move {
            if let Err(e) = store.check_patches(false).await {
                warn!(error = %e, "initial patch sweep failed");
            }
            while let Some(msg) = rx.recv().await {
                match msg {
                    WorkerMessage::Check(uuid) => {
                        if let Err(e) = store.check_patch(&uuid).await {
                            warn!(uuid, error = %e, "patch check failed");
                        }
                    }
                    WorkerMessage::Redownload => {
                        let failed: Vec<String> = {
                            let mut failed = store
                                .failed_downloads
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            failed.drain().collect()
                        };
                        if !failed.is_empty() {
                            debug!(count = failed.len(), "retrying failed patch downloads");
                        }
                        for uuid in failed {
                            store.queue_check(&uuid);
                        }
                    }
                    WorkerMessage::Stop => break,
                }
            }
            debug!("patches worker stopped");
        })
    }

    /// Stop the worker loop
    pub fn stop(&self) {
        self.on_registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.queue_tx.send(WorkerMessage::Stop).ok();
    }

    /// Close the store's database pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn queue_check(&self, uuid: &str) {
        self.queue_tx
            .send(WorkerMessage::Check(uuid.to_string()))
            .ok();
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_patch_reference(
        &self,
        uuid: &str,
        new_hash: &str,
        old_hash: Option<&str>,
        size: u64,
        active: bool,
        postponed: bool,
        direct: bool,
    ) -> Result<()> {
        let existing = self.get_patch(uuid).await?;
        if existing.is_none() {
            sqlx::query(
                "INSERT INTO patches (uuid, old_hash, new_hash, size, active, exist)
                 VALUES (?, ?, ?, ?, ?, 0)",
            )
            .bind(uuid)
            .bind(old_hash)
            .bind(new_hash)
            .bind(size as i64)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;

            // hold the endpoints so synthesis stays possible
            self.copies
                .add_copy_reference(new_hash, &format!("patch {uuid} new_hash"), postponed)
                .await?;
            if let Some(old) = old_hash {
                self.copies
                    .add_copy_reference(old, &format!("patch {uuid} old_hash"), postponed)
                    .await?;
            }
        } else if active {
            sqlx::query("UPDATE patches SET active = 1 WHERE uuid = ?")
                .bind(uuid)
                .execute(&self.pool)
                .await
                .map_err(crate::db::map_db_err)?;
        }

        if postponed {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let entry = pending.entry(uuid.to_string()).or_insert((0, 0));
            if direct {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        } else {
            let column = if direct { "direct_count" } else { "reverse_count" };
            sqlx::query(&format!(
                "UPDATE patches SET {column} = {column} + 1 WHERE uuid = ?"
            ))
            .bind(uuid)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;
        }

        debug!(uuid, direct, postponed, "patch reference added");
        self.queue_check(uuid);
        Ok(())
    }

    async fn remove_patch_reference(&self, uuid: &str, postponed: bool, direct: bool) -> Result<()> {
        let Some(patch) = self.get_patch(uuid).await? else {
            return Ok(());
        };
        let current = if direct { patch.direct_count } else { patch.reverse_count };
        if current == 0 && !postponed {
            return Ok(());
        }

        if postponed {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let entry = pending.entry(uuid.to_string()).or_insert((0, 0));
            if direct {
                entry.0 -= 1;
            } else {
                entry.1 -= 1;
            }
            debug!(uuid, direct, "patch reference remove postponed");
            return Ok(());
        }

        let column = if direct { "direct_count" } else { "reverse_count" };
        sqlx::query(&format!(
            "UPDATE patches SET {column} = {column} - 1 WHERE uuid = ?"
        ))
        .bind(uuid)
        .execute(&self.pool)
        .await
        .map_err(crate::db::map_db_err)?;

        debug!(uuid, direct, "patch reference removed");

        if let Some(patch) = self.get_patch(uuid).await?
            && patch.direct_count == 0
            && patch.reverse_count == 0
        {
            self.delete_patch_entry(&patch).await?;
        }
        Ok(())
    }

    async fn delete_patches_not_used(&self) -> Result<()> {
        let unused = sqlx::query_as::<_, PatchEntry>(
            "SELECT uuid, old_hash, new_hash, size, direct_count, reverse_count,
                    active, exist
             FROM patches WHERE direct_count <= 0 AND reverse_count <= 0",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(crate::db::map_db_err)?;

        for patch in unused {
            self.delete_patch_entry(&patch).await?;
        }
        Ok(())
    }

    async fn delete_patch_entry(&self, patch: &PatchEntry) -> Result<()> {
        sqlx::query("DELETE FROM patches WHERE uuid = ?")
            .bind(&patch.uuid)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;

        // a not-yet-registered patch still holds its endpoint references
        if !patch.exist {
            self.release_endpoint_references(patch, false).await?;
        }

        let path = self.patch_path(&patch.uuid);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.transfers_tx
            .send(PatchTransfer::Cancel {
                uuid: patch.uuid.clone(),
            })
            .ok();

        info!(uuid = %patch.uuid, "patch deleted");
        self.notifications_tx
            .send(PatchNotification::Deleted {
                uuid: patch.uuid.clone(),
            })
            .ok();
        Ok(())
    }

    async fn release_endpoint_references(&self, patch: &PatchEntry, postponed: bool) -> Result<()> {
        self.copies
            .remove_copy_reference(
                &patch.new_hash,
                &format!("patch {} new_hash", patch.uuid),
                postponed,
            )
            .await?;
        if let Some(old) = &patch.old_hash {
            self.copies
                .remove_copy_reference(old, &format!("patch {} old_hash", patch.uuid), postponed)
                .await?;
        }
        Ok(())
    }

    async fn check_patch(&self, uuid: &str) -> Result<()> {
        let Some(patch) = self.get_patch(uuid).await? else {
            return Ok(());
        };
        if !patch.active {
            return Ok(());
        }
        if self
            .on_registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(uuid)
        {
            return Ok(());
        }

        if !self.patch_exists(uuid) {
            if patch.exist {
                // archive vanished: demote and re-hold the endpoints
                sqlx::query("UPDATE patches SET exist = 0 WHERE uuid = ?")
                    .bind(uuid)
                    .execute(&self.pool)
                    .await
                    .map_err(crate::db::map_db_err)?;
                self.copies
                    .add_copy_reference(
                        &patch.new_hash,
                        &format!("patch {uuid} new_hash recheck"),
                        false,
                    )
                    .await?;
                if let Some(old) = &patch.old_hash {
                    self.copies
                        .add_copy_reference(old, &format!("patch {uuid} old_hash recheck"), false)
                        .await?;
                }
            }

            match self.synthesize_patch(&patch).await {
                Ok(size) => {
                    self.update_size_silently(uuid, size).await?;
                    self.on_registration
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(uuid.to_string());
                    self.transfers_tx
                        .send(PatchTransfer::Cancel {
                            uuid: uuid.to_string(),
                        })
                        .ok();
                    self.notifications_tx
                        .send(PatchNotification::Created {
                            uuid: uuid.to_string(),
                            size,
                        })
                        .ok();
                }
                Err(e) => {
                    if patch.size == 0 {
                        // size unknown: wait for update_patch before downloading
                        debug!(uuid, error = %e, "waiting for patch size before download");
                        return Ok(());
                    }
                    self.request_download(&patch).await?;
                }
            }
        } else if !patch.exist {
            let size = self.get_patch_size(uuid);
            self.update_size_silently(uuid, size).await?;
            self.on_registration
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(uuid.to_string());
            self.notifications_tx
                .send(PatchNotification::Created {
                    uuid: uuid.to_string(),
                    size,
                })
                .ok();
        }
        Ok(())
    }

    async fn update_size_silently(&self, uuid: &str, size: u64) -> Result<()> {
        sqlx::query("UPDATE patches SET size = ? WHERE uuid = ? AND size = 0")
            .bind(size as i64)
            .bind(uuid)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;
        Ok(())
    }

    // Derive the patch from the endpoint copies. Runs on the blocking pool;
    // synthesis is serialized by the worker loop.
    async fn synthesize_patch(&self, patch: &PatchEntry) -> Result<u64> {
        let new_copy = self.copies.copy_path(&patch.new_hash);
        if !new_copy.is_file() {
            return Err(Error::Apply(crate::error::ApplyError::CopyDoesNotExist {
                hash: patch.new_hash.clone(),
            }));
        }
        let old_hash = patch
            .old_hash
            .as_deref()
            .filter(|h| *h != EMPTY_FILE_HASH)
            .map(str::to_string);
        if let Some(old) = &old_hash
            && !self.copies.copy_exists(old)
        {
            return Err(Error::Apply(crate::error::ApplyError::CopyDoesNotExist {
                hash: old.clone(),
            }));
        }

        let old_signature = match &old_hash {
            Some(old) => match rsync::load_signature(&self.signatures_dir, old)? {
                Some(sig) => Some(sig),
                None => Some(rsync::block_signature(&self.copies.copy_path(old))?),
            },
            None => None,
        };
        let new_signature = match rsync::load_signature(&self.signatures_dir, &patch.new_hash)? {
            Some(sig) => Some(sig),
            None => None,
        };

        let patches_dir = self.patches_dir.clone();
        let uuid = patch.uuid.clone();
        let new_hash = patch.new_hash.clone();
        let created = tokio::task::spawn_blocking(move || {
            rsync::create_patch(
                &new_copy,
                &patches_dir,
                &uuid,
                old_signature.as_ref(),
                new_signature,
                old_hash.as_deref(),
                Some(&new_hash),
            )
        })
        .await
        .map_err(|e| Error::Other(format!("patch synthesis task failed: {e}")))??;

        info!(uuid = %patch.uuid, size = created.archive_size, "patch synthesized locally");
        Ok(created.archive_size)
    }

    async fn request_download(&self, patch: &PatchEntry) -> Result<()> {
        let mut files = self.db.files_by_diff_uuid(&patch.uuid, true).await?;
        if files.is_empty() {
            files = self.db.files_by_diff_uuid(&patch.uuid, false).await?;
        }

        let priority = Self::calculate_priority(patch);
        debug!(uuid = %patch.uuid, priority, "requesting patch download");
        self.transfers_tx
            .send(PatchTransfer::Download {
                uuid: patch.uuid.clone(),
                size: patch.size.max(0) as u64,
                priority,
                files,
            })
            .ok();
        Ok(())
    }

    fn calculate_priority(patch: &PatchEntry) -> u32 {
        let references = (patch.direct_count + patch.reverse_count).max(0) as u32;
        let base = if patch.active && patch.direct_count > 0 {
            download_priority::WANTED_DIRECT_PATCH
        } else if patch.reverse_count > 0 {
            download_priority::REVERSED_PATCH
        } else {
            download_priority::DIRECT_PATCH
        };
        base + references
    }
}
