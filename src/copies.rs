//! Reference-counted store of full-file content blobs
//!
//! Blobs live at `<copies_dir>/<hash>`; refcounts live in a small SQLite
//! table next to them. A hash whose refcount reaches zero loses its row, its
//! blob, and its persisted signature. Postponed deltas accumulate in memory
//! and are applied in one transaction by [`CopiesStore::commit_last_changes`],
//! collapsing add/remove pairs.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, Error, Result};
use crate::types::EMPTY_FILE_HASH;

/// Name of the refcount database inside the copies directory
const COPIES_DB_NAME: &str = "copies.db";

/// Prefix of transient staging files promoted into content-addressed blobs
pub const RECENT_COPY_PREFIX: &str = "recent_copy_";

/// Reference-counted copies store
pub struct CopiesStore {
    pool: SqlitePool,
    copies_dir: PathBuf,
    signatures_dir: PathBuf,
    pending: Mutex<HashMap<String, i64>>,
}

impl CopiesStore {
    /// Open the store, creating the directory and refcount table as needed
    pub async fn open(copies_dir: &Path, signatures_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(copies_dir)?;
        std::fs::create_dir_all(signatures_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(copies_dir.join(COPIES_DB_NAME))
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(DatabaseError::ConnectionFailed(e.to_string())))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS copies (
                hash TEXT PRIMARY KEY,
                refcount INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| Error::Database(DatabaseError::MigrationFailed(e.to_string())))?;

        Ok(Self {
            pool,
            copies_dir: copies_dir.to_path_buf(),
            signatures_dir: signatures_dir.to_path_buf(),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// The directory holding content-addressed blobs
    pub fn copies_dir(&self) -> &Path {
        &self.copies_dir
    }

    /// Path of the blob for a content hash
    pub fn copy_path(&self, hash: &str) -> PathBuf {
        self.copies_dir.join(hash)
    }

    /// Path of a transient staging copy for a pipeline event id
    pub fn recent_copy_path(&self, fs_event_id: u64) -> PathBuf {
        self.copies_dir.join(format!("{RECENT_COPY_PREFIX}{fs_event_id}"))
    }

    /// Whether a blob is materialized for the hash
    pub fn copy_exists(&self, hash: &str) -> bool {
        if hash == EMPTY_FILE_HASH {
            return true;
        }
        self.copy_path(hash).is_file()
    }

    /// Size of the blob for the hash, zero when absent
    pub fn get_copy_size(&self, hash: &str) -> u64 {
        std::fs::metadata(self.copy_path(hash))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Increment the refcount for a hash
    ///
    /// `reason` is carried into logs only. With `postponed`, the delta
    /// accumulates in memory until [`Self::commit_last_changes`].
    pub async fn add_copy_reference(
        &self,
        hash: &str,
        reason: &str,
        postponed: bool,
    ) -> Result<()> {
        if hash.is_empty() || hash == EMPTY_FILE_HASH {
            return Ok(());
        }

        if postponed {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            *pending.entry(hash.to_string()).or_insert(0) += 1;
            debug!(hash, reason, "copy reference add postponed");
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO copies (hash, refcount) VALUES (?, 1)
             ON CONFLICT(hash) DO UPDATE SET refcount = refcount + 1",
        )
        .bind(hash)
        .execute(&self.pool)
        .await
        .map_err(crate::db::map_db_err)?;

        debug!(hash, reason, "copy reference added");
        Ok(())
    }

    /// Decrement the refcount for a hash, deleting the blob at zero
    pub async fn remove_copy_reference(
        &self,
        hash: &str,
        reason: &str,
        postponed: bool,
    ) -> Result<()> {
        if hash.is_empty() || hash == EMPTY_FILE_HASH {
            return Ok(());
        }

        if postponed {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            *pending.entry(hash.to_string()).or_insert(0) -= 1;
            debug!(hash, reason, "copy reference remove postponed");
            return Ok(());
        }

        sqlx::query("UPDATE copies SET refcount = refcount - 1 WHERE hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;

        debug!(hash, reason, "copy reference removed");
        self.delete_if_unreferenced(hash).await
    }

    /// Current refcount for a hash (zero when no row exists)
    pub async fn refcount(&self, hash: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT refcount FROM copies WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;

        Ok(row.map(|r| r.0).unwrap_or(0))
    }

    /// Apply all postponed deltas in one pass, collapsing add/remove pairs
    pub async fn commit_last_changes(&self) -> Result<()> {
        let pending = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if pending.is_empty() {
            return Ok(());
        }

        let changed = pending.len();
        for (hash, delta) in pending {
            if delta == 0 {
                continue;
            }
            sqlx::query(
                "INSERT INTO copies (hash, refcount) VALUES (?, ?)
                 ON CONFLICT(hash) DO UPDATE SET refcount = refcount + excluded.refcount",
            )
            .bind(&hash)
            .bind(delta)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;

            self.delete_if_unreferenced(&hash).await?;
        }

        debug!(hashes = changed, "committed postponed copy reference changes");
        Ok(())
    }

    /// Discard postponed deltas without applying them
    pub fn clear_last_changes(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Garbage-sweep blob files on disk that have no refcount row
    ///
    /// Also removes transient `recent_copy_*` staging files left over from a
    /// previous run.
    pub async fn remove_copies_not_in_db(&self) -> Result<usize> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT hash FROM copies")
            .fetch_all(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;
        let known: std::collections::HashSet<String> = rows.into_iter().map(|r| r.0).collect();

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.copies_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(COPIES_DB_NAME) {
                continue;
            }

            let orphan_blob = is_hash_name(name) && !known.contains(name);
            let stale_staging = name.starts_with(RECENT_COPY_PREFIX);
            if orphan_blob || stale_staging {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        removed += 1;
                        debug!(name, "swept orphan copy file");
                    }
                    Err(e) => warn!(name, error = %e, "failed to sweep orphan copy file"),
                }
            }
        }

        if removed > 0 {
            info!(removed, "copies directory sweep complete");
        }
        Ok(removed)
    }

    /// Close the store's database pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn delete_if_unreferenced(&self, hash: &str) -> Result<()> {
        let count = self.refcount(hash).await?;
        if count > 0 {
            return Ok(());
        }

        sqlx::query("DELETE FROM copies WHERE hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await
            .map_err(crate::db::map_db_err)?;

        let blob = self.copy_path(hash);
        if blob.exists() {
            std::fs::remove_file(&blob)?;
        }
        let signature = self.signatures_dir.join(hash);
        if signature.exists() {
            std::fs::remove_file(&signature).ok();
        }

        info!(hash, "copy deleted");
        Ok(())
    }
}

// Content hashes are 32 lowercase hex chars; anything else in the directory
// is staging or database files.
fn is_hash_name(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const H1: &str = "0123456789abcdef0123456789abcdef";
    const H2: &str = "fedcba9876543210fedcba9876543210";

    async fn store(dir: &TempDir) -> CopiesStore {
        CopiesStore::open(&dir.path().join("copies"), &dir.path().join("signatures"))
            .await
            .unwrap()
    }

    fn materialize(store: &CopiesStore, hash: &str, content: &[u8]) {
        std::fs::write(store.copy_path(hash), content).unwrap();
    }

    #[tokio::test]
    async fn add_and_remove_track_refcounts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.add_copy_reference(H1, "test", false).await.unwrap();
        store.add_copy_reference(H1, "test", false).await.unwrap();
        assert_eq!(store.refcount(H1).await.unwrap(), 2);

        store.remove_copy_reference(H1, "test", false).await.unwrap();
        assert_eq!(store.refcount(H1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn refcount_zero_deletes_blob_and_signature() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.add_copy_reference(H1, "test", false).await.unwrap();
        materialize(&store, H1, b"content");
        std::fs::write(dir.path().join("signatures").join(H1), b"{}").unwrap();

        store.remove_copy_reference(H1, "test", false).await.unwrap();

        assert_eq!(store.refcount(H1).await.unwrap(), 0);
        assert!(!store.copy_path(H1).exists(), "blob removed at refcount 0");
        assert!(
            !dir.path().join("signatures").join(H1).exists(),
            "signature swept with the blob"
        );
    }

    #[tokio::test]
    async fn empty_file_hash_never_gets_a_row() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store
            .add_copy_reference(EMPTY_FILE_HASH, "test", false)
            .await
            .unwrap();
        assert_eq!(store.refcount(EMPTY_FILE_HASH).await.unwrap(), 0);
        assert!(store.copy_exists(EMPTY_FILE_HASH), "empty content always exists");
    }

    #[tokio::test]
    async fn postponed_changes_collapse_on_commit() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.add_copy_reference(H1, "a", true).await.unwrap();
        store.add_copy_reference(H1, "b", true).await.unwrap();
        store.remove_copy_reference(H1, "c", true).await.unwrap();
        store.add_copy_reference(H2, "d", true).await.unwrap();
        store.remove_copy_reference(H2, "e", true).await.unwrap();

        // nothing hits the database until commit
        assert_eq!(store.refcount(H1).await.unwrap(), 0);

        store.commit_last_changes().await.unwrap();

        assert_eq!(store.refcount(H1).await.unwrap(), 1);
        assert_eq!(store.refcount(H2).await.unwrap(), 0, "add+remove collapsed");
    }

    #[tokio::test]
    async fn clear_last_changes_discards_pending() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.add_copy_reference(H1, "a", true).await.unwrap();
        store.clear_last_changes();
        store.commit_last_changes().await.unwrap();

        assert_eq!(store.refcount(H1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_removes_orphans_and_staging_but_keeps_referenced() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.add_copy_reference(H1, "keep", false).await.unwrap();
        materialize(&store, H1, b"keep");
        materialize(&store, H2, b"orphan");
        std::fs::write(store.recent_copy_path(7), b"stale").unwrap();

        let removed = store.remove_copies_not_in_db().await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.copy_path(H1).exists());
        assert!(!store.copy_path(H2).exists());
        assert!(!store.recent_copy_path(7).exists());
    }

    #[tokio::test]
    async fn random_sequences_preserve_refcount_soundness() {
        use rand::Rng;

        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let mut rng = rand::thread_rng();
        let mut expected: i64 = 0;

        // Each batch runs either eagerly or postponed; postponed batches
        // commit as a unit, mirroring how the event queue uses the store.
        for _ in 0..20 {
            let postponed = rng.gen_bool(0.5);
            for _ in 0..10 {
                // bias toward adds so the count mostly stays positive
                if rng.gen_bool(0.6) {
                    store.add_copy_reference(H1, "prop", postponed).await.unwrap();
                    expected += 1;
                } else if expected > 0 {
                    store
                        .remove_copy_reference(H1, "prop", postponed)
                        .await
                        .unwrap();
                    expected -= 1;
                }
            }
            if postponed {
                store.commit_last_changes().await.unwrap();
            }
            assert_eq!(store.refcount(H1).await.unwrap(), expected);
        }
    }
}
